//! Per-block job: fetch, analyze, persist or return.

use crate::error::Error;
use crate::io::{ArtifactStore, DataFetcher, DataSource};
use crate::pipeline::metrics::Metrics;
use crate::tiling::{Block, BlockKey, Extent};
use crate::voxel::ChannelMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// A user computation over one block's channel data.
///
/// Any `Fn(&ChannelMap) -> anyhow::Result<R>` is an analysis.
pub trait Analysis: Send + Sync + 'static {
    type Output: Serialize + Send + Sync + 'static;

    fn analyze(&self, data: &ChannelMap) -> anyhow::Result<Self::Output>;
}

impl<F, R> Analysis for F
where
    F: Fn(&ChannelMap) -> anyhow::Result<R> + Send + Sync + 'static,
    R: Serialize + Send + Sync + 'static,
{
    type Output = R;

    fn analyze(&self, data: &ChannelMap) -> anyhow::Result<R> {
        self(data)
    }
}

/// Summary statistics of one channel within a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub voxels: usize,
    pub nonzero: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Built-in analysis: per-channel voxel statistics.
pub fn channel_stats(data: &ChannelMap) -> anyhow::Result<BTreeMap<String, ChannelSummary>> {
    let mut out = BTreeMap::new();
    for (name, array) in data.iter() {
        let values = array.to_f64();
        let voxels = values.len();
        let summary = if voxels == 0 {
            ChannelSummary {
                voxels: 0,
                nonzero: 0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            }
        } else {
            ChannelSummary {
                voxels,
                nonzero: values.iter().filter(|v| **v != 0.0).count(),
                min: values.fold(f64::INFINITY, |a, &b| a.min(b)),
                max: values.fold(f64::NEG_INFINITY, |a, &b| a.max(b)),
                mean: values.sum() / voxels as f64,
            }
        };
        out.insert(name.to_string(), summary);
    }
    Ok(out)
}

/// Where successful outputs go.
#[derive(Debug, Clone)]
pub enum Sink {
    /// Return outputs in the batch report
    Memory,

    /// Persist one artifact per block
    Store(ArtifactStore),
}

/// Stage at which a block failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Fetch,
    Analysis,
    Persist,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureStage::Fetch => "fetch",
            FailureStage::Analysis => "analysis",
            FailureStage::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// Output of a completed block.
#[derive(Debug, Clone, Serialize)]
pub enum JobOutput<R> {
    InMemory(R),
    Persisted { location: String, bytes: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockSuccess<R> {
    pub key: BlockKey,
    /// Fetched extent (padded when a halo was used)
    pub extent: Extent,
    /// Unpadded tile
    pub core: Extent,
    pub output: JobOutput<R>,
    /// Requested channels the dataset did not offer
    pub skipped_channels: Vec<String>,
}

impl<R> BlockSuccess<R> {
    /// Skipped channels as fetch errors.
    pub fn fetch_warnings(&self) -> Vec<Error> {
        self.skipped_channels
            .iter()
            .map(|name| Error::fetch(name, "channel not available in dataset"))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockFailure {
    pub key: BlockKey,
    pub extent: Extent,
    pub core: Extent,
    pub stage: FailureStage,
    pub message: String,
}

/// Result of running one block.
#[derive(Debug, Clone, Serialize)]
pub enum BlockOutcome<R> {
    Completed(BlockSuccess<R>),
    Failed(BlockFailure),
}

impl<R> BlockOutcome<R> {
    pub fn key(&self) -> BlockKey {
        match self {
            BlockOutcome::Completed(s) => s.key,
            BlockOutcome::Failed(f) => f.key,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BlockOutcome::Completed(_))
    }

    pub fn success(&self) -> Option<&BlockSuccess<R>> {
        match self {
            BlockOutcome::Completed(s) => Some(s),
            BlockOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&BlockFailure> {
        match self {
            BlockOutcome::Completed(_) => None,
            BlockOutcome::Failed(f) => Some(f),
        }
    }
}

/// Runs the fetch, analyze and sink steps for single blocks.
pub struct JobRunner<A: Analysis> {
    fetcher: DataFetcher,
    analysis: Arc<A>,
    sink: Sink,
    metrics: Option<Arc<Metrics>>,
}

impl<A: Analysis> Clone for JobRunner<A> {
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            analysis: self.analysis.clone(),
            sink: self.sink.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<A: Analysis> JobRunner<A> {
    pub fn new(fetcher: DataFetcher, analysis: A, sink: Sink) -> Self {
        Self {
            fetcher,
            analysis: Arc::new(analysis),
            sink,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Process one block. Never fails: errors become a `Failed` outcome.
    pub async fn run<S: DataSource>(&self, source: &S, mut block: Block) -> BlockOutcome<A::Output> {
        let key = block.key();
        let (extent, core) = (block.extent, block.core);
        let fail = |stage: FailureStage, message: String| {
            tracing::warn!("Block {} failed at {}: {}", key, stage, message);
            if let Some(m) = &self.metrics {
                m.add_block_failed();
            }
            BlockOutcome::Failed(BlockFailure {
                key,
                extent,
                core,
                stage,
                message,
            })
        };

        tracing::debug!("Block {}: fetching {}", key, extent);
        let skipped_channels = match self.fetcher.fetch(source, &mut block).await {
            Ok(skipped) => skipped,
            Err(e) => return fail(FailureStage::Fetch, e.to_string()),
        };

        let payload = block.take_payload().unwrap_or_default();
        let analysis = self.analysis.clone();
        let start = Instant::now();

        // The payload moves into the blocking task and is dropped when the analysis returns.
        let result = tokio::task::spawn_blocking(move || analysis.analyze(&payload)).await;
        if let Some(m) = &self.metrics {
            m.add_analysis_time(start.elapsed());
        }

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let err = Error::Analysis {
                    key,
                    message: format!("{:#}", e),
                };
                return fail(FailureStage::Analysis, err.to_string());
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    format!("panicked: {}", panic_message(join_err.into_panic()))
                } else {
                    join_err.to_string()
                };
                let err = Error::Analysis { key, message };
                return fail(FailureStage::Analysis, err.to_string());
            }
        };

        let output = match &self.sink {
            Sink::Memory => JobOutput::InMemory(output),
            Sink::Store(store) => {
                let start = Instant::now();
                match store.persist(&key, &output).await {
                    Ok((location, bytes)) => {
                        if let Some(m) = &self.metrics {
                            m.add_persist_time(start.elapsed());
                            m.add_artifact_written();
                        }
                        JobOutput::Persisted {
                            location: location.to_string(),
                            bytes,
                        }
                    }
                    Err(e) => return fail(FailureStage::Persist, e.to_string()),
                }
            }
        };

        if let Some(m) = &self.metrics {
            m.add_block_succeeded();
        }
        tracing::debug!("Block {} completed", key);

        BlockOutcome::Completed(BlockSuccess {
            key,
            extent,
            core,
            output,
            skipped_channels,
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemorySource;
    use crate::voxel::ChannelArray;
    use ndarray::Array3;
    use object_store::memory::InMemory;
    use object_store::path::Path;

    fn source() -> MemorySource {
        let mut channels = std::collections::BTreeMap::new();
        channels.insert(
            "em".to_string(),
            ChannelArray::Uint8(Array3::from_shape_fn([4, 4, 4], |(z, _, _)| z as u8)),
        );
        MemorySource::new(channels).unwrap()
    }

    fn block() -> Block {
        Block::new(Extent::from_ranges((1, 3), (0, 4), (0, 4)).unwrap())
    }

    fn voxel_count(data: &ChannelMap) -> anyhow::Result<usize> {
        Ok(data.get("em").map(ChannelArray::len).unwrap_or(0))
    }

    #[test]
    fn test_channel_stats() {
        let mut data = ChannelMap::new();
        data.insert("em", ChannelArray::Uint8(Array3::from_shape_vec([1, 1, 4], vec![0, 2, 4, 6]).unwrap()));

        let stats = channel_stats(&data).unwrap();
        let em = &stats["em"];
        assert_eq!(em.voxels, 4);
        assert_eq!(em.nonzero, 3);
        assert_eq!(em.min, 0.0);
        assert_eq!(em.max, 6.0);
        assert_eq!(em.mean, 3.0);
    }

    #[tokio::test]
    async fn test_run_in_memory() {
        let metrics = Metrics::new();
        let runner = JobRunner::new(DataFetcher::new(vec![]), voxel_count, Sink::Memory)
            .with_metrics(metrics.clone());

        let outcome = runner.run(&source(), block()).await;
        assert_eq!(outcome.key(), BlockKey::new(1, 0, 0));
        match outcome {
            BlockOutcome::Completed(s) => {
                assert!(matches!(s.output, JobOutput::InMemory(32)));
                assert!(s.skipped_channels.is_empty());
            }
            BlockOutcome::Failed(f) => panic!("unexpected failure: {}", f.message),
        }
        assert_eq!(metrics.snapshot().blocks_succeeded, 1);
    }

    #[tokio::test]
    async fn test_analysis_error_becomes_failed_outcome() {
        let failing = |_: &ChannelMap| -> anyhow::Result<()> { anyhow::bail!("bad input") };
        let runner = JobRunner::new(DataFetcher::new(vec![]), failing, Sink::Memory);

        let outcome = runner.run(&source(), block()).await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.stage, FailureStage::Analysis);
        assert!(failure.message.contains("1_0_0"));
        assert!(failure.message.contains("bad input"));
    }

    #[tokio::test]
    async fn test_analysis_panic_is_contained() {
        let panicking = |_: &ChannelMap| -> anyhow::Result<()> { panic!("kaboom") };
        let runner = JobRunner::new(DataFetcher::new(vec![]), panicking, Sink::Memory);

        let outcome = runner.run(&source(), block()).await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.stage, FailureStage::Analysis);
        assert!(failure.message.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_fetch_failure_stage() {
        let runner = JobRunner::new(DataFetcher::new(vec![]), voxel_count, Sink::Memory);
        let outside = Block::new(Extent::from_ranges((0, 9), (0, 4), (0, 4)).unwrap());

        let outcome = runner.run(&source(), outside).await;
        assert_eq!(outcome.failure().unwrap().stage, FailureStage::Fetch);
    }

    #[tokio::test]
    async fn test_persisted_output() {
        let artifacts = ArtifactStore::new(Arc::new(InMemory::new()), Path::from("out"));
        let runner = JobRunner::new(
            DataFetcher::new(vec!["em".to_string(), "ghost".to_string()]),
            channel_stats,
            Sink::Store(artifacts.clone()),
        );

        let outcome = runner.run(&source(), block()).await;
        let success = outcome.success().unwrap();
        match &success.output {
            JobOutput::Persisted { location, .. } => assert_eq!(location, "out/1_0_0"),
            JobOutput::InMemory(_) => panic!("expected a persisted artifact"),
        }
        assert_eq!(success.skipped_channels, vec!["ghost".to_string()]);
        assert!(matches!(success.fetch_warnings()[0], Error::Fetch { .. }));

        let stats: BTreeMap<String, ChannelSummary> = artifacts.load(&BlockKey::new(1, 0, 0)).await.unwrap();
        assert_eq!(stats["em"].min, 1.0);
        assert_eq!(stats["em"].max, 2.0);
    }
}
