//! Fixed-size worker pool over a shared block queue.
//!
//! ```text
//!             ┌──────────┐
//! blocks ───▶ │  queue   │ ──▶ worker 0 (own source) ──┐
//!             │ (async-  │ ──▶ worker 1 (own source) ──┼──▶ results ──▶ BatchReport
//!             │ channel) │ ──▶ worker N (own source) ──┘
//!             └──────────┘
//! ```
//!
//! Per-block failures are outcomes. Infrastructure failures (a worker that
//! cannot connect, a worker task that dies, a closed result channel) abort
//! every worker and fail the batch with `Error::Pool`.

use crate::error::{Error, Result};
use crate::io::Connector;
use crate::pipeline::job::{Analysis, BlockFailure, BlockOutcome, BlockSuccess, JobOutput, JobRunner};
use crate::tiling::{Block, BlockKey};
use crate::transform::Merger;
use futures::stream::{FuturesUnordered, StreamExt};
use ndarray::ArrayD;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Runs a `JobRunner` over many blocks with a fixed number of workers.
pub struct WorkerPool<C: Connector, A: Analysis> {
    connector: Arc<C>,
    runner: JobRunner<A>,
    workers: usize,
}

impl<C: Connector, A: Analysis> WorkerPool<C, A> {
    pub fn new(connector: C, runner: JobRunner<A>, workers: usize) -> Self {
        Self {
            connector: Arc::new(connector),
            runner,
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Process every block. Completion order is unspecified; the report is keyed by block.
    pub async fn run(&self, blocks: Vec<Block>) -> Result<BatchReport<A::Output>> {
        if self.workers == 0 {
            return Err(Error::Pool("worker count must be > 0".to_string()));
        }

        let start = Instant::now();
        let total = blocks.len();
        let workers = self.workers.min(total.max(1));
        tracing::info!("Processing {} blocks with {} workers", total, workers);

        // Shared work queue, filled up front
        let (work_tx, work_rx) = async_channel::bounded::<Block>(total.max(1));
        for block in blocks {
            work_tx
                .send(block)
                .await
                .map_err(|_| Error::Pool("work queue closed before dispatch".to_string()))?;
        }
        work_tx.close();

        let (result_tx, mut result_rx) = mpsc::channel::<BlockOutcome<A::Output>>(workers * 2);

        let mut pending = FuturesUnordered::new();
        let mut abort_handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let connector = self.connector.clone();
            let runner = self.runner.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();

            let handle = tokio::spawn(async move {
                let source = connector.connect().map_err(|e| {
                    Error::Pool(format!("worker {} failed to connect: {}", worker_id, e))
                })?;
                tracing::debug!("Worker {} connected", worker_id);

                let mut processed = 0usize;
                while let Ok(block) = work_rx.recv().await {
                    let outcome = runner.run(&source, block).await;
                    if result_tx.send(outcome).await.is_err() {
                        return Err(Error::Pool(format!(
                            "worker {}: result channel closed",
                            worker_id
                        )));
                    }
                    processed += 1;
                }

                tracing::debug!("Worker {} finished after {} blocks", worker_id, processed);
                Ok::<_, Error>(processed)
            });

            abort_handles.push(handle.abort_handle());
            pending.push(handle);
        }
        drop(result_tx);

        let mut outcomes = BTreeMap::new();
        let abort_all = |reason: &Error| {
            tracing::error!("Aborting batch: {}", reason);
            for h in &abort_handles {
                h.abort();
            }
        };

        loop {
            tokio::select! {
                Some(outcome) = result_rx.recv() => {
                    outcomes.insert(outcome.key(), outcome);
                }
                Some(joined) = pending.next() => {
                    let err = match joined {
                        Ok(Ok(_)) => continue,
                        Ok(Err(e)) => e,
                        Err(e) => Error::Pool(format!("worker task failed: {}", e)),
                    };
                    abort_all(&err);
                    return Err(err);
                }
                else => break,
            }
        }

        if outcomes.len() != total {
            return Err(Error::Pool(format!(
                "expected {} outcomes, received {}",
                total,
                outcomes.len()
            )));
        }

        let report = BatchReport {
            outcomes,
            elapsed: start.elapsed(),
        };
        tracing::info!("{}", report.summary_line());
        Ok(report)
    }
}

/// Outcome of every block in a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport<R> {
    outcomes: BTreeMap<BlockKey, BlockOutcome<R>>,
    #[serde(skip)]
    elapsed: Duration,
}

impl<R> BatchReport<R> {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn get(&self, key: &BlockKey) -> Option<&BlockOutcome<R>> {
        self.outcomes.get(key)
    }

    pub fn outcomes(&self) -> &BTreeMap<BlockKey, BlockOutcome<R>> {
        &self.outcomes
    }

    pub fn successes(&self) -> impl Iterator<Item = &BlockSuccess<R>> {
        self.outcomes.values().filter_map(BlockOutcome::success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &BlockFailure> {
        self.outcomes.values().filter_map(BlockOutcome::failure)
    }

    pub fn succeeded(&self) -> usize {
        self.successes().count()
    }

    pub fn failed(&self) -> usize {
        self.failures().count()
    }

    /// Blocks to resubmit, rebuilt from the failed outcomes.
    pub fn failed_blocks(&self) -> Vec<Block> {
        self.failures()
            .map(|f| Block::padded(f.core, f.extent))
            .collect()
    }

    /// In-memory outputs by key.
    pub fn outputs(&self) -> BTreeMap<BlockKey, &R> {
        self.successes()
            .filter_map(|s| match &s.output {
                JobOutput::InMemory(r) => Some((s.key, r)),
                JobOutput::Persisted { .. } => None,
            })
            .collect()
    }

    fn summary_line(&self) -> String {
        format!(
            "{} blocks: {} succeeded, {} failed in {:.2}s",
            self.len(),
            self.succeeded(),
            self.failed(),
            self.elapsed.as_secs_f64()
        )
    }
}

impl<T: Clone + Default> BatchReport<ArrayD<T>> {
    /// Assemble every in-memory output into one array, placing each at its block's extent.
    pub fn merge(&self, full_shape: &[usize]) -> Result<ArrayD<T>> {
        let mut merger = Merger::new(full_shape)?;
        for success in self.successes() {
            if let JobOutput::InMemory(array) = &success.output {
                merger.insert_extent(&success.extent, array)?;
            }
        }
        Ok(merger.finish())
    }
}

impl<R> fmt::Display for BatchReport<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary_line())?;
        for failure in self.failures() {
            writeln!(
                f,
                "  {} failed at {}: {}",
                failure.key, failure.stage, failure.message
            )?;
        }
        let skipped: usize = self.successes().map(|s| s.skipped_channels.len()).sum();
        if skipped > 0 {
            writeln!(f, "  {} channel fetches skipped (not in dataset)", skipped)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockShape;
    use crate::io::{DataFetcher, MemoryConnector, MemorySource};
    use crate::pipeline::job::Sink;
    use crate::tiling::{tile, BoundingBox};
    use crate::voxel::{ChannelArray, ChannelMap};
    use ndarray::Array3;

    fn connector() -> MemoryConnector {
        let mut channels = BTreeMap::new();
        channels.insert(
            "em".to_string(),
            ChannelArray::Uint16(Array3::from_shape_fn([20, 8, 8], |(z, y, x)| (z * 64 + y * 8 + x) as u16)),
        );
        MemoryConnector::new(MemorySource::new(channels).unwrap())
    }

    fn blocks() -> Vec<Block> {
        let bbox = BoundingBox::new((0, 20), (0, 8), (0, 8)).unwrap();
        tile(&bbox, BlockShape::new(5, 4, 4)).unwrap()
    }

    fn first_voxel(data: &ChannelMap) -> anyhow::Result<f64> {
        let em = data.get("em").ok_or_else(|| anyhow::anyhow!("missing em"))?;
        Ok(em.to_f64()[[0, 0, 0]])
    }

    #[tokio::test]
    async fn test_pool_processes_every_block() {
        let runner = JobRunner::new(DataFetcher::new(vec![]), first_voxel, Sink::Memory);
        let pool = WorkerPool::new(connector(), runner, 3);

        let report = pool.run(blocks()).await.unwrap();
        assert_eq!(report.len(), 16);
        assert_eq!(report.succeeded(), 16);
        assert_eq!(report.failed(), 0);

        let outputs = report.outputs();
        assert_eq!(*outputs[&BlockKey::new(5, 4, 0)], (5 * 64 + 4 * 8) as f64);
    }

    #[tokio::test]
    async fn test_zero_workers_is_pool_error() {
        let runner = JobRunner::new(DataFetcher::new(vec![]), first_voxel, Sink::Memory);
        let pool = WorkerPool::new(connector(), runner, 0);
        assert!(matches!(pool.run(blocks()).await, Err(Error::Pool(_))));
    }

    struct BrokenConnector;

    impl Connector for BrokenConnector {
        type Source = MemorySource;

        fn connect(&self) -> Result<MemorySource> {
            Err(Error::Pool("auth refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_connector_failure_aborts_batch() {
        let runner = JobRunner::new(DataFetcher::new(vec![]), first_voxel, Sink::Memory);
        let pool = WorkerPool::new(BrokenConnector, runner, 2);
        let err = pool.run(blocks()).await.unwrap_err();
        assert!(err.to_string().contains("failed to connect"));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let runner = JobRunner::new(DataFetcher::new(vec![]), first_voxel, Sink::Memory);
        let pool = WorkerPool::new(connector(), runner, 4);
        let report = pool.run(Vec::new()).await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_report_display_lists_failures() {
        let fails_at_z10 = |data: &ChannelMap| -> anyhow::Result<f64> {
            let v = first_voxel(data)?;
            if v == (10 * 64) as f64 {
                anyhow::bail!("bad block");
            }
            Ok(v)
        };
        let runner = JobRunner::new(DataFetcher::new(vec![]), fails_at_z10, Sink::Memory);
        let report = WorkerPool::new(connector(), runner, 2).run(blocks()).await.unwrap();

        assert_eq!(report.failed(), 1);
        let text = report.to_string();
        assert!(text.contains("16 blocks: 15 succeeded, 1 failed"));
        assert!(text.contains("10_0_0 failed at analysis"));

        let retry = report.failed_blocks();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].key(), BlockKey::new(10, 0, 0));
    }

    #[tokio::test]
    async fn test_report_merge_by_extent() {
        let as_array = |data: &ChannelMap| -> anyhow::Result<ArrayD<f64>> {
            let em = data.get("em").ok_or_else(|| anyhow::anyhow!("missing em"))?;
            Ok(em.to_f64().into_dyn())
        };
        let runner = JobRunner::new(DataFetcher::new(vec![]), as_array, Sink::Memory);
        let report = WorkerPool::new(connector(), runner, 2).run(blocks()).await.unwrap();

        let merged = report.merge(&[20, 8, 8]).unwrap();
        assert_eq!(merged[[13, 6, 2]], (13 * 64 + 6 * 8 + 2) as f64);
    }
}
