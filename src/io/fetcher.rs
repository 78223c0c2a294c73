//! Attach channel data to blocks.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::io::source::{ChannelInfo, DataSource};
use crate::pipeline::metrics::Metrics;
use crate::tiling::{Block, Extent};
use crate::voxel::{ChannelArray, ChannelMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Requested channels split by whether the dataset offers them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSelection {
    /// Channels to fetch, with their native types
    pub available: Vec<ChannelInfo>,

    /// Requested names the dataset does not offer
    pub skipped: Vec<String>,
}

/// Resolve requested names against the dataset catalog.
///
/// An empty request selects every channel in the catalog.
pub fn select_channels(requested: &[String], catalog: &[ChannelInfo]) -> ChannelSelection {
    if requested.is_empty() {
        return ChannelSelection {
            available: catalog.to_vec(),
            skipped: Vec::new(),
        };
    }

    let mut selection = ChannelSelection::default();
    for name in requested {
        match catalog.iter().find(|c| &c.name == name) {
            Some(info) => {
                if !selection.available.iter().any(|c| c.name == info.name) {
                    selection.available.push(info.clone());
                }
            }
            None => selection.skipped.push(name.clone()),
        }
    }
    selection
}

/// Fetches the requested channels for a block.
#[derive(Debug, Clone)]
pub struct DataFetcher {
    channels: Vec<String>,
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
}

impl DataFetcher {
    pub fn new(channels: Vec<String>) -> Self {
        Self {
            channels,
            retry: RetryConfig::default(),
            metrics: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn requested(&self) -> &[String] {
        &self.channels
    }

    /// Fill `block.payload` with one array per available requested channel,
    /// in the channel's native type. Returns the requested names that were skipped.
    ///
    /// A channel that still fails after retries fails the whole fetch.
    pub async fn fetch<S: DataSource>(&self, source: &S, block: &mut Block) -> Result<Vec<String>> {
        let start = Instant::now();
        let catalog = source.list_channels().await?;
        let selection = select_channels(&self.channels, &catalog);

        if !selection.skipped.is_empty() {
            tracing::warn!(
                "Block {}: skipping channels not in dataset: {:?}",
                block.key(),
                selection.skipped
            );
            if let Some(m) = &self.metrics {
                m.add_channels_skipped(selection.skipped.len() as u64);
            }
        }

        let mut payload = ChannelMap::new();
        for info in &selection.available {
            let data = self.cutout_with_retry(source, info, &block.extent).await?;
            // Transport may widen the type; restore the native one.
            let data = data.cast(info.datatype);
            if let Some(m) = &self.metrics {
                m.add_bytes_fetched(data.nbytes() as u64);
            }
            payload.insert(info.name.clone(), data);
        }

        if let Some(m) = &self.metrics {
            m.add_fetch_time(start.elapsed());
        }
        block.payload = Some(payload);
        Ok(selection.skipped)
    }

    /// Read one channel, retrying transient store failures with exponential backoff.
    async fn cutout_with_retry<S: DataSource>(
        &self,
        source: &S,
        channel: &ChannelInfo,
        extent: &Extent,
    ) -> Result<ChannelArray> {
        let max_attempts = self.retry.max_retries.max(1);
        let mut attempt = 0;
        let mut backoff = self.retry.initial_backoff_ms;

        loop {
            match source.cutout(channel, extent).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    attempt += 1;
                    if !e.is_transient() || attempt >= max_attempts {
                        tracing::error!(
                            "Channel '{}' at {} failed after {} attempts: {}",
                            channel.name,
                            extent,
                            attempt,
                            e
                        );
                        return Err(match e {
                            Error::Fetch { .. } => e,
                            other => Error::fetch(&channel.name, other),
                        });
                    }

                    tracing::warn!(
                        "Channel '{}' at {} attempt {} failed: {}, retrying in {}ms",
                        channel.name,
                        extent,
                        attempt,
                        e,
                        backoff
                    );
                    if let Some(m) = &self.metrics {
                        m.add_fetch_retry();
                    }

                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff_ms);
                }
            }
        }
    }
}
