//! Blockwise
//!
//! Tile a large 3-D volume into blocks, fetch per-block channel data from a
//! remote store and run an analysis on every block across a worker pool.
//!
//! # Architecture
//!
//! - **Tiling**: bounding box to non-overlapping (optionally padded) blocks
//! - **I/O**: data sources over `object_store`, channel fetching, artifact sink
//! - **Pipeline**: per-block jobs, worker pool, metrics
//! - **Transform**: merging block outputs back into a full array
//!
//! # Usage
//!
//! ```no_run
//! use blockwise::{run_parallel, Config};
//! use blockwise::voxel::ChannelMap;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let report = run_parallel(&config, |data: &ChannelMap| -> anyhow::Result<usize> {
//!         Ok(data.len())
//!     })
//!     .await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod tiling;
pub mod transform;
pub mod voxel;

pub use config::{BlockShape, Config, Halo};
pub use error::Error;
pub use io::{Connector, DataSource, StoreConnector};
pub use pipeline::{Analysis, BatchReport, BlockOutcome, JobRunner, Metrics, WorkerPool};
pub use tiling::{Block, BlockKey, BoundingBox, Tiler};

use anyhow::Result;
use io::{ArtifactStore, DataFetcher, S3Options};
use pipeline::{MetricsReporter, Sink};
use tokio::sync::mpsc;

/// Tile the configured query box.
pub fn plan_blocks(config: &Config) -> Result<Vec<Block>> {
    let bbox = config.query.bounding_box()?;
    let tiler = Tiler::new(config.processing.block_shape)?;
    let halo = config.processing.halo;
    let blocks = if halo.is_zero() {
        tiler.tile(&bbox)?
    } else {
        tiler.tile_padded(&bbox, halo)?
    };
    Ok(blocks)
}

/// Open the configured remote experiment.
pub fn connect_remote(config: &Config) -> Result<StoreConnector> {
    let remote = &config.remote;
    let (store, prefix) = io::create_store(&remote.store, &S3Options::from_remote(remote))?;
    let root = io::experiment_path(&prefix, &remote.collection, &remote.experiment);
    tracing::info!("Reading {}/{} from {}", remote.collection, remote.experiment, remote.store);
    Ok(StoreConnector::new(store, root))
}

/// Open the configured artifact sink, or keep outputs in memory.
pub fn create_sink(config: &Config) -> Result<Sink> {
    match &config.output {
        Some(output) => {
            let options = S3Options::from_remote(&config.remote);
            let (store, prefix) = io::create_output_store(output, &options)?;
            tracing::info!("Writing block artifacts to: {}", output.path_display());
            Ok(Sink::Store(ArtifactStore::new(store, prefix)))
        }
        None => Ok(Sink::Memory),
    }
}

/// Run `analysis` over every block of the configured query against the remote store.
pub async fn run_parallel<A: Analysis>(config: &Config, analysis: A) -> Result<BatchReport<A::Output>> {
    config.validate()?;
    let connector = connect_remote(config)?;
    let sink = create_sink(config)?;
    run_with_connector(config, connector, analysis, sink).await
}

/// Run a batch through any `Connector`.
///
/// The coordinator connects once to read the catalog and extent and to reject
/// an out-of-extent query before any block is dispatched.
pub async fn run_with_connector<C, A>(
    config: &Config,
    connector: C,
    analysis: A,
    sink: Sink,
) -> Result<BatchReport<A::Output>>
where
    C: Connector,
    A: Analysis,
{
    config.validate()?;
    tracing::info!("Starting blockwise batch");

    let coordinator = connector.connect()?;
    let catalog = coordinator.list_channels().await?;
    let extent = coordinator.dataset_extent().await?;
    tracing::info!(
        "Dataset extent {:?} with {} channels: {:?}",
        extent.max,
        catalog.len(),
        catalog.iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
    );

    let bbox = config.query.bounding_box()?;
    bbox.check_within(&extent)?;

    let blocks = plan_blocks(config)?;
    let total_blocks = blocks.len() as u64;
    let processing = &config.processing;
    let workers = processing.resolved_workers();
    tracing::info!(
        "Planned {} blocks of {:?} (halo {:?}) over {}",
        total_blocks,
        processing.block_shape.as_array(),
        processing.halo.as_array(),
        bbox.extent()
    );

    let metrics = Metrics::new();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let reporter_handle = if processing.enable_metrics {
        let reporter = MetricsReporter::new(metrics.clone(), processing.metrics_interval_secs, total_blocks);
        Some(tokio::spawn(reporter.run(shutdown_rx)))
    } else {
        None
    };

    let fetcher = DataFetcher::new(config.remote.channels.clone())
        .with_retry(processing.retry.clone())
        .with_metrics(metrics.clone());
    let runner = JobRunner::new(fetcher, analysis, sink).with_metrics(metrics.clone());
    let pool = WorkerPool::new(connector, runner, workers);

    let result = pool.run(blocks).await;

    let _ = shutdown_tx.send(()).await;
    if let Some(handle) = reporter_handle {
        let _ = handle.await;
    }

    let report = result?;

    if let Some(path) = &processing.metrics_output_path {
        metrics.snapshot().save_to_file(path)?;
    }
    if processing.enable_metrics {
        MetricsReporter::new(metrics, processing.metrics_interval_secs, total_blocks).print_summary();
    }

    Ok(report)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
