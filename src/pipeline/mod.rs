//! Block pipeline: per-block jobs, the worker pool and metrics.
//!
//! A [`JobRunner`] turns one coordinate-only block into a [`BlockOutcome`];
//! a [`WorkerPool`] runs it over a whole plan and collects a [`BatchReport`].

pub mod job;
pub mod metrics;
pub mod pool;

pub use job::{
    channel_stats, Analysis, BlockFailure, BlockOutcome, BlockSuccess, ChannelSummary,
    FailureStage, JobOutput, JobRunner, Sink,
};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use pool::{BatchReport, WorkerPool};
