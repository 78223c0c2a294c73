//! Configuration for the blockwise pipeline.

use crate::error::Error;
use crate::tiling::BoundingBox;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for a blockwise run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the volume is read from
    pub remote: RemoteConfig,

    /// Region to process
    pub query: QueryConfig,

    /// Tiling and worker configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Optional artifact sink. Without it results are kept in memory.
    #[serde(default)]
    pub output: Option<OutputConfig>,
}

/// Remote data service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Store root: a local directory or `s3://bucket/prefix`
    pub store: String,

    /// Custom endpoint for S3-compatible services
    #[serde(default)]
    pub host: Option<String>,

    /// Session token for S3 access
    #[serde(default)]
    pub token: Option<String>,

    /// Region for S3 access
    #[serde(default = "default_region")]
    pub region: String,

    /// Collection name
    pub collection: String,

    /// Experiment name
    pub experiment: String,

    /// Channels to fetch per block. Empty means every channel in the experiment.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl RemoteConfig {
    /// Check if the store root is on S3.
    pub fn is_s3(&self) -> bool {
        self.store.starts_with("s3://")
    }
}

/// Query bounding box, as `[start, end)` pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub z_range: [usize; 2],
    pub y_range: [usize; 2],
    pub x_range: [usize; 2],
}

impl QueryConfig {
    /// Build the bounding box, rejecting inverted ranges.
    pub fn bounding_box(&self) -> Result<BoundingBox, Error> {
        BoundingBox::new(
            (self.z_range[0], self.z_range[1]),
            (self.y_range[0], self.y_range[1]),
            (self.x_range[0], self.x_range[1]),
        )
    }
}

/// Target block shape in voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockShape {
    #[serde(default = "default_block_z")]
    pub z: usize,

    #[serde(default = "default_block_xy")]
    pub y: usize,

    #[serde(default = "default_block_xy")]
    pub x: usize,
}

impl BlockShape {
    pub fn new(z: usize, y: usize, x: usize) -> Self {
        Self { z, y, x }
    }

    pub fn as_array(&self) -> [usize; 3] {
        [self.z, self.y, self.x]
    }

    pub fn num_voxels(&self) -> usize {
        self.z * self.y * self.x
    }
}

impl Default for BlockShape {
    fn default() -> Self {
        Self {
            z: 10,
            y: 1000,
            x: 1000,
        }
    }
}

/// Margin added around each block on both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Halo {
    #[serde(default)]
    pub z: usize,

    #[serde(default)]
    pub y: usize,

    #[serde(default)]
    pub x: usize,
}

impl Halo {
    pub fn new(z: usize, y: usize, x: usize) -> Self {
        Self { z, y, x }
    }

    pub fn as_array(&self) -> [usize; 3] {
        [self.z, self.y, self.x]
    }

    pub fn is_zero(&self) -> bool {
        self.z == 0 && self.y == 0 && self.x == 0
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Target block shape
    #[serde(default)]
    pub block_shape: BlockShape,

    /// Halo for overlap-aware analyses
    #[serde(default)]
    pub halo: Halo,

    /// Number of workers (default: available parallelism minus one)
    #[serde(default)]
    pub workers: Option<usize>,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for in-memory splitting
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Retry configuration for channel reads
    #[serde(default)]
    pub retry: RetryConfig,

    /// Enable periodic progress reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            block_shape: BlockShape::default(),
            halo: Halo::default(),
            workers: None,
            worker_threads: None,
            rayon_threads: None,
            retry: RetryConfig::default(),
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        }
    }
}

impl ProcessingConfig {
    /// Resolve the worker count: configured value, else available cores minus one.
    pub fn resolved_workers(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count)
    }
}

/// Available parallelism minus one, never below one.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Retry configuration for transient read failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per channel read
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
        }
    }
}

/// Artifact sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Local directory for block artifacts.
    /// Mutually exclusive with bucket/prefix.
    #[serde(default)]
    pub local_path: Option<String>,

    /// S3 bucket for block artifacts
    #[serde(default)]
    pub bucket: Option<String>,

    /// S3 key prefix for block artifacts
    #[serde(default)]
    pub prefix: Option<String>,
}

impl OutputConfig {
    /// Get the output path as a display string (local path or s3:// URI).
    pub fn path_display(&self) -> String {
        if let Some(path) = &self.local_path {
            path.clone()
        } else {
            format!(
                "s3://{}/{}",
                self.bucket.as_deref().unwrap_or(""),
                self.prefix.as_deref().unwrap_or("")
            )
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validate the configuration before any work starts.
    pub fn validate(&self) -> Result<(), Error> {
        if self.remote.collection.is_empty() || self.remote.experiment.is_empty() {
            return Err(Error::config("collection and experiment must be set"));
        }
        if self.remote.store.is_empty() {
            return Err(Error::config("remote store must be set"));
        }

        self.query.bounding_box()?;

        let shape = self.processing.block_shape;
        if shape.z == 0 || shape.y == 0 || shape.x == 0 {
            return Err(Error::config(format!(
                "block shape must be positive on every axis, got {:?}",
                shape.as_array()
            )));
        }
        if self.processing.workers == Some(0) {
            return Err(Error::config("workers must be > 0"));
        }
        if self.processing.metrics_interval_secs == 0 {
            return Err(Error::config("metrics interval must be > 0"));
        }

        if let Some(output) = &self.output {
            match (&output.local_path, &output.bucket, &output.prefix) {
                (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                    return Err(Error::config(
                        "cannot specify both local_path and bucket/prefix",
                    ));
                }
                (None, None, _) | (None, _, None) => {
                    return Err(Error::config(
                        "must specify either local_path or both bucket and prefix",
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_region() -> String { "us-east-1".to_string() }
fn default_block_z() -> usize { 10 }
fn default_block_xy() -> usize { 1000 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_max_retries() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10000 }
