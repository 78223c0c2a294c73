//! Progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Metrics for a batch run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total bytes fetched from the data source (native type)
    pub bytes_fetched: AtomicU64,

    /// Blocks whose analysis completed
    pub blocks_succeeded: AtomicU64,

    /// Blocks that failed at any stage
    pub blocks_failed: AtomicU64,

    /// Requested channels skipped because the dataset lacks them
    pub channels_skipped: AtomicU64,

    /// Channel reads retried after a transient failure
    pub fetch_retries: AtomicU64,

    /// Artifacts written to the sink
    pub artifacts_written: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-stage timing (in microseconds for precision)
    /// Time spent fetching channels (microseconds)
    pub fetch_us: AtomicU64,

    /// Time spent in the analysis function (microseconds)
    pub analysis_us: AtomicU64,

    /// Time spent persisting artifacts (microseconds)
    pub persist_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_bytes_fetched(&self, bytes: u64) {
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_block_succeeded(&self) {
        self.blocks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_block_failed(&self) {
        self.blocks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_channels_skipped(&self, count: u64) {
        self.channels_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_fetch_retry(&self) {
        self.fetch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_artifact_written(&self) {
        self.artifacts_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent fetching (in microseconds).
    pub fn add_fetch_time(&self, duration: Duration) {
        self.fetch_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent analyzing (in microseconds).
    pub fn add_analysis_time(&self, duration: Duration) {
        self.analysis_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent persisting (in microseconds).
    pub fn add_persist_time(&self, duration: Duration) {
        self.persist_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get fetch throughput in GB/s.
    pub fn fetch_throughput_gbps(&self) -> f64 {
        let bytes = self.bytes_fetched.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (bytes as f64) / GIB / elapsed
        } else {
            0.0
        }
    }

    /// Get finished blocks (either outcome) per second.
    pub fn blocks_per_second(&self) -> f64 {
        let blocks = self.blocks_succeeded.load(Ordering::Relaxed)
            + self.blocks_failed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            blocks as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            blocks_succeeded: self.blocks_succeeded.load(Ordering::Relaxed),
            blocks_failed: self.blocks_failed.load(Ordering::Relaxed),
            channels_skipped: self.channels_skipped.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
            artifacts_written: self.artifacts_written.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            fetch_throughput_gbps: self.fetch_throughput_gbps(),
            blocks_per_second: self.blocks_per_second(),
            fetch_secs: self.fetch_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            analysis_secs: self.analysis_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            persist_secs: self.persist_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_fetched: u64,
    pub blocks_succeeded: u64,
    pub blocks_failed: u64,
    pub channels_skipped: u64,
    pub fetch_retries: u64,
    pub artifacts_written: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub fetch_throughput_gbps: f64,
    pub blocks_per_second: f64,
    /// Total time spent fetching (seconds, summed across workers)
    pub fetch_secs: f64,
    /// Total time spent analyzing (seconds, summed across workers)
    pub analysis_secs: f64,
    /// Total time spent persisting (seconds, summed across workers)
    pub persist_secs: f64,
}

impl MetricsSnapshot {
    /// Blocks finished, either way.
    pub fn blocks_done(&self) -> u64 {
        self.blocks_succeeded + self.blocks_failed
    }

    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_stage_time = self.fetch_secs + self.analysis_secs + self.persist_secs;
        let (fetch_pct, analysis_pct, persist_pct) = if total_stage_time > 0.0 {
            (
                self.fetch_secs / total_stage_time * 100.0,
                self.analysis_secs / total_stage_time * 100.0,
                self.persist_secs / total_stage_time * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Blocks: {} ok, {} failed | Skipped channels: {} | \
             Fetched: {:.2} GB @ {:.2} GB/s | Rate: {:.1} blocks/s | \
             Retries: {} | Artifacts: {} | Elapsed: {:.1}s | \
             Time: fetch {:.0}% analysis {:.0}% persist {:.0}%",
            self.blocks_succeeded,
            self.blocks_failed,
            self.channels_skipped,
            self.bytes_fetched as f64 / GIB,
            self.fetch_throughput_gbps,
            self.blocks_per_second,
            self.fetch_retries,
            self.artifacts_written,
            self.elapsed.as_secs_f64(),
            fetch_pct,
            analysis_pct,
            persist_pct,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_blocks: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_blocks: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_blocks,
        }
    }

    /// Start the periodic reporter. Returns after a shutdown signal.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_blocks > 0 {
                        snapshot.blocks_done() as f64 / self.total_blocks as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Batch Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Blocks planned: {}", self.total_blocks);
        println!("Blocks succeeded: {}", snapshot.blocks_succeeded);
        println!("Blocks failed: {}", snapshot.blocks_failed);
        println!("Channels skipped: {}", snapshot.channels_skipped);
        println!("Fetch retries: {}", snapshot.fetch_retries);
        println!("Data fetched: {:.2} GB", snapshot.bytes_fetched as f64 / GIB);
        println!("Artifacts written: {}", snapshot.artifacts_written);
        println!("Processing rate: {:.1} blocks/s", snapshot.blocks_per_second);

        let total_stage = snapshot.fetch_secs + snapshot.analysis_secs + snapshot.persist_secs;
        if total_stage > 0.0 {
            println!("\n--- Stage Time Breakdown ---");
            println!("Fetch:     {:>7.1}s ({:>5.1}%)", snapshot.fetch_secs, snapshot.fetch_secs / total_stage * 100.0);
            println!("Analysis:  {:>7.1}s ({:>5.1}%)", snapshot.analysis_secs, snapshot.analysis_secs / total_stage * 100.0);
            println!("Persist:   {:>7.1}s ({:>5.1}%)", snapshot.persist_secs, snapshot.persist_secs / total_stage * 100.0);
        }
        println!("=====================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_bytes_fetched(1000);
        metrics.add_bytes_fetched(500);

        assert_eq!(metrics.bytes_fetched.load(Ordering::Relaxed), 1500);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.add_block_succeeded();
        metrics.add_block_succeeded();
        metrics.add_block_failed();
        metrics.add_channels_skipped(3);
        metrics.add_fetch_retry();
        metrics.add_artifact_written();

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.blocks_succeeded, 2);
        assert_eq!(snapshot.blocks_failed, 1);
        assert_eq!(snapshot.blocks_done(), 3);
        assert_eq!(snapshot.channels_skipped, 3);
        assert_eq!(snapshot.fetch_retries, 1);
        assert_eq!(snapshot.artifacts_written, 1);
    }

    #[test]
    fn test_timing_metrics() {
        let metrics = Metrics::new();

        metrics.add_fetch_time(Duration::from_millis(100));
        metrics.add_analysis_time(Duration::from_millis(50));
        metrics.add_persist_time(Duration::from_millis(25));

        let snapshot = metrics.snapshot();

        assert!((snapshot.fetch_secs - 0.1).abs() < 0.001);
        assert!((snapshot.analysis_secs - 0.05).abs() < 0.001);
        assert!((snapshot.persist_secs - 0.025).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = MetricsSnapshot {
            bytes_fetched: 1024 * 1024 * 1024,
            blocks_succeeded: 100,
            blocks_failed: 2,
            channels_skipped: 4,
            fetch_retries: 7,
            artifacts_written: 100,
            elapsed: Duration::from_secs(10),
            fetch_throughput_gbps: 0.1,
            blocks_per_second: 10.2,
            fetch_secs: 5.0,
            analysis_secs: 3.0,
            persist_secs: 2.0,
        };

        let display = format!("{}", snapshot);

        assert!(display.contains("100 ok"));
        assert!(display.contains("2 failed"));
        assert!(display.contains("Skipped channels: 4"));
        assert!(display.contains("fetch 50%"));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };

        metrics.add_bytes_fetched(1000);

        assert_eq!(metrics.fetch_throughput_gbps(), 0.0);
        assert_eq!(metrics.blocks_per_second(), 0.0);
    }

    #[test]
    fn test_save_snapshot_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let metrics = Metrics::new();
        metrics.add_block_succeeded();

        metrics.snapshot().save_to_file(path.to_str().unwrap()).unwrap();

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["blocks_succeeded"], 1);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let metrics = Metrics::new();
        let reporter = MetricsReporter::new(metrics, 3600, 10);
        let (tx, rx) = mpsc::channel(1);

        let handle = tokio::spawn(reporter.run(rx));
        tx.send(()).await.unwrap();
        handle.await.unwrap();
    }
}
