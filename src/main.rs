//! Blockwise CLI
//!
//! Tile a volume, fetch every block and run the built-in channel statistics.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockwise::pipeline::channel_stats;
use blockwise::{build_runtime, init_rayon, plan_blocks, run_parallel, Config};

#[derive(Parser)]
#[command(name = "blockwise")]
#[command(about = "Run per-block analyses over large 3-D volumes", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override worker count
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run channel statistics over every block (default if no command specified)
    Run {
        /// Write the batch report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print the block plan without fetching
    Plan,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => run_command(cli.config, cli.workers, None)?,
        Some(Commands::Run { report }) => run_command(cli.config, cli.workers, report)?,
        Some(Commands::Plan) => plan_command(cli.config)?,
        Some(Commands::Validate) => validate_command(cli.config)?,
        Some(Commands::GenerateConfig { output }) => generate_config_command(output)?,
    }

    Ok(())
}

fn load_config(config_path: &PathBuf, workers: Option<usize>) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;
    if let Some(w) = workers {
        config.processing.workers = Some(w);
    }
    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, workers: Option<usize>, report_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(&config_path, workers)?;

    init_rayon(config.processing.rayon_threads)?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    let report = runtime.block_on(run_parallel(&config, channel_stats))?;

    println!("{}", report);
    if let Some(path) = report_path {
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        println!("Batch report written to: {}", path.display());
    }

    if report.failed() > 0 {
        tracing::warn!(
            "{} blocks failed; rerun them from the report once the cause is fixed",
            report.failed()
        );
    }
    Ok(())
}

fn plan_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    let blocks = plan_blocks(&config)?;
    let bbox = config.query.bounding_box()?;
    let processing = &config.processing;

    println!("\n=== Block Plan ===");
    println!("Query: {}", bbox.extent());
    println!("Block shape (z, y, x): {:?}", processing.block_shape.as_array());
    println!("Halo (z, y, x): {:?}", processing.halo.as_array());
    println!("Blocks: {}", blocks.len());
    println!("Workers: {}", processing.resolved_workers());

    let voxels: usize = blocks.iter().map(|b| b.extent.num_voxels()).sum();
    println!("Voxels fetched per channel: {} ({:.2}x query)", voxels, voxels as f64 / bbox.extent().num_voxels().max(1) as f64);

    for block in blocks.iter().take(20) {
        println!("  {:<20} {}", block.key().to_string(), block.extent);
    }
    if blocks.len() > 20 {
        println!("  ... {} more", blocks.len() - 20);
    }
    println!("==================\n");
    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    let yaml = r#"# Blockwise Configuration

# === REMOTE: Where the volume is read from ===
remote:
  # Local directory, or s3://bucket/prefix
  store: "s3://volumes/root"

  # Custom S3 endpoint (for MinIO, LocalStack, etc.)
  # host: "http://localhost:9000"

  # Session token for S3 access (credentials otherwise come from the environment)
  # token: "..."

  region: "us-east-1"

  collection: "my_collection"
  experiment: "my_experiment"

  # Channels to fetch per block (empty = every channel)
  channels: ["em"]

# === QUERY: Region to process, [start, end) per axis ===
query:
  z_range: [0, 25]
  y_range: [0, 1000]
  x_range: [0, 1000]

# === PROCESSING ===
processing:
  # Target block shape in voxels
  block_shape:
    z: 10
    y: 1000
    x: 1000

  # Margin added around every block (clamped to the query)
  halo:
    z: 0
    y: 0
    x: 0

  # Number of workers (null = CPUs - 1)
  # workers: 8

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 16

  # Rayon thread pool size (null = num CPUs)
  # rayon_threads: 16

  # Retry configuration for transient read failures
  retry:
    max_retries: 3
    initial_backoff_ms: 100
    max_backoff_ms: 10000

  # Print progress during processing
  enable_metrics: true
  metrics_interval_secs: 10

  # metrics_output_path: "metrics.json"

# === OUTPUT: Block artifacts (optional; omit to keep results in memory) ===
# Choose ONE of: local_path OR bucket+prefix
# output:
#   local_path: "/tmp/blockwise-out"
#   # bucket: "output-bucket"
#   # prefix: "runs/stats"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["blockwise"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_with_config_and_workers() {
        let cli = Cli::try_parse_from(["blockwise", "-c", "other.yaml", "-w", "4"]).unwrap();
        assert_eq!(cli.workers, Some(4));
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
    }

    #[test]
    fn test_cli_parse_subcommands() {
        assert!(Cli::try_parse_from(["blockwise", "validate", "-c", "test.json"]).is_ok());
        assert!(Cli::try_parse_from(["blockwise", "plan"]).is_ok());

        let cli = Cli::try_parse_from(["blockwise", "run", "--report", "out.json"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run { report: Some(_) })));
    }

    #[test]
    fn test_generated_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.remote.channels, vec!["em".to_string()]);
        assert_eq!(plan_blocks(&config).unwrap().len(), 3);
    }
}
