//! Object store configuration for S3, local filesystem and in-memory access.
//!
//! Remote volumes and block artifacts both go through `object_store`, so the
//! same client tuning applies to reads and writes.

use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    without_scheme
        .split_once('/')
        .with_context(|| format!("Invalid S3 URI: expected 's3://bucket/key' format in '{}'", uri))
}

/// S3 connection settings.
#[derive(Debug, Clone, Default)]
pub struct S3Options {
    /// Custom endpoint, for S3-compatible services
    pub host: Option<String>,

    /// Session token
    pub token: Option<String>,

    pub region: Option<String>,
}

impl S3Options {
    pub fn from_remote(remote: &crate::config::RemoteConfig) -> Self {
        Self {
            host: remote.host.clone(),
            token: remote.token.clone(),
            region: Some(remote.region.clone()),
        }
    }
}

/// Client options for many concurrent block reads.
fn create_client_options(allow_http: bool) -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(60))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(64)
        .with_allow_http(allow_http)
}

/// Retry configuration for transient failures at the HTTP layer.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        // Initial backoff (doubles each retry)
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an S3 client.
///
/// Credentials not given in `options` are loaded from the environment,
/// AWS config files or the instance profile.
fn create_s3_store(bucket: &str, options: &S3Options) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating S3 client for bucket: {}", bucket);

    let allow_http = options
        .host
        .as_deref()
        .is_some_and(|h| h.starts_with("http://"));

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options(allow_http))
        .with_retry(create_retry_config());

    if let Some(region) = &options.region {
        builder = builder.with_region(region);
    }
    if let Some(host) = &options.host {
        builder = builder
            .with_endpoint(host)
            .with_virtual_hosted_style_request(false);
    }
    if let Some(token) = &options.token {
        builder = builder.with_token(token);
    }

    Ok(Arc::new(builder.build()?))
}

/// Open a store for a location string and return it with the key prefix to use.
///
/// - `s3://bucket/prefix` opens an S3 client; the prefix is returned.
/// - `memory://` opens an empty in-memory store.
/// - anything else is a local directory, created if missing; the prefix is empty.
pub fn create_store(location: &str, options: &S3Options) -> Result<(Arc<dyn ObjectStore>, Path)> {
    if location.starts_with("s3://") {
        let (bucket, key) = match parse_s3_uri(location) {
            Ok(parts) => parts,
            // Bucket root
            Err(_) => (location.trim_start_matches("s3://").trim_end_matches('/'), ""),
        };
        if bucket.is_empty() {
            anyhow::bail!("Invalid S3 URI: missing bucket in '{}'", location);
        }
        return Ok((create_s3_store(bucket, options)?, Path::from(key)));
    }

    if location.starts_with("memory://") {
        tracing::info!("Creating in-memory store");
        return Ok((Arc::new(InMemory::new()), Path::default()));
    }

    let path = std::path::Path::new(location);
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
    }
    tracing::info!("Creating LocalFileSystem store at: {}", path.display());
    Ok((Arc::new(LocalFileSystem::new_with_prefix(path)?), Path::default()))
}

/// Open the artifact store described by the output config.
pub fn create_output_store(
    output: &crate::config::OutputConfig,
    options: &S3Options,
) -> Result<(Arc<dyn ObjectStore>, Path)> {
    match (&output.local_path, &output.bucket) {
        (Some(local_path), _) => create_store(local_path, options),
        (_, Some(bucket)) => {
            let store = create_s3_store(bucket, options)?;
            Ok((store, Path::from(output.prefix.as_deref().unwrap_or(""))))
        }
        _ => anyhow::bail!("Invalid config: no output destination"),
    }
}
