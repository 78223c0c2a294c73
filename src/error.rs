//! Error taxonomy for tiling, fetching, analysis, pooling and merging.

use crate::tiling::BlockKey;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the block pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid block shape, malformed bounding box, out-of-extent query or bad config.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A channel could not be read for a block.
    #[error("fetch error on channel '{channel}': {message}")]
    Fetch { channel: String, message: String },

    /// The analysis function failed for a block.
    #[error("analysis failed for block {key}: {message}")]
    Analysis { key: BlockKey, message: String },

    /// Worker infrastructure failure. The whole batch is aborted.
    #[error("worker pool error: {0}")]
    Pool(String),

    /// An array does not fit the region it is being written to.
    #[error("shape mismatch {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(transparent)]
    Store(#[from] object_store::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// Shorthand for a fetch error on one channel.
    pub fn fetch(channel: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Fetch {
            channel: channel.into(),
            message: message.to_string(),
        }
    }

    /// Check if a read that failed with this error may succeed when retried.
    /// Only store I/O qualifies; a missing object stays missing.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(e) if !matches!(e, object_store::Error::NotFound { .. }))
    }

    /// Check if this error is fatal for a whole batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::Pool(_))
    }
}
