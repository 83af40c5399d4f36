//! Error types for volume acquisition operations

use std::sync::Arc;
use thiserror::Error;

/// Main error type for the loader.
///
/// The enum is `Clone` so that a single in-flight acquisition pipeline can
/// hand the same failure to every caller attached to its shared future.
/// `Io` holds its source behind an `Arc` for that reason.
#[derive(Error, Debug, Clone)]
pub enum NiftiError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Invalid format: {0}")]
    Format(String),

    #[error("Could not fetch '{key}' (status {status:?}): {detail}")]
    Fetch {
        key: String,
        status: Option<u16>,
        detail: String,
    },

    #[error("Out of range: {0}")]
    Range(String),

    #[error("Unsupported voxel data type code: {0}")]
    UnsupportedType(i16),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Metadata error: {0}")]
    Metadata(String),
}

/// Specialized Result type for loader operations
pub type Result<T> = std::result::Result<T, NiftiError>;

impl From<std::io::Error> for NiftiError {
    fn from(err: std::io::Error) -> Self {
        NiftiError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for NiftiError {
    fn from(err: serde_json::Error) -> Self {
        NiftiError::Metadata(err.to_string())
    }
}

impl NiftiError {
    /// Build a fetch error without an HTTP status (transport-level failure).
    pub fn fetch(key: impl Into<String>, detail: impl Into<String>) -> Self {
        NiftiError::Fetch {
            key: key.into(),
            status: None,
            detail: detail.into(),
        }
    }

    /// Build a fetch error for a non-success HTTP status.
    pub fn fetch_status(key: impl Into<String>, status: u16) -> Self {
        NiftiError::Fetch {
            key: key.into(),
            status: Some(status),
            detail: format!("unexpected response status {}", status),
        }
    }
}
