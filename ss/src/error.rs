//! Store error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt document at {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Unsupported schema version {found} in {collection} (this build supports up to {supported})")]
    UnsupportedVersion {
        collection: &'static str,
        found: u32,
        supported: u32,
    },

    #[error("Migration of {collection} from v{from} failed: {message}")]
    Migration {
        collection: &'static str,
        from: u32,
        message: String,
    },

    #[error("Invalid document id: {0:?}")]
    InvalidId(String),
}

impl StoreError {
    /// Build an IO error tagged with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
