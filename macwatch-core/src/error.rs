//! Error taxonomy for the ingestion pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the ingestion pipeline. Only [`IngestError::WatchRoot`]
/// is fatal; everything else is scoped to one file or one event.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Filesystem operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Report could not be serialised.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Watch root missing, not a directory or unreadable.
    #[error("Watch root {} is not usable: {reason}", path.display())]
    WatchRoot { path: PathBuf, reason: String },

    /// Native notification backend failure.
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// String is not a hardware address.
    #[error("Invalid lookup key: {0}")]
    InvalidKey(String),

    /// Processing of one capture failed.
    #[error("Processing failed for {}: {message}", path.display())]
    Processing { path: PathBuf, message: String },

    /// A pipeline task ended abnormally.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Failure attributed to a single capture file.
    pub fn processing(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        IngestError::Processing {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[cfg(feature = "fs-watch")]
impl From<notify::Error> for IngestError {
    fn from(err: notify::Error) -> Self {
        IngestError::Watcher(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IngestError>;
