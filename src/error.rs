use std::path::PathBuf;

/// Errors shared by the watcher, the registry and the validator.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Missing or invalid configuration: unreadable roots, malformed link record.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A filesystem operation failed for one unit of work.
    #[error("I/O error at {}: {source}", .path.display())]
    TransientIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The memory service could not be reached or answered with an error.
    #[error("memory service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Two bindings claim the same identity.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::TransientIo {
            path: path.into(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::Configuration(msg.into())
    }
}
