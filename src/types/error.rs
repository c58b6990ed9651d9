use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error taxonomy for the indexing core.
///
/// Transient per-file failures (`Io`) and corruption (`Corrupt`) are handled
/// close to where they occur: a single bad file or cache entry never aborts a
/// batch operation. Only configuration and capacity errors surface to callers
/// as hard failures.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt data for '{0}'")]
    Corrupt(String),

    #[error("memory hard limit exceeded; load rejected until usage drops")]
    Backpressure,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is local to one file or entry and safe to skip.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Io { .. } | CoreError::Corrupt(_))
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

impl From<r2d2::Error> for CoreError {
    fn from(err: r2d2::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}
