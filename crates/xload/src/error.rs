//! Error types for the preload pipeline.

use blobgate_common::PathError;
use blobgate_remote::RemoteError;
use thiserror::Error;

/// Errors that can occur inside the preload pipeline.
#[derive(Error, Debug, Clone)]
pub enum XloadError {
    /// Invalid configuration; fatal, the pipeline never starts.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// A directory listing call failed. Non-fatal for the walk as a whole;
    /// the failing subtree is abandoned.
    #[error("Listing failed for {path}: {source}")]
    Listing { path: String, source: RemoteError },

    /// A block transfer failed; fails the whole file it belongs to.
    #[error("Transfer failed for {path}: {source}")]
    Transfer { path: String, source: RemoteError },

    /// The reassembled file's content hash does not match the remote's.
    #[error("Content hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Local I/O error while staging a file.
    #[error("I/O error for {path}: {message}")]
    Io { path: String, message: String },

    /// The pipeline (or the operation's cancellation scope) is shutting down.
    #[error("Operation cancelled")]
    Cancelled,

    /// Work was scheduled onto a pool that has already stopped.
    #[error("Worker pool is stopped")]
    PoolStopped,

    /// The pipeline is not in the state this operation requires.
    #[error("Pipeline is not running")]
    NotRunning,
}

impl XloadError {
    /// Create an Io error from std::io::Error.
    pub fn from_io(path: impl Into<String>, err: std::io::Error) -> Self {
        XloadError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl From<PathError> for XloadError {
    fn from(err: PathError) -> Self {
        XloadError::Io {
            path: String::new(),
            message: err.to_string(),
        }
    }
}
