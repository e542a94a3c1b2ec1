//! Error types for remote-store operations.

use thiserror::Error;

/// Errors that can occur during remote-store operations.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    /// Object not found in the remote namespace.
    #[error("Object not found: {path}")]
    NotFound { path: String },

    /// Network error.
    #[error("Network error: {message}")]
    Network { message: String, retryable: bool },

    /// Local I/O error while serving the request.
    #[error("I/O error for {path}: {message}")]
    Io { path: String, message: String },

    /// The requested path is malformed for this store.
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    /// The backend does not implement this operation.
    #[error("Operation not supported: {operation}")]
    Unsupported { operation: String },
}

impl RemoteError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Network { retryable, .. } => *retryable,
            RemoteError::NotFound { .. } => false,
            RemoteError::Io { .. } => false,
            RemoteError::InvalidPath { .. } => false,
            RemoteError::Unsupported { .. } => false,
        }
    }

    /// Create an Io error from std::io::Error.
    pub fn from_io(path: impl Into<String>, err: std::io::Error) -> Self {
        RemoteError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let transient = RemoteError::Network {
            message: "timeout".into(),
            retryable: true,
        };
        assert!(transient.is_retryable());

        let fatal = RemoteError::Network {
            message: "bad credentials".into(),
            retryable: false,
        };
        assert!(!fatal.is_retryable());

        assert!(!RemoteError::NotFound { path: "a".into() }.is_retryable());
    }
}
