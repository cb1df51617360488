//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage capacity exceeded: requested {requested} bytes, {available} bytes available")]
    CapacityExceeded { requested: u64, available: u64 },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Upload truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn capacity_exceeded(requested: u64, available: u64) -> Self {
        Self::CapacityExceeded {
            requested,
            available,
        }
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }
}
