//! Gateway error types.

use thiserror::Error;

use vcs_models::{ErrorKind, JobId};
use vcs_queue::QueueError;
use vcs_storage::StorageError;

use crate::frame::FrameError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Kind reported to the client.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::BadRequest(_)
            | ApiError::Frame(_)
            | ApiError::Storage(StorageError::Truncated { .. }) => ErrorKind::BadRequest,
            ApiError::Validation(_) => ErrorKind::ValidationError,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::Queue(e) => e.kind(),
            ApiError::Internal(_) | ApiError::Storage(_) | ApiError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Message reported to the client. Internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ApiError::Queue(e) => e.to_string(),
            ApiError::Storage(e @ StorageError::Truncated { .. }) => e.to_string(),
            ApiError::Storage(_) | ApiError::Io(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ApiError::bad_request("x").kind(), ErrorKind::BadRequest);
        assert_eq!(ApiError::validation("x").kind(), ErrorKind::ValidationError);
        assert_eq!(
            ApiError::NotFound(JobId::from_string("j")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ApiError::from(QueueError::CapacityExceeded {
                requested: 10,
                available: 1
            })
            .kind(),
            ErrorKind::CapacityExceeded
        );
        assert_eq!(
            ApiError::from(std::io::Error::other("disk")).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_truncated_upload_is_a_client_error() {
        let err = ApiError::from(StorageError::Truncated {
            expected: 10,
            received: 4,
        });
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(err.client_message().contains("expected 10 bytes"));
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = ApiError::from(std::io::Error::other("/srv/secret/path"));
        assert_eq!(err.client_message(), "internal server error");
    }
}
