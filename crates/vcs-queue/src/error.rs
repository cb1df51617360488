//! Queue error types.

use std::net::IpAddr;

use thiserror::Error;
use vcs_models::{ErrorKind, JobId, JobState, OperationParseError, ParameterError};
use vcs_storage::StorageError;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Client {client} already has an active job: {job_id}")]
    DuplicateActiveJob { client: IpAddr, job_id: JobId },

    #[error("Storage capacity exceeded: requested {requested} bytes, {available} bytes available")]
    CapacityExceeded { requested: u64, available: u64 },

    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {job_id} is {state}, transition not allowed")]
    AlreadyTerminal { job_id: JobId, state: JobState },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Error kind reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Validation(_) => ErrorKind::ValidationError,
            QueueError::DuplicateActiveJob { .. } => ErrorKind::DuplicateActiveJob,
            QueueError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            QueueError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            QueueError::NotFound(_) => ErrorKind::NotFound,
            QueueError::AlreadyTerminal { .. } | QueueError::Storage(_) => ErrorKind::Internal,
        }
    }
}

impl From<StorageError> for QueueError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::CapacityExceeded {
                requested,
                available,
            } => QueueError::CapacityExceeded {
                requested,
                available,
            },
            other => QueueError::Storage(other.to_string()),
        }
    }
}

impl From<ParameterError> for QueueError {
    fn from(e: ParameterError) -> Self {
        QueueError::Validation(e.to_string())
    }
}

impl From<OperationParseError> for QueueError {
    fn from(e: OperationParseError) -> Self {
        QueueError::Validation(e.to_string())
    }
}
