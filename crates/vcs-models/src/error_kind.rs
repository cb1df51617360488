//! Error taxonomy shared by the registry, the gateway and clients.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of failure reported to clients.
///
/// Admission-time kinds are returned synchronously from `submit`; execution-time
/// kinds (`ExecutionFailure`, `Timeout`) are only ever recorded on a job and
/// surfaced through status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ErrorKind {
    /// Malformed or missing parameters
    ValidationError,
    /// The client already has a queued or running job
    DuplicateActiveJob,
    /// Storage ledger cannot hold the job's reservation
    CapacityExceeded,
    /// CPU ceiling or backlog limit reached
    ResourceExhausted,
    /// Unknown job id
    NotFound,
    /// The media tool reported an error
    ExecutionFailure,
    /// The job stalled
    Timeout,
    /// Frame or request could not be understood
    BadRequest,
    /// Server-side I/O failure
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::DuplicateActiveJob => "DuplicateActiveJob",
            ErrorKind::CapacityExceeded => "CapacityExceeded",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::ExecutionFailure => "ExecutionFailure",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Whether this kind is produced by admission (never mutates job state).
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::ValidationError
                | ErrorKind::DuplicateActiveJob
                | ErrorKind::CapacityExceeded
                | ErrorKind::ResourceExhausted
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_variant_name() {
        let json = serde_json::to_string(&ErrorKind::DuplicateActiveJob).unwrap();
        assert_eq!(json, "\"DuplicateActiveJob\"");
        assert_eq!(ErrorKind::NotFound.to_string(), "NotFound");
    }
}
