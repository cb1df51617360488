//! Wire protocol messages.
//!
//! One JSON object per frame. Requests are tagged by `method`; responses are
//! distinguished by their fields. Field names are camelCase on the wire.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::{ErrorDetail, ErrorKind, JobId, JobSnapshot, JobState};

/// Client-chosen correlation id, echoed back verbatim (string, number or null).
pub type CorrelationId = Value;

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Submit a new job. The input video travels as the frame payload.
    Submit {
        #[serde(default)]
        id: CorrelationId,
        operation: String,
        #[serde(default)]
        parameters: Value,
    },

    /// Query job status.
    Status {
        #[serde(default)]
        id: CorrelationId,
        #[serde(rename = "jobId")]
        job_id: JobId,
    },

    /// Fetch the output of a completed job as the frame payload.
    Download {
        #[serde(default)]
        id: CorrelationId,
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
}

impl Request {
    pub fn id(&self) -> &CorrelationId {
        match self {
            Request::Submit { id, .. } | Request::Status { id, .. } | Request::Download { id, .. } => id,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Request::Submit { .. } => "submit",
            Request::Status { .. } => "status",
            Request::Download { .. } => "download",
        }
    }

    pub fn submit(id: impl Into<CorrelationId>, operation: impl Into<String>, parameters: Value) -> Self {
        Request::Submit {
            id: id.into(),
            operation: operation.into(),
            parameters,
        }
    }

    pub fn status(id: impl Into<CorrelationId>, job_id: JobId) -> Self {
        Request::Status {
            id: id.into(),
            job_id,
        }
    }

    pub fn download(id: impl Into<CorrelationId>, job_id: JobId) -> Self {
        Request::Download {
            id: id.into(),
            job_id,
        }
    }
}

/// Error body carried by failed responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Response envelope.
///
/// Variant order matters for deserialization: the most specific shapes come first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Response {
    Error {
        id: CorrelationId,
        error: ErrorBody,
    },

    Status {
        id: CorrelationId,
        #[serde(rename = "jobId")]
        job_id: JobId,
        state: JobState,
        #[serde(rename = "progressPercent")]
        progress_percent: u8,
        #[serde(rename = "errorDetail", default, skip_serializing_if = "Option::is_none")]
        error_detail: Option<ErrorDetail>,
        #[serde(rename = "outputLocation", default, skip_serializing_if = "Option::is_none")]
        output_location: Option<PathBuf>,
    },

    Download {
        id: CorrelationId,
        #[serde(rename = "jobId")]
        job_id: JobId,
        size: u64,
    },

    Accepted {
        id: CorrelationId,
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
}

impl Response {
    pub fn accepted(id: CorrelationId, job_id: JobId) -> Self {
        Response::Accepted { id, job_id }
    }

    pub fn status(id: CorrelationId, snapshot: JobSnapshot) -> Self {
        Response::Status {
            id,
            job_id: snapshot.job_id,
            state: snapshot.state,
            progress_percent: snapshot.progress_percent,
            error_detail: snapshot.error_detail,
            output_location: snapshot.output_location,
        }
    }

    pub fn download(id: CorrelationId, job_id: JobId, size: u64) -> Self {
        Response::Download { id, job_id, size }
    }

    pub fn error(id: CorrelationId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            id,
            error: ErrorBody {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn id(&self) -> &CorrelationId {
        match self {
            Response::Error { id, .. }
            | Response::Status { id, .. }
            | Response::Download { id, .. }
            | Response::Accepted { id, .. } => id,
        }
    }

    /// Error kind if this is an error response.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Response::Error { error, .. } => Some(error.kind),
            _ => None,
        }
    }
}
