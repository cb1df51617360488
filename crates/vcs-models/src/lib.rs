//! Shared data models for the video compressor service.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their lifecycle state machine and status snapshots
//! - Operations and their validated parameters
//! - Wire protocol requests, responses and the error taxonomy

pub mod error_kind;
pub mod job;
pub mod operation;
pub mod parameters;
pub mod wire;

// Re-export common types
pub use error_kind::ErrorKind;
pub use job::{ErrorDetail, InvalidTransition, Job, JobId, JobSnapshot, JobState, ProgressUpdate};
pub use operation::{AspectRatio, AspectRatioParseError, Operation, OperationParseError};
pub use parameters::{ClipWindow, JobParameters, ParameterError};
pub use wire::{CorrelationId, ErrorBody, Request, Response};
