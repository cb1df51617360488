//! Job record and lifecycle state machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::{ErrorKind, JobParameters, Operation};

/// Unique identifier for a job.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Job lifecycle state.
///
/// Allowed transitions: `Queued -> Running -> {Completed, Failed}`,
/// `Queued -> Expired` and `Running -> Expired`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
pub enum JobState {
    /// Admitted, waiting for an execution slot
    #[default]
    Queued,
    /// Handed to the media executor
    Running,
    /// Output produced
    Completed,
    /// Execution failed or stalled
    Failed,
    /// Waited or stalled beyond the configured bound
    Expired,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "Queued",
            JobState::Running => "Running",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::Expired => "Expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Expired
        )
    }

    /// Queued or Running: counts against the one-job-per-client rule.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Expired)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Expired)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Invalid job transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// Failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn execution_failure(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ExecutionFailure,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of applying a progress report to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// Progress moved forward
    Advanced(u8),
    /// Same value reported again; liveness refreshed
    Unchanged(u8),
    /// Lower value reported; ignored
    Regressed { current: u8, reported: u8 },
    /// Job is not running; ignored
    NotRunning(JobState),
}

/// A client-submitted processing job.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Originating client address
    #[schemars(with = "String")]
    pub client_address: IpAddr,
    /// Requested operation
    pub operation: Operation,
    /// Validated parameters
    pub parameters: JobParameters,
    /// Lifecycle state
    pub state: JobState,
    /// Progress (0-100)
    pub progress_percent: u8,
    /// Storage bytes currently reserved for this job
    pub reserved_bytes: u64,
    /// Input file the executor reads
    pub input_path: PathBuf,
    /// Size of the input in bytes
    pub input_bytes: u64,
    /// Output file (set on completion)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_location: Option<PathBuf>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Started at timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Last accepted progress report (stall accounting)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_progress_at: Option<DateTime<Utc>>,
    /// Error (only when Failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(
        client_address: IpAddr,
        parameters: JobParameters,
        input_path: impl Into<PathBuf>,
        input_bytes: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            client_address,
            operation: parameters.operation(),
            parameters,
            state: JobState::Queued,
            progress_percent: 0,
            reserved_bytes: 0,
            input_path: input_path.into(),
            input_bytes,
            output_location: None,
            created_at,
            started_at: None,
            finished_at: None,
            last_progress_at: None,
            error_detail: None,
        }
    }

    fn transition(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Queued -> Running.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobState::Running)?;
        self.progress_percent = 0;
        self.started_at = Some(now);
        self.last_progress_at = Some(now);
        Ok(())
    }

    /// Apply a progress report, clamped to [0, 100]. Never moves backwards.
    pub fn record_progress(&mut self, percent: f64, now: DateTime<Utc>) -> ProgressUpdate {
        if self.state != JobState::Running {
            return ProgressUpdate::NotRunning(self.state);
        }

        let reported = if percent.is_nan() {
            0
        } else {
            percent.clamp(0.0, 100.0).floor() as u8
        };

        if reported < self.progress_percent {
            return ProgressUpdate::Regressed {
                current: self.progress_percent,
                reported,
            };
        }

        self.last_progress_at = Some(now);
        if reported == self.progress_percent {
            ProgressUpdate::Unchanged(reported)
        } else {
            self.progress_percent = reported;
            ProgressUpdate::Advanced(reported)
        }
    }

    /// Running -> Completed.
    pub fn complete(
        &mut self,
        output_location: impl Into<PathBuf>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobState::Completed)?;
        self.progress_percent = 100;
        self.output_location = Some(output_location.into());
        self.finished_at = Some(now);
        Ok(())
    }

    /// Running -> Failed. Progress stays frozen at its last value.
    pub fn fail(&mut self, detail: ErrorDetail, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobState::Failed)?;
        self.error_detail = Some(detail);
        self.finished_at = Some(now);
        Ok(())
    }

    /// Queued/Running -> Expired.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        let was_queued = self.state == JobState::Queued;
        self.transition(JobState::Expired)?;
        if was_queued {
            self.progress_percent = 0;
        }
        self.finished_at = Some(now);
        Ok(())
    }

    /// Reference time for expiry: creation while queued, last progress while running.
    pub fn liveness_reference(&self) -> DateTime<Utc> {
        match self.state {
            JobState::Running => self
                .last_progress_at
                .or(self.started_at)
                .unwrap_or(self.created_at),
            _ => self.created_at,
        }
    }

    /// Consistent view of the client-visible fields.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id.clone(),
            state: self.state,
            progress_percent: self.progress_percent,
            error_detail: self.error_detail.clone(),
            output_location: self.output_location.clone(),
        }
    }
}

/// Status snapshot returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub state: JobState,
    pub progress_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_location: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn queued_job() -> Job {
        Job::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            JobParameters::Compress,
            "/tmp/in.mp4",
            1024,
            Utc::now(),
        )
    }

    #[test]
    fn test_state_machine() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Expired));
        assert!(!JobState::Queued.can_transition_to(JobState::Completed));
        assert!(!JobState::Queued.can_transition_to(JobState::Failed));
        for terminal in [JobState::Completed, JobState::Failed, JobState::Expired] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(JobState::Running));
            assert!(!terminal.can_transition_to(JobState::Queued));
        }
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let mut job = queued_job();
        let now = Utc::now();
        assert_eq!(
            job.record_progress(10.0, now),
            ProgressUpdate::NotRunning(JobState::Queued)
        );

        job.start(now).unwrap();
        assert_eq!(job.record_progress(25.0, now), ProgressUpdate::Advanced(25));
        assert_eq!(
            job.record_progress(20.0, now),
            ProgressUpdate::Regressed {
                current: 25,
                reported: 20
            }
        );
        assert_eq!(job.progress_percent, 25);
        assert_eq!(job.record_progress(250.0, now), ProgressUpdate::Advanced(100));
        assert_eq!(job.record_progress(-5.0, now), ProgressUpdate::Regressed {
            current: 100,
            reported: 0
        });
    }

    #[test]
    fn test_complete_sets_full_progress() {
        let mut job = queued_job();
        let now = Utc::now();
        job.start(now).unwrap();
        job.record_progress(60.0, now);
        job.complete("/tmp/out.mp4", now).unwrap();
        assert_eq!(job.progress_percent, 100);
        assert_eq!(job.snapshot().output_location, Some(PathBuf::from("/tmp/out.mp4")));
        assert!(job.fail(ErrorDetail::timeout("late"), now).is_err());
    }

    #[test]
    fn test_fail_freezes_progress() {
        let mut job = queued_job();
        let now = Utc::now();
        job.start(now).unwrap();
        job.record_progress(40.0, now);
        job.fail(ErrorDetail::execution_failure("ffmpeg exited 1"), now)
            .unwrap();
        let snapshot = job.snapshot();
        assert_eq!(snapshot.state, JobState::Failed);
        assert_eq!(snapshot.progress_percent, 40);
        assert_eq!(
            snapshot.error_detail.map(|d| d.kind),
            Some(ErrorKind::ExecutionFailure)
        );
    }

    #[test]
    fn test_queued_job_cannot_complete() {
        let mut job = queued_job();
        let err = job.complete("/tmp/out.mp4", Utc::now()).unwrap_err();
        assert_eq!(err.from, JobState::Queued);
        assert_eq!(job.state, JobState::Queued);
    }
}
