//! Structured job logging.

use tracing::{error, info, warn, Span};
use vcs_models::{JobId, Operation};

/// Logs one job's lifecycle with its id and operation attached.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: JobId,
    operation: Operation,
}

impl JobLogger {
    pub fn new(job_id: &JobId, operation: Operation) -> Self {
        Self {
            job_id: job_id.clone(),
            operation,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job started: {}", message
        );
    }

    /// Progress is logged at quarter marks only.
    pub fn log_progress(&self, percent: u8) {
        if percent % 25 == 0 {
            info!(
                job_id = %self.job_id,
                operation = %self.operation,
                progress = percent,
                "Job progress"
            );
        }
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Span covering the whole supervision of this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            operation = %self.operation
        )
    }
}
