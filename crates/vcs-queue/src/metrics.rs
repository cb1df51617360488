//! Job lifecycle and resource metrics.
//!
//! Recorded through the `metrics` facade; a recorder is installed by the
//! binary when metrics export is enabled.

use metrics::{counter, gauge};
use vcs_models::{ErrorKind, JobState, Operation};

/// Metric names as constants for consistency.
pub mod names {
    // Admission
    pub const JOBS_ADMITTED_TOTAL: &str = "vcs_jobs_admitted_total";
    pub const JOBS_REJECTED_TOTAL: &str = "vcs_jobs_rejected_total";

    // Lifecycle
    pub const JOBS_FINISHED_TOTAL: &str = "vcs_jobs_finished_total";
    pub const JOBS_PURGED_TOTAL: &str = "vcs_jobs_purged_total";
    pub const JOBS_QUEUED: &str = "vcs_jobs_queued";
    pub const JOBS_RUNNING: &str = "vcs_jobs_running";

    // Resources
    pub const STORAGE_USED_BYTES: &str = "vcs_storage_used_bytes";
    pub const CPU_SHARE_ACTIVE: &str = "vcs_cpu_share_active";
    pub const THROUGHPUT_HEADROOM_PPS: &str = "vcs_throughput_headroom_pps";
}

pub fn record_job_admitted(operation: Operation) {
    counter!(names::JOBS_ADMITTED_TOTAL, "operation" => operation.as_str()).increment(1);
}

pub fn record_job_rejected(kind: ErrorKind) {
    counter!(names::JOBS_REJECTED_TOTAL, "kind" => kind.as_str()).increment(1);
}

/// Record a terminal transition.
pub fn record_job_finished(operation: Operation, state: JobState) {
    counter!(
        names::JOBS_FINISHED_TOTAL,
        "operation" => operation.as_str(),
        "state" => state.as_str()
    )
    .increment(1);
}

pub fn record_jobs_purged(count: usize) {
    counter!(names::JOBS_PURGED_TOTAL).increment(count as u64);
}

pub fn set_job_counts(queued: usize, running: usize) {
    gauge!(names::JOBS_QUEUED).set(queued as f64);
    gauge!(names::JOBS_RUNNING).set(running as f64);
}

pub fn set_storage_used(bytes: u64) {
    gauge!(names::STORAGE_USED_BYTES).set(bytes as f64);
}

pub fn set_cpu_share_active(share: f64) {
    gauge!(names::CPU_SHARE_ACTIVE).set(share);
}

pub fn set_throughput_headroom(pps: u64) {
    gauge!(names::THROUGHPUT_HEADROOM_PPS).set(pps as f64);
}
