//! In-memory job registry.
//!
//! The registry owns every job record. All lifecycle transitions, and the
//! storage and CPU reservations tied to them, happen under the registry lock;
//! the ledger and governor are only ever locked while it is held (lock order
//! registry -> ledger/governor).

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use vcs_models::{
    ErrorDetail, Job, JobId, JobParameters, JobSnapshot, JobState, Operation, ProgressUpdate,
};
use vcs_storage::{remove_staged_file, ReservationToken, StagedInput, StorageLedger, StorageStats};

use crate::config::RegistryConfig;
use crate::error::{QueueError, QueueResult};
use crate::governor::{GrantToken, ResourceGovernor};
use crate::metrics;

struct JobEntry {
    job: Job,
    working: Option<ReservationToken>,
    output: Option<ReservationToken>,
    grant: Option<GrantToken>,
    /// Input was uploaded for this job and is deleted when it ends
    owned_input: bool,
}

impl JobEntry {
    /// Delete the staged upload. Paired with every working-set release.
    fn discard_owned_input(&mut self) {
        if std::mem::take(&mut self.owned_input) {
            remove_staged_file(&self.job.input_path);
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<JobId, JobEntry>,
    active_by_client: HashMap<IpAddr, JobId>,
    /// Queued jobs in FIFO order (creation time, then id)
    queue: BTreeSet<(DateTime<Utc>, JobId)>,
}

/// Registry counters.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub expired: usize,
    pub active_clients: usize,
    pub storage: StorageStats,
    pub cpu_share_active: f64,
}

impl RegistryStats {
    /// Publish the counters as gauges.
    pub fn publish(&self) {
        metrics::set_job_counts(self.queued, self.running);
        metrics::set_storage_used(self.storage.used);
        metrics::set_cpu_share_active(self.cpu_share_active);
    }
}

/// Whether more than `bound` has passed between `since` and `now`.
fn elapsed_beyond(now: DateTime<Utc>, since: DateTime<Utc>, bound: Duration) -> bool {
    (now - since)
        .to_std()
        .map(|elapsed| elapsed > bound)
        .unwrap_or(false)
}

fn retire(
    active_by_client: &mut HashMap<IpAddr, JobId>,
    queue: &mut BTreeSet<(DateTime<Utc>, JobId)>,
    job: &Job,
) {
    if active_by_client.get(&job.client_address) == Some(&job.id) {
        active_by_client.remove(&job.client_address);
    }
    queue.remove(&(job.created_at, job.id.clone()));
}

fn already_terminal(job: &Job) -> QueueError {
    QueueError::AlreadyTerminal {
        job_id: job.id.clone(),
        state: job.state,
    }
}

/// The job registry.
pub struct JobRegistry {
    config: RegistryConfig,
    ledger: Arc<StorageLedger>,
    governor: Arc<ResourceGovernor>,
    inner: Mutex<RegistryInner>,
    work_available: Notify,
}

impl JobRegistry {
    pub fn new(
        config: RegistryConfig,
        ledger: Arc<StorageLedger>,
        governor: Arc<ResourceGovernor>,
    ) -> Self {
        Self {
            config,
            ledger,
            governor,
            inner: Mutex::new(RegistryInner::default()),
            work_available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<StorageLedger> {
        &self.ledger
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Validate and admit a job.
    ///
    /// On any error nothing is reserved and no job is recorded.
    pub fn submit(
        &self,
        client: IpAddr,
        operation: &str,
        parameters: &Value,
        input: &StagedInput,
    ) -> QueueResult<JobId> {
        match self.try_submit(client, operation, parameters, input) {
            Ok(job_id) => Ok(job_id),
            Err(e) => {
                metrics::record_job_rejected(e.kind());
                debug!(client = %client, operation, error = %e, "Submission rejected");
                Err(e)
            }
        }
    }

    fn try_submit(
        &self,
        client: IpAddr,
        operation: &str,
        parameters: &Value,
        input: &StagedInput,
    ) -> QueueResult<JobId> {
        let operation: Operation = operation.parse()?;
        let parameters = JobParameters::parse(operation, parameters)?;
        let share = self.governor.estimated_share(operation);
        let working_bytes = self.config.working_bytes(operation, input.bytes);
        let output_bytes = self.config.output_reservation_bytes;

        let mut guard = self.lock();
        let inner = &mut *guard;

        if let Some(existing) = inner.active_by_client.get(&client) {
            return Err(QueueError::DuplicateActiveJob {
                client,
                job_id: existing.clone(),
            });
        }

        self.governor.check_admissible(share)?;

        if inner.queue.len() >= self.config.max_queue_depth {
            return Err(QueueError::resource_exhausted(format!(
                "queue is full ({} jobs waiting)",
                inner.queue.len()
            )));
        }

        let mut job = Job::new(client, parameters, &input.path, input.bytes, Utc::now());
        let (working, output) = self.reserve_storage(&job.id, working_bytes, output_bytes)?;
        job.reserved_bytes = working.bytes() + output.bytes();

        let job_id = job.id.clone();
        inner.queue.insert((job.created_at, job_id.clone()));
        inner.active_by_client.insert(client, job_id.clone());
        inner.jobs.insert(
            job_id.clone(),
            JobEntry {
                job,
                working: Some(working),
                output: Some(output),
                grant: None,
                owned_input: input.owned,
            },
        );
        drop(guard);

        self.work_available.notify_one();
        metrics::record_job_admitted(operation);
        info!(
            job_id = %job_id,
            client = %client,
            operation = %operation,
            reserved_bytes = working_bytes.saturating_add(output_bytes),
            "Job admitted"
        );

        Ok(job_id)
    }

    fn reserve_storage(
        &self,
        job_id: &JobId,
        working_bytes: u64,
        output_bytes: u64,
    ) -> QueueResult<(ReservationToken, ReservationToken)> {
        let requested = working_bytes.saturating_add(output_bytes);
        let capacity_error = |ledger: &StorageLedger| QueueError::CapacityExceeded {
            requested,
            available: ledger.available(),
        };

        let working = self
            .ledger
            .reserve(job_id, working_bytes)
            .map_err(|_| capacity_error(&self.ledger))?;

        match self.ledger.reserve(job_id, output_bytes) {
            Ok(output) => Ok((working, output)),
            Err(_) => {
                self.ledger.release(&working);
                Err(capacity_error(&self.ledger))
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn start_locked(
        &self,
        inner: &mut RegistryInner,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> QueueResult<(GrantToken, Job)> {
        let entry = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;

        if entry.job.state != JobState::Queued {
            return Err(already_terminal(&entry.job));
        }

        let grant = self.governor.acquire_for(job_id, entry.job.operation)?;
        if entry.job.start(now).is_err() {
            self.governor.release(&grant);
            return Err(already_terminal(&entry.job));
        }
        entry.grant = Some(grant.clone());

        let job = entry.job.clone();
        inner.queue.remove(&(job.created_at, job.id.clone()));
        Ok((grant, job))
    }

    /// Queued -> Running, acquiring the job's CPU grant.
    ///
    /// If the governor refuses, the job stays queued.
    pub fn mark_running(&self, job_id: &JobId) -> QueueResult<GrantToken> {
        let (grant, job) = {
            let mut guard = self.lock();
            self.start_locked(&mut guard, job_id, Utc::now())?
        };
        info!(job_id = %job.id, operation = %job.operation, "Job running");
        Ok(grant)
    }

    /// Start the oldest queued job.
    ///
    /// Returns `Ok(None)` when nothing is queued and `ResourceExhausted` when
    /// the head of the queue cannot be granted; the head is never skipped.
    pub fn claim_next(&self) -> QueueResult<Option<Job>> {
        let claimed = {
            let mut guard = self.lock();
            let Some((_, job_id)) = guard.queue.first().cloned() else {
                return Ok(None);
            };
            self.start_locked(&mut guard, &job_id, Utc::now())?
        };

        let (_, job) = claimed;
        info!(job_id = %job.id, operation = %job.operation, "Job running");
        Ok(Some(job))
    }

    /// Apply a progress report.
    ///
    /// Never fails for a known job: reports for jobs that are not running and
    /// decreasing values are ignored. Returns whether the job is still running.
    pub fn update_progress(&self, job_id: &JobId, percent: f64) -> QueueResult<bool> {
        let mut guard = self.lock();
        let entry = guard
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;

        match entry.job.record_progress(percent, Utc::now()) {
            ProgressUpdate::Advanced(value) => {
                debug!(job_id = %job_id, progress = value, "Progress updated");
            }
            ProgressUpdate::Unchanged(_) => {}
            ProgressUpdate::Regressed { current, reported } => {
                warn!(
                    job_id = %job_id,
                    current,
                    reported,
                    "Ignoring decreasing progress report"
                );
            }
            ProgressUpdate::NotRunning(state) => {
                debug!(job_id = %job_id, state = %state, "Ignoring progress for job that is not running");
            }
        }

        Ok(entry.job.state == JobState::Running)
    }

    /// Running -> Completed.
    ///
    /// Frees the CPU grant, the working-set reservation and the staged
    /// upload; the output reservation is held until the job is purged.
    pub fn complete(&self, job_id: &JobId, output_location: impl Into<PathBuf>) -> QueueResult<()> {
        let output_location = output_location.into();
        let operation = {
            let mut guard = self.lock();
            let RegistryInner {
                jobs,
                active_by_client,
                queue,
            } = &mut *guard;

            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
            entry
                .job
                .complete(output_location.clone(), Utc::now())
                .map_err(|_| already_terminal(&entry.job))?;

            self.release_working(entry);
            retire(active_by_client, queue, &entry.job);
            entry.job.operation
        };

        self.work_available.notify_one();
        metrics::record_job_finished(operation, JobState::Completed);
        info!(job_id = %job_id, output = %output_location.display(), "Job completed");
        Ok(())
    }

    /// Running -> Failed, releasing every reservation.
    pub fn fail(&self, job_id: &JobId, detail: ErrorDetail) -> QueueResult<()> {
        let operation = {
            let mut guard = self.lock();
            let RegistryInner {
                jobs,
                active_by_client,
                queue,
            } = &mut *guard;

            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
            entry
                .job
                .fail(detail.clone(), Utc::now())
                .map_err(|_| already_terminal(&entry.job))?;

            self.release_all(entry);
            retire(active_by_client, queue, &entry.job);
            entry.job.operation
        };

        self.work_available.notify_one();
        metrics::record_job_finished(operation, JobState::Failed);
        warn!(job_id = %job_id, error = %detail, "Job failed");
        Ok(())
    }

    fn release_working(&self, entry: &mut JobEntry) {
        if let Some(grant) = entry.grant.take() {
            self.governor.release(&grant);
        }
        if let Some(working) = entry.working.take() {
            self.ledger.release(&working);
        }
        entry.discard_owned_input();
        entry.job.reserved_bytes = entry.output.as_ref().map_or(0, |t| t.bytes());
    }

    fn release_all(&self, entry: &mut JobEntry) {
        self.release_working(entry);
        if let Some(output) = entry.output.take() {
            self.ledger.release(&output);
        }
        entry.job.reserved_bytes = 0;
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Expire queued jobs past the wait bound and running jobs past the stall
    /// bound. Returns the expired job ids.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut expired = Vec::new();
        {
            let mut guard = self.lock();
            let RegistryInner {
                jobs,
                active_by_client,
                queue,
            } = &mut *guard;

            for entry in jobs.values_mut() {
                let bound = match entry.job.state {
                    JobState::Queued => self.config.max_wait,
                    JobState::Running => self.config.stall_timeout,
                    _ => continue,
                };
                if !elapsed_beyond(now, entry.job.liveness_reference(), bound) {
                    continue;
                }

                let previous = entry.job.state;
                if entry.job.expire(now).is_err() {
                    continue;
                }
                self.release_all(entry);
                retire(active_by_client, queue, &entry.job);
                expired.push((entry.job.id.clone(), entry.job.operation, previous));
            }
        }

        for (job_id, operation, previous) in &expired {
            warn!(job_id = %job_id, previous_state = %previous, "Job expired");
            metrics::record_job_finished(*operation, JobState::Expired);
        }
        if !expired.is_empty() {
            self.work_available.notify_one();
        }

        expired.into_iter().map(|(id, _, _)| id).collect()
    }

    /// Drop terminal jobs older than the retention period.
    ///
    /// Held output reservations are released; the removed records are returned
    /// so the caller can delete their files.
    pub fn purge_finished(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut guard = self.lock();
        let stale: Vec<JobId> = guard
            .jobs
            .values()
            .filter(|entry| {
                entry.job.state.is_terminal()
                    && entry
                        .job
                        .finished_at
                        .is_some_and(|at| elapsed_beyond(now, at, self.config.retention))
            })
            .map(|entry| entry.job.id.clone())
            .collect();

        let mut purged = Vec::with_capacity(stale.len());
        for job_id in stale {
            if let Some(mut entry) = guard.jobs.remove(&job_id) {
                self.release_all(&mut entry);
                purged.push(entry.job);
            }
        }
        drop(guard);

        if !purged.is_empty() {
            metrics::record_jobs_purged(purged.len());
            info!(count = purged.len(), "Purged finished jobs");
        }
        purged
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Consistent status snapshot.
    pub fn status_of(&self, job_id: &JobId) -> QueueResult<JobSnapshot> {
        self.lock()
            .jobs
            .get(job_id)
            .map(|entry| entry.job.snapshot())
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))
    }

    /// Full copy of a job record.
    pub fn get(&self, job_id: &JobId) -> Option<Job> {
        self.lock().jobs.get(job_id).map(|entry| entry.job.clone())
    }

    /// Output of a completed job.
    pub fn output_of(&self, job_id: &JobId) -> QueueResult<(PathBuf, Operation)> {
        let guard = self.lock();
        let job = &guard
            .jobs
            .get(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?
            .job;

        match (&job.state, &job.output_location) {
            (JobState::Completed, Some(path)) => Ok((path.clone(), job.operation)),
            _ => Err(QueueError::NotFound(job_id.clone())),
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let guard = self.lock();
        let mut stats = RegistryStats {
            queued: 0,
            running: 0,
            completed: 0,
            failed: 0,
            expired: 0,
            active_clients: guard.active_by_client.len(),
            storage: self.ledger.stats(),
            cpu_share_active: self.governor.active_share(),
        };

        for entry in guard.jobs.values() {
            match entry.job.state {
                JobState::Queued => stats.queued += 1,
                JobState::Running => stats.running += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Expired => stats.expired += 1,
            }
        }
        stats
    }

    /// Wait until a job is queued or a running job finishes.
    pub async fn wait_for_work(&self) {
        self.work_available.notified().await;
    }
}
