//! Job dispatcher.
//!
//! Claims queued jobs in FIFO order whenever the governor has room, hands
//! each to the media executor and supervises it: progress events are relayed
//! to the registry, silence longer than the stall bound cancels the execution
//! and fails the job with a timeout.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use vcs_media::{ExecutionEvent, ExecutionRequest, MediaExecutor};
use vcs_models::{ErrorDetail, Job, JobId};
use vcs_queue::{JobRegistry, QueueError};
use vcs_storage::Workspace;

use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::logging::JobLogger;

#[derive(Clone)]
struct SupervisionContext {
    registry: Arc<JobRegistry>,
    executor: Arc<dyn MediaExecutor>,
    workspace: Workspace,
    stall_timeout: Duration,
}

/// Claims and supervises jobs until shut down.
pub struct Dispatcher {
    config: WorkerConfig,
    ctx: SupervisionContext,
    shutdown: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        config: WorkerConfig,
        registry: Arc<JobRegistry>,
        executor: Arc<dyn MediaExecutor>,
        workspace: Workspace,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let ctx = SupervisionContext {
            registry,
            executor,
            workspace,
            stall_timeout: config.stall_timeout,
        };
        Self {
            config,
            ctx,
            shutdown,
        }
    }

    /// Run the claim loop. Returns after shutdown once in-flight jobs are done
    /// or cancelled.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            work_dir = %self.ctx.workspace.root().display(),
            stall_timeout_secs = self.config.stall_timeout.as_secs(),
            "Starting dispatcher"
        );
        self.ctx.workspace.init().await?;

        let mut shutdown_rx = self.shutdown.subscribe();
        let (abort_tx, abort_rx) = watch::channel(false);
        let mut in_flight: JoinSet<JobId> = JoinSet::new();

        loop {
            let stopping = *shutdown_rx.borrow();
            if stopping {
                info!("Shutdown signal received, stopping dispatcher");
                break;
            }

            match self.ctx.registry.claim_next() {
                Ok(Some(job)) => {
                    in_flight.spawn(supervise(self.ctx.clone(), job, abort_rx.clone()));
                    continue;
                }
                Ok(None) => {}
                Err(QueueError::ResourceExhausted(reason)) => {
                    debug!(reason = %reason, "Queue head waiting for resources");
                }
                Err(e) => warn!(error = %e, "Failed to claim next job"),
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = self.ctx.registry.wait_for_work() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_supervision_result(result);
                }
            }
        }

        if !in_flight.is_empty() {
            info!(pending = in_flight.len(), "Waiting for in-flight jobs to complete...");
            let drained =
                tokio::time::timeout(self.config.shutdown_timeout, drain(&mut in_flight)).await;
            if drained.is_err() {
                warn!(
                    remaining = in_flight.len(),
                    "Shutdown timeout reached, cancelling in-flight jobs"
                );
                abort_tx.send_replace(true);
                drain(&mut in_flight).await;
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

async fn drain(in_flight: &mut JoinSet<JobId>) {
    while let Some(result) = in_flight.join_next().await {
        log_supervision_result(result);
    }
}

fn log_supervision_result(result: Result<JobId, JoinError>) {
    match result {
        Ok(job_id) => debug!(job_id = %job_id, "Supervision finished"),
        Err(e) => error!(error = %e, "Supervision task panicked"),
    }
}

/// Resolves once the flag is raised. A dropped sender never resolves.
async fn signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|raised| *raised).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn supervise(ctx: SupervisionContext, job: Job, mut abort_rx: watch::Receiver<bool>) -> JobId {
    let logger = JobLogger::new(&job.id, job.operation);
    let span = logger.create_span();
    let job_id = job.id.clone();

    run_supervision(&ctx, job, &logger, &mut abort_rx)
        .instrument(span)
        .await;

    job_id
}

async fn run_supervision(
    ctx: &SupervisionContext,
    job: Job,
    logger: &JobLogger,
    abort_rx: &mut watch::Receiver<bool>,
) {
    logger.log_start(&format!("input {}", job.input_path.display()));

    let work_dir = match ctx.workspace.prepare_job_dir(&job.id).await {
        Ok(dir) => dir,
        Err(e) => {
            fail_job(
                ctx,
                logger,
                ErrorDetail::execution_failure(format!("failed to prepare work directory: {e}")),
            );
            return;
        }
    };

    let request = ExecutionRequest::new(
        job.id.clone(),
        job.parameters.clone(),
        job.input_path.clone(),
        work_dir,
    );

    let mut handle = match ctx.executor.execute(request).await {
        Ok(handle) => handle,
        Err(e) => {
            fail_job(ctx, logger, ErrorDetail::execution_failure(e.summary()));
            return;
        }
    };

    loop {
        let event = tokio::select! {
            event = tokio::time::timeout(ctx.stall_timeout, handle.next_event()) => event,
            _ = signalled(abort_rx) => {
                handle.cancel();
                fail_job(ctx, logger, ErrorDetail::execution_failure("cancelled by service shutdown"));
                return;
            }
        };

        match event {
            Err(_) => {
                handle.cancel();
                counter!("vcs_stall_timeouts_total").increment(1);
                fail_job(
                    ctx,
                    logger,
                    ErrorDetail::timeout(format!(
                        "no progress reported for {}s",
                        ctx.stall_timeout.as_secs()
                    )),
                );
                return;
            }
            Ok(None) => {
                fail_job(
                    ctx,
                    logger,
                    ErrorDetail::execution_failure("executor stopped without reporting a result"),
                );
                return;
            }
            Ok(Some(ExecutionEvent::Progress(percent))) => {
                match ctx.registry.update_progress(&job.id, f64::from(percent)) {
                    Ok(true) => logger.log_progress(percent),
                    Ok(false) | Err(_) => {
                        logger.log_warning("job is no longer running, cancelling execution");
                        handle.cancel();
                        return;
                    }
                }
            }
            Ok(Some(ExecutionEvent::Succeeded { output })) => {
                match ctx.registry.complete(&job.id, output.clone()) {
                    Ok(()) => logger.log_completion(&output.display().to_string()),
                    Err(e) => logger.log_warning(&format!("result discarded: {e}")),
                }
                return;
            }
            Ok(Some(ExecutionEvent::Failed { message })) => {
                fail_job(ctx, logger, ErrorDetail::execution_failure(message));
                return;
            }
        }
    }
}

fn fail_job(ctx: &SupervisionContext, logger: &JobLogger, detail: ErrorDetail) {
    logger.log_error(&detail.to_string());
    match ctx.registry.fail(logger.job_id(), detail) {
        Ok(()) => {}
        Err(QueueError::AlreadyTerminal { state, .. }) => {
            debug!(job_id = %logger.job_id(), state = %state, "Job already finished, failure not recorded");
        }
        Err(e) => warn!(job_id = %logger.job_id(), error = %e, "Failed to record job failure"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use vcs_media::{ExecutionHandle, MediaResult};
    use vcs_models::{ErrorKind, JobSnapshot, JobState};
    use vcs_queue::{GovernorConfig, RegistryConfig, ResourceGovernor};
    use vcs_storage::{StagedInput, StorageLedger};

    #[derive(Debug, Clone)]
    enum Step {
        Progress(u8),
        Pause(Duration),
        Succeed,
        Fail(&'static str),
        Hang,
    }

    struct ScriptedExecutor {
        steps: Vec<Step>,
        cancelled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MediaExecutor for ScriptedExecutor {
        async fn execute(&self, request: ExecutionRequest) -> MediaResult<ExecutionHandle> {
            let (handle, reporter) = ExecutionHandle::channel();
            let steps = self.steps.clone();
            let cancelled = Arc::clone(&self.cancelled);

            tokio::spawn(async move {
                let mut cancel = reporter.cancel_signal();
                for step in steps {
                    match step {
                        Step::Progress(p) => reporter.progress(p),
                        Step::Pause(d) => tokio::time::sleep(d).await,
                        Step::Succeed => {
                            let output = request.output_path();
                            tokio::fs::write(&output, b"output").await.ok();
                            reporter.succeeded(output).await;
                            return;
                        }
                        Step::Fail(message) => {
                            reporter.failed(message).await;
                            return;
                        }
                        Step::Hang => {
                            if cancel.wait_for(|c| *c).await.is_ok() {
                                cancelled.fetch_add(1, Ordering::SeqCst);
                            }
                            return;
                        }
                    }
                }
            });

            Ok(handle)
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        registry: Arc<JobRegistry>,
        cancelled: Arc<AtomicUsize>,
        tmp: TempDir,
    }

    fn harness(steps: Vec<Step>, stall_timeout: Duration) -> Harness {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new(
            RegistryConfig {
                min_working_bytes: 1024,
                output_reservation_bytes: 1024,
                ..Default::default()
            },
            Arc::new(StorageLedger::with_capacity(1 << 30)),
            Arc::new(ResourceGovernor::new(GovernorConfig::default())),
        ));
        let cancelled = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(ScriptedExecutor {
            steps,
            cancelled: Arc::clone(&cancelled),
        });
        let config = WorkerConfig {
            work_dir: tmp.path().to_path_buf(),
            stall_timeout,
            shutdown_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(20),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            config,
            Arc::clone(&registry),
            executor,
            Workspace::new(tmp.path()),
        ));

        Harness {
            dispatcher,
            registry,
            cancelled,
            tmp,
        }
    }

    impl Harness {
        fn start(&self) -> tokio::task::JoinHandle<WorkerResult<()>> {
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move { dispatcher.run().await })
        }

        fn submit(&self, client: u8, operation: &str, parameters: serde_json::Value) -> JobId {
            let input = StagedInput {
                path: self.tmp.path().join("input.mp4"),
                bytes: 10,
                owned: false,
            };
            self.registry
                .submit(
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, client)),
                    operation,
                    &parameters,
                    &input,
                )
                .unwrap()
        }

        async fn wait_for_state(&self, job_id: &JobId, state: JobState) -> JobSnapshot {
            for _ in 0..300 {
                let snapshot = self.registry.status_of(job_id).unwrap();
                if snapshot.state == state {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("job {job_id} never reached {state}");
        }

        async fn stop(&self, task: tokio::task::JoinHandle<WorkerResult<()>>) {
            self.dispatcher.shutdown();
            tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_successful_job_completes() {
        let h = harness(
            vec![
                Step::Progress(0),
                Step::Progress(25),
                Step::Progress(60),
                Step::Progress(100),
                Step::Succeed,
            ],
            Duration::from_secs(5),
        );
        let task = h.start();
        let job_id = h.submit(1, "gif", json!({"start_time": 0, "duration": 5}));

        let status = h.wait_for_state(&job_id, JobState::Completed).await;
        assert_eq!(status.progress_percent, 100);
        let output = status.output_location.unwrap();
        assert!(output.ends_with(format!("{job_id}/output.gif")));
        assert_eq!(h.registry.governor().active_share(), 0.0);
        assert_eq!(h.registry.ledger().current_usage(), 1024);

        h.stop(task).await;
    }

    #[tokio::test]
    async fn test_stalled_job_fails_with_timeout() {
        let h = harness(
            vec![Step::Progress(10), Step::Hang],
            Duration::from_millis(100),
        );
        let task = h.start();
        let job_id = h.submit(1, "compress", json!({}));

        let status = h.wait_for_state(&job_id, JobState::Failed).await;
        let detail = status.error_detail.unwrap();
        assert_eq!(detail.kind, ErrorKind::Timeout);
        assert_eq!(status.progress_percent, 10);

        h.stop(task).await;
        assert_eq!(h.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.ledger().current_usage(), 0);
        assert_eq!(h.registry.governor().active_share(), 0.0);
    }

    #[tokio::test]
    async fn test_executor_failure_is_recorded() {
        let h = harness(
            vec![Step::Progress(5), Step::Fail("encoder exploded")],
            Duration::from_secs(5),
        );
        let task = h.start();
        let job_id = h.submit(1, "webm", json!({"start_time": 0, "duration": 2}));

        let status = h.wait_for_state(&job_id, JobState::Failed).await;
        let detail = status.error_detail.unwrap();
        assert_eq!(detail.kind, ErrorKind::ExecutionFailure);
        assert_eq!(detail.message, "encoder exploded");

        // The client may submit again once the job has failed.
        h.submit(1, "compress", json!({}));
        h.stop(task).await;
    }

    #[tokio::test]
    async fn test_expired_job_is_cancelled() {
        let h = harness(
            vec![
                Step::Progress(10),
                Step::Pause(Duration::from_millis(200)),
                Step::Progress(20),
                Step::Hang,
            ],
            Duration::from_secs(5),
        );
        let task = h.start();
        let job_id = h.submit(1, "compress", json!({}));

        h.wait_for_state(&job_id, JobState::Running).await;
        let expired = h
            .registry
            .sweep_expired(chrono::Utc::now() + chrono::Duration::hours(1));
        assert_eq!(expired, vec![job_id.clone()]);

        for _ in 0..100 {
            if h.cancelled.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.status_of(&job_id).unwrap().state, JobState::Expired);

        h.stop(task).await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_jobs() {
        let h = harness(vec![Step::Progress(1), Step::Hang], Duration::from_secs(10));
        let task = h.start();
        let job_id = h.submit(1, "extract_audio", json!({}));

        h.wait_for_state(&job_id, JobState::Running).await;
        h.stop(task).await;

        let status = h.registry.status_of(&job_id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(h.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.governor().active_grants(), 0);
    }

    #[tokio::test]
    async fn test_jobs_from_several_clients_all_complete() {
        let h = harness(vec![Step::Progress(50), Step::Succeed], Duration::from_secs(5));
        let task = h.start();

        let jobs: Vec<_> = (1..=6).map(|n| h.submit(n, "compress", json!({}))).collect();
        for job_id in &jobs {
            h.wait_for_state(job_id, JobState::Completed).await;
        }
        assert_eq!(h.registry.stats().completed, 6);

        h.stop(task).await;
    }
}
