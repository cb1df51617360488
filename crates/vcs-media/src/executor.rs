//! Media executor seam.
//!
//! An executor starts work for one job and hands back an [`ExecutionHandle`]:
//! a stream of [`ExecutionEvent`]s plus an idempotent cancel switch. The
//! dispatcher only ever talks to executors through this handle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::histogram;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use vcs_models::{JobId, JobParameters, Operation};

use crate::command::{check_ffmpeg, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::operations::{build_command, expected_duration_ms};
use crate::probe::probe_video;

/// Events buffered between an executor and its supervisor.
const EVENT_BUFFER: usize = 64;

/// Work handed to an executor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub operation: Operation,
    pub parameters: JobParameters,
    pub input: PathBuf,
    /// Directory the output is written into
    pub work_dir: PathBuf,
}

impl ExecutionRequest {
    pub fn new(job_id: JobId, parameters: JobParameters, input: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            job_id,
            operation: parameters.operation(),
            parameters,
            input,
            work_dir,
        }
    }

    /// Where the output is written.
    pub fn output_path(&self) -> PathBuf {
        self.work_dir
            .join(format!("output.{}", self.operation.output_extension()))
    }
}

/// What an executor reports.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Percent complete (0-100)
    Progress(u8),
    Succeeded { output: PathBuf },
    Failed { message: String },
}

impl ExecutionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionEvent::Progress(_))
    }
}

/// Supervisor side of a running execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    events: mpsc::Receiver<ExecutionEvent>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

/// Executor side of a running execution.
#[derive(Debug, Clone)]
pub struct ExecutionReporter {
    events: mpsc::Sender<ExecutionEvent>,
    cancel_rx: watch::Receiver<bool>,
}

impl ExecutionHandle {
    /// Create a connected handle / reporter pair.
    pub fn channel() -> (ExecutionHandle, ExecutionReporter) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (
            ExecutionHandle {
                events: events_rx,
                cancel_tx: Arc::new(cancel_tx),
            },
            ExecutionReporter {
                events: events_tx,
                cancel_rx,
            },
        )
    }

    /// Next event, or `None` once the executor is gone.
    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }

    /// Request cancellation. Idempotent; returns true on the first call.
    pub fn cancel(&self) -> bool {
        !self.cancel_tx.send_replace(true)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

impl ExecutionReporter {
    /// Report progress without waiting. Dropped if the supervisor is behind.
    pub fn progress(&self, percent: u8) {
        let _ = self.events.try_send(ExecutionEvent::Progress(percent.min(100)));
    }

    pub async fn succeeded(&self, output: PathBuf) {
        let _ = self.events.send(ExecutionEvent::Succeeded { output }).await;
    }

    pub async fn failed(&self, message: impl Into<String>) {
        let _ = self
            .events
            .send(ExecutionEvent::Failed {
                message: message.into(),
            })
            .await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }
}

/// Runs media operations for jobs.
#[async_trait]
pub trait MediaExecutor: Send + Sync {
    /// Start work for a job. Returns once the work is running.
    async fn execute(&self, request: ExecutionRequest) -> MediaResult<ExecutionHandle>;
}

/// Executor backed by the ffmpeg / ffprobe binaries.
#[derive(Debug, Clone, Default)]
pub struct FfmpegExecutor;

impl FfmpegExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaExecutor for FfmpegExecutor {
    async fn execute(&self, request: ExecutionRequest) -> MediaResult<ExecutionHandle> {
        check_ffmpeg()?;
        if !request.input.exists() {
            return Err(MediaError::FileNotFound(request.input.clone()));
        }
        tokio::fs::create_dir_all(&request.work_dir).await?;

        let (handle, reporter) = ExecutionHandle::channel();
        tokio::spawn(async move {
            let job_id = request.job_id.clone();
            let started = Instant::now();

            match run_ffmpeg(&request, &reporter).await {
                Ok(output) => {
                    histogram!(
                        "vcs_ffmpeg_duration_seconds",
                        "operation" => request.operation.as_str()
                    )
                    .record(started.elapsed().as_secs_f64());
                    reporter.succeeded(output).await;
                }
                Err(MediaError::Cancelled) => {
                    info!(job_id = %job_id, "FFmpeg run cancelled");
                    remove_partial_output(&request).await;
                    reporter.failed(MediaError::Cancelled.to_string()).await;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "FFmpeg run failed");
                    remove_partial_output(&request).await;
                    reporter.failed(e.summary()).await;
                }
            }
        });

        Ok(handle)
    }
}

async fn run_ffmpeg(request: &ExecutionRequest, reporter: &ExecutionReporter) -> MediaResult<PathBuf> {
    let info = match probe_video(&request.input).await {
        Ok(info) => Some(info),
        // Compression settings depend on the probe; other operations only lose
        // percentage progress without it.
        Err(e) if request.operation == Operation::Compress => return Err(e),
        Err(e) => {
            warn!(job_id = %request.job_id, error = %e, "Probe failed, progress will be coarse");
            None
        }
    };

    let output = request.output_path();
    let cmd = build_command(&request.parameters, &request.input, &output, info.as_ref());
    let total_ms = expected_duration_ms(&request.parameters, info.as_ref()).unwrap_or(0);

    debug!(job_id = %request.job_id, operation = %request.operation, "Starting FFmpeg");
    reporter.progress(0);

    let progress_reporter = reporter.clone();
    FfmpegRunner::new()
        .with_cancel(reporter.cancel_signal())
        .run_with_progress(&cmd, move |progress| {
            progress_reporter.progress(progress.percentage(total_ms).floor() as u8);
        })
        .await?;

    let metadata = tokio::fs::metadata(&output)
        .await
        .map_err(|_| MediaError::EmptyOutput(output.clone()))?;
    if metadata.len() == 0 {
        return Err(MediaError::EmptyOutput(output));
    }

    Ok(output)
}

async fn remove_partial_output(request: &ExecutionRequest) {
    let output = request.output_path();
    if let Err(e) = tokio::fs::remove_file(&output).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(job_id = %request.job_id, error = %e, "Failed to remove partial output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcs_models::ClipWindow;

    #[tokio::test]
    async fn test_handle_receives_reported_events() {
        let (mut handle, reporter) = ExecutionHandle::channel();

        reporter.progress(25);
        reporter.progress(250);
        reporter.succeeded(PathBuf::from("/work/output.mp4")).await;
        drop(reporter);

        assert_eq!(handle.next_event().await, Some(ExecutionEvent::Progress(25)));
        assert_eq!(handle.next_event().await, Some(ExecutionEvent::Progress(100)));
        let done = handle.next_event().await.unwrap();
        assert!(done.is_terminal());
        assert_eq!(handle.next_event().await, None);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (handle, reporter) = ExecutionHandle::channel();
        let mut signal = reporter.cancel_signal();

        assert!(!reporter.is_cancelled());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
        assert!(reporter.is_cancelled());
        signal.wait_for(|c| *c).await.unwrap();
    }

    #[test]
    fn test_output_path_uses_operation_extension() {
        let request = ExecutionRequest::new(
            JobId::from_string("job-1"),
            JobParameters::Gif(ClipWindow {
                start_time: 0.0,
                duration: 1.0,
            }),
            PathBuf::from("/uploads/in.mp4"),
            PathBuf::from("/work/job-1"),
        );
        assert_eq!(request.operation, Operation::Gif);
        assert_eq!(request.output_path(), PathBuf::from("/work/job-1/output.gif"));
    }

    #[tokio::test]
    async fn test_missing_input_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let request = ExecutionRequest::new(
            JobId::new(),
            JobParameters::Compress,
            tmp.path().join("missing.mp4"),
            tmp.path().join("job"),
        );

        match FfmpegExecutor::new().execute(request).await {
            Err(MediaError::FileNotFound(_)) | Err(MediaError::FfmpegNotFound) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
