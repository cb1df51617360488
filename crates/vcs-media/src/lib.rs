//! FFmpeg CLI wrapper and media executor.
//!
//! This crate provides:
//! - FFmpeg command building and execution with progress and cancellation
//! - FFprobe metadata extraction
//! - Per-operation command construction
//! - The [`MediaExecutor`] seam used by the dispatcher

pub mod command;
pub mod error;
pub mod executor;
pub mod operations;
pub mod probe;
pub mod progress;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use executor::{
    ExecutionEvent, ExecutionHandle, ExecutionReporter, ExecutionRequest, FfmpegExecutor,
    MediaExecutor,
};
pub use probe::{probe_video, VideoInfo};
pub use progress::FfmpegProgress;
