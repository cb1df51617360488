//! Job dispatcher.
//!
//! This crate provides:
//! - FIFO claiming of queued jobs bounded by the resource governor
//! - Supervision of each execution with stall detection
//! - Graceful shutdown of in-flight work

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;

pub use config::WorkerConfig;
pub use dispatcher::Dispatcher;
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
