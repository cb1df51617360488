//! MMP protocol gateway for the video compressor service.
//!
//! This crate provides:
//! - The length-delimited MMP frame codec
//! - Submit / status / download request handling over TCP
//! - The expiry sweeper background service
//! - A polling client
//! - Prometheus metrics

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod metrics;
pub mod server;
pub mod services;
pub mod state;

pub use client::{ClientError, ClientResult, Download, VcsClient};
pub use config::{ApiConfig, ClientConfig};
pub use error::{ApiError, ApiResult};
pub use frame::{Frame, FrameError};
pub use gateway::Gateway;
pub use server::Server;
pub use services::{ExpirySweeper, SweepReport};
pub use state::AppState;
