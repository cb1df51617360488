//! Job registry, admission control and resource governance.
//!
//! This crate provides:
//! - A CPU-share governor with a fixed ceiling
//! - The in-memory job registry and its lifecycle transitions
//! - Per-client admission on top of the registry

pub mod admission;
pub mod config;
pub mod error;
pub mod governor;
pub mod metrics;
pub mod registry;

pub use admission::{normalize_client_ip, AdmissionController};
pub use config::{CpuShares, GovernorConfig, QueueConfig, RegistryConfig};
pub use error::{QueueError, QueueResult};
pub use governor::{GrantToken, ResourceGovernor, ThroughputHeadroom, BASIS_POINTS};
pub use registry::{JobRegistry, RegistryStats};
