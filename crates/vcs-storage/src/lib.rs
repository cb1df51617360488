//! Storage ledger and job workspace management.
//!
//! This crate provides:
//! - A byte-accurate ledger of storage reservations against a fixed capacity
//! - Idempotent reservation tokens
//! - Per-job working directories and staged uploads

pub mod config;
pub mod error;
pub mod ledger;
pub mod workspace;

pub use config::LedgerConfig;
pub use error::{StorageError, StorageResult};
pub use ledger::{ReservationToken, StorageLedger, StorageStats};
pub use workspace::{remove_staged_file, StagedInput, Workspace};
