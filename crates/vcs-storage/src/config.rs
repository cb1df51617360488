//! Storage configuration.

/// Default capacity: 4 TiB.
pub const DEFAULT_CAPACITY_BYTES: u64 = 4 * 1024 * 1024 * 1024 * 1024;

/// Storage ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Total bytes that may be reserved at once
    pub capacity_bytes: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
        }
    }
}

impl LedgerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            capacity_bytes: std::env::var("STORAGE_CAPACITY_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CAPACITY_BYTES),
        }
    }
}
