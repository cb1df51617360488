//! Registry and governor configuration.

use std::time::Duration;

use vcs_models::Operation;

/// Estimated CPU share per operation, as a fraction of the host.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuShares {
    pub compress: f64,
    pub resolution: f64,
    pub aspect_ratio: f64,
    pub extract_audio: f64,
    pub gif: f64,
    pub webm: f64,
}

impl Default for CpuShares {
    fn default() -> Self {
        Self {
            compress: 0.20,
            resolution: 0.15,
            aspect_ratio: 0.15,
            extract_audio: 0.05,
            gif: 0.10,
            webm: 0.15,
        }
    }
}

impl CpuShares {
    pub fn for_operation(&self, operation: Operation) -> f64 {
        match operation {
            Operation::Compress => self.compress,
            Operation::Resolution => self.resolution,
            Operation::AspectRatio => self.aspect_ratio,
            Operation::ExtractAudio => self.extract_audio,
            Operation::Gif => self.gif,
            Operation::Webm => self.webm,
        }
    }

    /// Read `CPU_SHARE_<OPERATION>` overrides.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let share = |op: Operation, default: f64| -> f64 {
            std::env::var(format!("CPU_SHARE_{}", op.as_str().to_uppercase()))
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        };

        Self {
            compress: share(Operation::Compress, defaults.compress),
            resolution: share(Operation::Resolution, defaults.resolution),
            aspect_ratio: share(Operation::AspectRatio, defaults.aspect_ratio),
            extract_audio: share(Operation::ExtractAudio, defaults.extract_audio),
            gif: share(Operation::Gif, defaults.gif),
            webm: share(Operation::Webm, defaults.webm),
        }
    }
}

/// Resource governor configuration.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Maximum sum of active CPU shares
    pub cpu_ceiling: f64,
    /// Per-operation share estimates
    pub shares: CpuShares,
    /// Maximum simultaneous grants
    pub max_concurrent_jobs: usize,
    /// Packet rate the host must keep available
    pub throughput_min_pps: u64,
    /// Packet size for the throughput target
    pub throughput_packet_bytes: u64,
    /// Packet rate the host sustains when idle
    pub host_io_capacity_pps: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            cpu_ceiling: 0.60,
            shares: CpuShares::default(),
            max_concurrent_jobs: 4,
            throughput_min_pps: 5000,
            throughput_packet_bytes: 1400,
            host_io_capacity_pps: 20_000,
        }
    }
}

impl GovernorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            cpu_ceiling: std::env::var("CPU_CEILING")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.60),
            shares: CpuShares::from_env(),
            max_concurrent_jobs: std::env::var("MAX_CONCURRENT_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4),
            throughput_min_pps: std::env::var("THROUGHPUT_MIN_PPS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5000),
            throughput_packet_bytes: std::env::var("THROUGHPUT_PACKET_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1400),
            host_io_capacity_pps: std::env::var("HOST_IO_CAPACITY_PPS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20_000),
        }
    }
}

/// Job registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Longest a job may stay queued
    pub max_wait: Duration,
    /// Longest a running job may go without progress
    pub stall_timeout: Duration,
    /// Maximum number of queued jobs
    pub max_queue_depth: usize,
    /// How long terminal jobs stay queryable
    pub retention: Duration,
    /// Bytes reserved for every job's output
    pub output_reservation_bytes: u64,
    /// Lower bound for the working-set estimate
    pub min_working_bytes: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(3600), // 1 hour
            stall_timeout: Duration::from_secs(300),
            max_queue_depth: 100,
            retention: Duration::from_secs(24 * 3600),
            output_reservation_bytes: 256 * 1024 * 1024,
            min_working_bytes: 16 * 1024 * 1024,
        }
    }
}

impl RegistryConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_wait: Duration::from_secs(
                std::env::var("MAX_WAIT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            stall_timeout: Duration::from_secs(
                std::env::var("STALL_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            max_queue_depth: std::env::var("MAX_QUEUE_DEPTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_queue_depth),
            retention: Duration::from_secs(
                std::env::var("JOB_RETENTION_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(24 * 3600),
            ),
            output_reservation_bytes: std::env::var("OUTPUT_RESERVATION_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.output_reservation_bytes),
            min_working_bytes: std::env::var("MIN_WORKING_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.min_working_bytes),
        }
    }

    /// Extra working space per input byte, on top of the input itself.
    pub fn working_factor(operation: Operation) -> f64 {
        match operation {
            Operation::Compress | Operation::Resolution | Operation::AspectRatio => 1.0,
            Operation::Webm => 0.5,
            Operation::Gif => 0.25,
            Operation::ExtractAudio => 0.1,
        }
    }

    /// Working-set estimate for a job.
    pub fn working_bytes(&self, operation: Operation, input_bytes: u64) -> u64 {
        let base = input_bytes.max(self.min_working_bytes) as f64;
        let estimate = base * (1.0 + Self::working_factor(operation));
        if estimate >= u64::MAX as f64 {
            u64::MAX
        } else {
            estimate.ceil() as u64
        }
    }
}

/// Combined configuration for the crate.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    pub registry: RegistryConfig,
    pub governor: GovernorConfig,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            registry: RegistryConfig::from_env(),
            governor: GovernorConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shares_fit_ceiling() {
        let config = GovernorConfig::default();
        for op in Operation::ALL {
            assert!(config.shares.for_operation(*op) <= config.cpu_ceiling);
        }
        assert_eq!(config.shares.for_operation(Operation::Compress), 0.20);
    }

    #[test]
    fn test_working_bytes_uses_floor() {
        let config = RegistryConfig {
            min_working_bytes: 1000,
            ..Default::default()
        };
        assert_eq!(config.working_bytes(Operation::Compress, 10), 2000);
        assert_eq!(config.working_bytes(Operation::Compress, 5000), 10_000);
        assert_eq!(config.working_bytes(Operation::Gif, 4000), 5000);
        assert_eq!(config.working_bytes(Operation::Compress, u64::MAX), u64::MAX);
    }
}
