//! CPU-share governor.
//!
//! Each running job holds a grant for its operation's estimated CPU share.
//! Shares are tracked in basis points so the running sum is exact and the
//! ceiling check never suffers from float drift.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, warn};

use vcs_models::{JobId, Operation};

use crate::config::GovernorConfig;
use crate::error::{QueueError, QueueResult};
use crate::metrics;

/// Basis points in a whole host.
pub const BASIS_POINTS: u32 = 10_000;

fn to_basis_points(share: f64) -> u32 {
    if !share.is_finite() || share <= 0.0 {
        return 0;
    }
    (share * BASIS_POINTS as f64).round().min(u32::MAX as f64) as u32
}

fn to_share(basis_points: u32) -> f64 {
    basis_points as f64 / BASIS_POINTS as f64
}

/// A held CPU grant. Clones share the released flag.
#[derive(Debug, Clone)]
pub struct GrantToken {
    id: u64,
    job_id: JobId,
    basis_points: u32,
    released: Arc<AtomicBool>,
}

impl GrantToken {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn share(&self) -> f64 {
        to_share(self.basis_points)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Packet-rate headroom left by the active grants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThroughputHeadroom {
    /// Packets per second still available to the network path
    pub available_pps: u64,
    /// Configured target
    pub required_pps: u64,
    /// Available throughput in bytes per second
    pub available_bytes_per_sec: u64,
    pub within_sla: bool,
}

#[derive(Debug, Default)]
struct GovernorInner {
    active_bp: u32,
    next_id: u64,
    grants: HashMap<u64, (JobId, u32)>,
}

/// CPU-share governor with a fixed ceiling and a concurrency bound.
#[derive(Debug)]
pub struct ResourceGovernor {
    config: GovernorConfig,
    ceiling_bp: u32,
    inner: Mutex<GovernorInner>,
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        let ceiling_bp = to_basis_points(config.cpu_ceiling).min(BASIS_POINTS);
        Self {
            config,
            ceiling_bp,
            inner: Mutex::new(GovernorInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GovernorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Estimated share for an operation.
    pub fn estimated_share(&self, operation: Operation) -> f64 {
        self.config.shares.for_operation(operation)
    }

    pub fn ceiling(&self) -> f64 {
        to_share(self.ceiling_bp)
    }

    /// Fails when `share` could never be granted, even on an idle host.
    pub fn check_admissible(&self, share: f64) -> QueueResult<()> {
        let bp = to_basis_points(share);
        if bp > self.ceiling_bp {
            return Err(QueueError::resource_exhausted(format!(
                "CPU share {:.2} exceeds ceiling {:.2}",
                share,
                self.ceiling()
            )));
        }
        if self.config.max_concurrent_jobs == 0 {
            return Err(QueueError::resource_exhausted("no execution slots configured"));
        }
        Ok(())
    }

    /// Grant `share` to a job, or fail fast.
    pub fn acquire(&self, job_id: &JobId, share: f64) -> QueueResult<GrantToken> {
        let bp = to_basis_points(share);
        let mut inner = self.lock();

        if inner.grants.len() >= self.config.max_concurrent_jobs {
            return Err(QueueError::resource_exhausted(format!(
                "all {} execution slots in use",
                self.config.max_concurrent_jobs
            )));
        }
        if inner.active_bp.saturating_add(bp) > self.ceiling_bp {
            return Err(QueueError::resource_exhausted(format!(
                "CPU share {:.2} would exceed ceiling {:.2} ({:.2} active)",
                share,
                self.ceiling(),
                to_share(inner.active_bp)
            )));
        }

        inner.active_bp += bp;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.grants.insert(id, (job_id.clone(), bp));
        metrics::set_cpu_share_active(to_share(inner.active_bp));

        debug!(
            job_id = %job_id,
            share,
            active = to_share(inner.active_bp),
            "CPU share granted"
        );

        Ok(GrantToken {
            id,
            job_id: job_id.clone(),
            basis_points: bp,
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Acquire the estimated share for an operation.
    pub fn acquire_for(&self, job_id: &JobId, operation: Operation) -> QueueResult<GrantToken> {
        self.acquire(job_id, self.estimated_share(operation))
    }

    /// Return a grant. Idempotent; returns true if the share was freed.
    pub fn release(&self, token: &GrantToken) -> bool {
        if token.released.swap(true, Ordering::AcqRel) {
            warn!(job_id = %token.job_id, "CPU grant already released");
            return false;
        }

        let mut inner = self.lock();
        match inner.grants.remove(&token.id) {
            Some((_, bp)) => {
                inner.active_bp = inner.active_bp.saturating_sub(bp);
                metrics::set_cpu_share_active(to_share(inner.active_bp));
                debug!(
                    job_id = %token.job_id,
                    active = to_share(inner.active_bp),
                    "CPU share released"
                );
                true
            }
            None => {
                warn!(job_id = %token.job_id, "Release of unknown CPU grant ignored");
                false
            }
        }
    }

    pub fn active_share(&self) -> f64 {
        to_share(self.lock().active_bp)
    }

    pub fn active_grants(&self) -> usize {
        self.lock().grants.len()
    }

    /// Whether a grant of `share` would currently succeed.
    pub fn has_room_for(&self, share: f64) -> bool {
        let inner = self.lock();
        inner.grants.len() < self.config.max_concurrent_jobs
            && inner.active_bp.saturating_add(to_basis_points(share)) <= self.ceiling_bp
    }

    /// Packet throughput left for the network path at the current load.
    ///
    /// Reporting only; never used to refuse work.
    pub fn throughput_headroom(&self) -> ThroughputHeadroom {
        let active_bp = self.lock().active_bp.min(BASIS_POINTS);
        let idle_bp = (BASIS_POINTS - active_bp) as u64;
        let available_pps = self.config.host_io_capacity_pps * idle_bp / BASIS_POINTS as u64;

        ThroughputHeadroom {
            available_pps,
            required_pps: self.config.throughput_min_pps,
            available_bytes_per_sec: available_pps * self.config.throughput_packet_bytes,
            within_sla: available_pps >= self.config.throughput_min_pps,
        }
    }
}
