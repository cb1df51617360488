//! Storage ledger.
//!
//! Tracks bytes reserved against a fixed capacity. Every reservation is
//! check-then-commit under a single mutex, so concurrent reservations can
//! never jointly exceed the capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, warn};

use vcs_models::JobId;

use crate::config::LedgerConfig;
use crate::error::{StorageError, StorageResult};

/// A held claim against the ledger.
///
/// Clones share the same "released" flag, so releasing any clone releases the
/// reservation exactly once.
#[derive(Debug, Clone)]
pub struct ReservationToken {
    id: u64,
    job_id: JobId,
    bytes: u64,
    released: Arc<AtomicBool>,
}

impl ReservationToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Ledger usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub capacity: u64,
    pub used: u64,
    pub available: u64,
    pub reservations: usize,
}

impl StorageStats {
    pub fn usage_percent(&self) -> f64 {
        if self.capacity == 0 {
            return 100.0;
        }
        (self.used as f64 / self.capacity as f64) * 100.0
    }
}

#[derive(Debug, Default)]
struct LedgerInner {
    used: u64,
    next_id: u64,
    reservations: HashMap<u64, (JobId, u64)>,
}

/// Byte ledger with a fixed capacity.
#[derive(Debug)]
pub struct StorageLedger {
    capacity: u64,
    inner: Mutex<LedgerInner>,
}

impl StorageLedger {
    /// Create a new ledger.
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_capacity(config.capacity_bytes)
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `bytes` for a job, or fail without side effects.
    pub fn reserve(&self, job_id: &JobId, bytes: u64) -> StorageResult<ReservationToken> {
        let mut inner = self.lock();
        let available = self.capacity.saturating_sub(inner.used);

        if bytes > available {
            debug!(
                job_id = %job_id,
                requested = bytes,
                available,
                "Storage reservation rejected"
            );
            return Err(StorageError::capacity_exceeded(bytes, available));
        }

        inner.used += bytes;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.reservations.insert(id, (job_id.clone(), bytes));

        debug!(
            job_id = %job_id,
            reservation = id,
            bytes,
            used = inner.used,
            "Storage reserved"
        );

        Ok(ReservationToken {
            id,
            job_id: job_id.clone(),
            bytes,
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Release a reservation.
    ///
    /// Releasing an unknown or already-released token is a no-op reported as a
    /// warning. Returns true if bytes were returned to the ledger.
    pub fn release(&self, token: &ReservationToken) -> bool {
        if token.released.swap(true, Ordering::AcqRel) {
            warn!(
                job_id = %token.job_id,
                reservation = token.id,
                "Storage reservation already released"
            );
            return false;
        }

        let mut inner = self.lock();
        match inner.reservations.remove(&token.id) {
            Some((_, bytes)) => {
                inner.used = inner.used.saturating_sub(bytes);
                debug!(
                    job_id = %token.job_id,
                    reservation = token.id,
                    bytes,
                    used = inner.used,
                    "Storage released"
                );
                true
            }
            None => {
                warn!(
                    job_id = %token.job_id,
                    reservation = token.id,
                    "Release of unknown storage reservation ignored"
                );
                false
            }
        }
    }

    /// Bytes currently reserved.
    pub fn current_usage(&self) -> u64 {
        self.lock().used
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.current_usage())
    }

    /// Bytes reserved on behalf of one job.
    pub fn reserved_for(&self, job_id: &JobId) -> u64 {
        self.lock()
            .reservations
            .values()
            .filter(|(owner, _)| owner == job_id)
            .map(|(_, bytes)| bytes)
            .sum()
    }

    pub fn stats(&self) -> StorageStats {
        let inner = self.lock();
        StorageStats {
            capacity: self.capacity,
            used: inner.used,
            available: self.capacity.saturating_sub(inner.used),
            reservations: inner.reservations.len(),
        }
    }
}
