//! Per-client admission.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use vcs_models::JobId;
use vcs_storage::StagedInput;

use crate::error::QueueResult;
use crate::registry::JobRegistry;

/// IPv4-mapped IPv6 peers count as their IPv4 address.
pub fn normalize_client_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        IpAddr::V4(_) => ip,
    }
}

/// Front door for new jobs.
#[derive(Clone)]
pub struct AdmissionController {
    registry: Arc<JobRegistry>,
}

impl AdmissionController {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Admit a job for the peer at `peer`.
    ///
    /// Jobs past their wait or stall bound are expired first so that a
    /// client whose previous job stalled is not refused as a duplicate.
    pub fn admit(
        &self,
        peer: SocketAddr,
        operation: &str,
        parameters: &Value,
        input: &StagedInput,
    ) -> QueueResult<JobId> {
        let client = normalize_client_ip(peer.ip());
        let expired = self.registry.sweep_expired(Utc::now());
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired jobs before admission");
        }
        self.registry.submit(client, operation, parameters, input)
    }
}
