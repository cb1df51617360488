//! Background service for expiring and purging jobs.
//!
//! Each pass:
//! - Expires queued jobs past the wait bound and running jobs past the stall bound
//! - Purges finished jobs past retention and deletes their files
//! - Publishes registry gauges and reports throughput headroom

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use vcs_models::{Job, JobId};
use vcs_queue::JobRegistry;
use vcs_storage::Workspace;

use crate::metrics;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub expired: Vec<JobId>,
    pub purged: usize,
}

/// Expiry sweeper service.
pub struct ExpirySweeper {
    registry: Arc<JobRegistry>,
    workspace: Workspace,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(registry: Arc<JobRegistry>, workspace: Workspace, interval: Duration) -> Self {
        Self {
            registry,
            workspace,
            interval,
        }
    }

    /// Run until `shutdown` is raised.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting expiry sweeper (interval: {:?})", self.interval);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.sweep_once(Utc::now()).await {
                error!("Expiry sweep error: {:#}", e);
            }
        }

        info!("Expiry sweeper stopped");
    }

    /// Run a single pass as of `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> anyhow::Result<SweepReport> {
        let expired = self.registry.sweep_expired(now);
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired stale jobs");
        }

        let purged = self.registry.purge_finished(now);
        let mut failures = 0usize;
        for job in &purged {
            if let Err(e) = self.remove_files(job).await {
                failures += 1;
                warn!(job_id = %job.id, "Failed to remove job files: {:#}", e);
            }
        }

        self.publish();
        metrics::record_sweep(expired.len(), purged.len());

        if failures > 0 {
            anyhow::bail!("failed to remove files of {failures} purged job(s)");
        }

        Ok(SweepReport {
            expired,
            purged: purged.len(),
        })
    }

    async fn remove_files(&self, job: &Job) -> anyhow::Result<()> {
        self.workspace
            .remove_job_files(job)
            .await
            .with_context(|| format!("removing files of job {}", job.id))
    }

    fn publish(&self) {
        self.registry.stats().publish();

        let headroom = self.registry.governor().throughput_headroom();
        vcs_queue::metrics::set_throughput_headroom(headroom.available_pps);
        if headroom.within_sla {
            debug!(
                available_pps = headroom.available_pps,
                required_pps = headroom.required_pps,
                "Throughput headroom"
            );
        } else {
            warn!(
                available_pps = headroom.available_pps,
                required_pps = headroom.required_pps,
                available_bytes_per_sec = headroom.available_bytes_per_sec,
                "Throughput headroom below target"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;
    use vcs_models::JobState;
    use vcs_queue::{GovernorConfig, RegistryConfig, ResourceGovernor};
    use vcs_storage::StorageLedger;

    fn registry(config: RegistryConfig) -> Arc<JobRegistry> {
        Arc::new(JobRegistry::new(
            RegistryConfig {
                min_working_bytes: 1024,
                output_reservation_bytes: 1024,
                ..config
            },
            Arc::new(StorageLedger::with_capacity(1 << 30)),
            Arc::new(ResourceGovernor::new(GovernorConfig::default())),
        ))
    }

    fn client(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 1, 0, n))
    }

    #[tokio::test]
    async fn test_sweep_expires_waiting_jobs() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path());
        let registry = registry(RegistryConfig {
            max_wait: Duration::from_secs(60),
            ..Default::default()
        });
        let staged = workspace.stage_upload(b"video", "mp4").await.unwrap();
        let job_id = registry
            .submit(client(1), "compress", &json!({}), &staged)
            .unwrap();

        let sweeper = ExpirySweeper::new(Arc::clone(&registry), workspace, Duration::from_secs(1));

        let report = sweeper.sweep_once(Utc::now()).await.unwrap();
        assert!(report.expired.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let report = sweeper.sweep_once(later).await.unwrap();
        assert_eq!(report.expired, vec![job_id.clone()]);
        assert_eq!(registry.status_of(&job_id).unwrap().state, JobState::Expired);
        assert_eq!(registry.ledger().current_usage(), 0);
    }

    #[tokio::test]
    async fn test_purge_removes_job_files() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path());
        let registry = registry(RegistryConfig {
            retention: Duration::from_secs(60),
            ..Default::default()
        });

        let staged = workspace.stage_upload(b"video", "mp4").await.unwrap();
        let job_id = registry
            .submit(client(2), "extract_audio", &json!({}), &staged)
            .unwrap();
        registry.claim_next().unwrap().unwrap();
        let dir = workspace.prepare_job_dir(&job_id).await.unwrap();
        let output = dir.join("output.mp3");
        tokio::fs::write(&output, b"mp3").await.unwrap();
        registry.complete(&job_id, &output).unwrap();
        assert_eq!(registry.ledger().current_usage(), 1024);

        let sweeper = ExpirySweeper::new(
            Arc::clone(&registry),
            workspace.clone(),
            Duration::from_secs(1),
        );
        let later = Utc::now() + chrono::Duration::seconds(120);
        let report = sweeper.sweep_once(later).await.unwrap();

        assert_eq!(report.purged, 1);
        assert!(registry.get(&job_id).is_none());
        assert_eq!(registry.ledger().current_usage(), 0);
        assert!(!dir.exists());
        assert!(!staged.path.exists());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let sweeper = ExpirySweeper::new(
            registry(RegistryConfig::default()),
            Workspace::new(tmp.path()),
            Duration::from_millis(10),
        );
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { sweeper.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
