//! Background maintenance of the job table.
//!
//! Each sweep fails STARTED jobs whose worker vanished (timeout plus grace
//! elapsed) and deletes terminal jobs whose result retention expired.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::job_queue::JobQueue;
use crate::Result;

/// Configuration for the sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Interval between sweeps in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Maximum jobs deleted per statement.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Extra time a started job gets beyond its own timeout before it is
    /// failed on the worker's behalf.
    #[serde(default = "default_overdue_grace_secs")]
    pub overdue_grace_secs: u64,
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> u32 {
    100
}

fn default_overdue_grace_secs() -> u64 {
    30
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            batch_size: default_batch_size(),
            overdue_grace_secs: default_overdue_grace_secs(),
        }
    }
}

impl SweepConfig {
    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs.max(1);
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_overdue_grace_secs(mut self, secs: u64) -> Self {
        self.overdue_grace_secs = secs;
        self
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub failed_overdue: usize,
    pub purged: u64,
}

pub struct JobSweeper {
    config: SweepConfig,
    queue: Arc<JobQueue>,
}

impl JobSweeper {
    pub fn new(config: SweepConfig, queue: Arc<JobQueue>) -> Self {
        Self { config, queue }
    }

    /// Run a single sweep.
    pub async fn run_sweep(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let grace = Duration::from_secs(self.config.overdue_grace_secs);
        let failed_overdue = self.queue.fail_overdue(now, grace).await?.len();

        let mut purged = 0u64;
        loop {
            let deleted = self.queue.purge_expired(now, self.config.batch_size).await?;
            purged += deleted;
            if deleted < u64::from(self.config.batch_size) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if failed_overdue > 0 || purged > 0 {
            info!(failed_overdue, purged, "Job sweep completed");
        } else {
            debug!("Job sweep found nothing to do");
        }

        Ok(SweepReport {
            failed_overdue,
            purged,
        })
    }

    /// Start the background sweep task.
    pub fn start_background_task(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut check_interval =
                interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
            info!(
                interval_secs = self.config.check_interval_secs,
                "Job sweeper started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Job sweeper shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = self.run_sweep().await {
                            error!("Job sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
