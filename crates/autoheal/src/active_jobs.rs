//! Tracking of launched AWX jobs.
//!
//! Every AWX job the engine launches is recorded in [`ActiveJobs`]. The
//! [`ActiveJobPoller`] asks AWX for the status of each of them on a fixed interval,
//! and retires the ones that finished.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsSink;
use crate::runner::{JobId, JobStatusQuerier};

/// Shortest interval between two status checks.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

const AWX_JOB: &str = "AWXJob";

/// A launched job and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveJob {
    pub rule: String,
    pub template: String,
}

/// Set of launched jobs that haven't finished yet.
#[derive(Debug, Default)]
pub struct ActiveJobs {
    jobs: RwLock<HashMap<JobId, ActiveJob>>,
}

impl ActiveJobs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: JobId, job: ActiveJob) {
        self.jobs.write().await.insert(id, job);
    }

    pub async fn remove(&self, id: JobId) -> Option<ActiveJob> {
        self.jobs.write().await.remove(&id)
    }

    /// Identifiers of the tracked jobs, sorted.
    pub async fn ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.jobs.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

/// Periodic status checker for [`ActiveJobs`].
pub struct ActiveJobPoller {
    jobs: Arc<ActiveJobs>,
    querier: Arc<dyn JobStatusQuerier>,
    metrics: Arc<dyn MetricsSink>,
    interval: Duration,
}

impl ActiveJobPoller {
    #[must_use]
    pub fn new(
        jobs: Arc<ActiveJobs>,
        querier: Arc<dyn JobStatusQuerier>,
        metrics: Arc<dyn MetricsSink>,
        interval: Duration,
    ) -> Self {
        Self {
            jobs,
            querier,
            metrics,
            interval,
        }
    }

    /// Check every tracked job once. Returns the jobs that were retired.
    pub async fn poll_once(&self) -> Vec<JobId> {
        let ids = self.jobs.ids().await;
        if ids.is_empty() {
            return Vec::new();
        }
        info!(count = ids.len(), "Going over active jobs");

        let mut finished = Vec::new();
        for id in ids {
            match self.querier.status(id).await {
                Ok(status) if status.is_finished() => {
                    info!(job = %id, %status, "Job finished");
                    finished.push(id);
                }
                Ok(status) => {
                    debug!(job = %id, %status, "Job is still active");
                }
                Err(e) => {
                    error!(job = %id, error = %e, "Failed to check job status");
                }
            }
        }

        for id in &finished {
            if let Some(job) = self.jobs.remove(*id).await {
                info!(job = %id, rule = %job.rule, "Removing finished job from active jobs");
                self.metrics
                    .action_completed(AWX_JOB, &job.template, &job.rule);
            }
        }
        finished
    }

    /// Poll until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let period = if self.interval < MIN_POLL_INTERVAL {
            warn!(
                interval_ms = self.interval.as_millis(),
                min_ms = MIN_POLL_INTERVAL.as_millis(),
                "Job status check interval is too short, using the minimum"
            );
            MIN_POLL_INTERVAL
        } else {
            self.interval
        };
        info!(interval_secs = period.as_secs(), "Active jobs poller started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
        info!("Active jobs poller stopped");
    }
}
