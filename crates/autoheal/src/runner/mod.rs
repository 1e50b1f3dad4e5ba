//! Action runners.
//!
//! The engine talks to the outside world through three traits:
//! - [`JobLauncher`] launches AWX job templates
//! - [`BatchJobCreator`] creates Kubernetes batch jobs
//! - [`JobStatusQuerier`] asks AWX how a launched job is doing
//!
//! [`Disabled`] stands in for a backend that isn't configured.

pub mod awx;
pub mod batch;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::alert::Alert;
use crate::error::RunnerError;
use crate::rules::JobAction;

pub use awx::{AwxClient, AwxSettings};
pub use batch::{prepare_job, KubeBatchJobCreator};

/// Identifier of an AWX job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of an AWX job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Pending,
    Waiting,
    Running,
    Successful,
    Failed,
    Error,
    #[serde(alias = "cancelled")]
    Canceled,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// Whether the job reached a terminal state.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failed | Self::Error | Self::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Result of creating a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchJobOutcome {
    Created,
    /// A job with the same name already exists; nothing was created
    AlreadyExists,
}

/// Launches AWX job templates.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Launch the job described by `action` to heal `alert`.
    async fn launch(&self, action: &JobAction, alert: &Alert) -> Result<JobId, RunnerError>;
}

/// Creates Kubernetes batch jobs.
#[async_trait]
pub trait BatchJobCreator: Send + Sync {
    /// Create the job. It must have a name and a namespace, see [`prepare_job`].
    async fn create(&self, job: Job) -> Result<BatchJobOutcome, RunnerError>;
}

/// Reports the status of launched AWX jobs.
#[async_trait]
pub trait JobStatusQuerier: Send + Sync {
    async fn status(&self, id: JobId) -> Result<JobStatus, RunnerError>;
}

/// Runner for a backend that isn't configured. Every call fails.
#[derive(Debug, Clone, Copy)]
pub struct Disabled(pub &'static str);

#[async_trait]
impl JobLauncher for Disabled {
    async fn launch(&self, _action: &JobAction, _alert: &Alert) -> Result<JobId, RunnerError> {
        Err(RunnerError::NotConfigured(self.0))
    }
}

#[async_trait]
impl BatchJobCreator for Disabled {
    async fn create(&self, _job: Job) -> Result<BatchJobOutcome, RunnerError> {
        Err(RunnerError::NotConfigured(self.0))
    }
}

#[async_trait]
impl JobStatusQuerier for Disabled {
    async fn status(&self, _id: JobId) -> Result<JobStatus, RunnerError> {
        Err(RunnerError::NotConfigured(self.0))
    }
}
