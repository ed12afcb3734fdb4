//! Remote job, backend and provider interfaces.
//!
//! Remote job state machine as observed by the container:
//!
//! ```text
//!   Initializing ──→ Validating ──→ Queued ──→ Running ──→ Done
//!                                     │           │
//!                                     │           ├──→ Error
//!                                     └───────────┴──→ Cancelled
//! ```
//!
//! `Done`, `Cancelled` and `Error` are final.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::result::JobResult;
use crate::service::ExperimentService;

/// Status of a remote job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Initializing,
    Queued,
    Validating,
    Running,
    Cancelled,
    Done,
    Error,
}

impl JobStatus {
    /// Aggregation order, worst first. `Done` is the fallback and not listed.
    pub const PRECEDENCE: [JobStatus; 6] = [
        JobStatus::Error,
        JobStatus::Cancelled,
        JobStatus::Running,
        JobStatus::Queued,
        JobStatus::Validating,
        JobStatus::Initializing,
    ];

    /// Check if this is a final state.
    pub fn is_final(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Cancelled | JobStatus::Error)
    }

    pub fn name(self) -> &'static str {
        match self {
            JobStatus::Initializing => "INITIALIZING",
            JobStatus::Queued => "QUEUED",
            JobStatus::Validating => "VALIDATING",
            JobStatus::Running => "RUNNING",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Done => "DONE",
            JobStatus::Error => "ERROR",
        }
    }

    /// Worst status in `statuses`, or `Done` if none outranks it.
    pub fn aggregate<I: IntoIterator<Item = JobStatus>>(statuses: I) -> JobStatus {
        let seen: Vec<JobStatus> = statuses.into_iter().collect();
        Self::PRECEDENCE
            .into_iter()
            .find(|s| seen.contains(s))
            .unwrap_or(JobStatus::Done)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle to asynchronously executing remote work.
#[async_trait]
pub trait RemoteJob: Send + Sync {
    fn job_id(&self) -> &str;

    /// Backend the job was submitted to, if known.
    fn backend(&self) -> Option<Arc<dyn Backend>>;

    async fn status(&self) -> Result<JobStatus, JobError>;

    /// Wait for the job to finish and return its result.
    async fn result(&self) -> Result<JobResult, JobError>;

    async fn cancel(&self) -> Result<(), JobError>;

    async fn error_message(&self) -> Option<String> {
        None
    }

    async fn completion_time(&self) -> Option<DateTime<Utc>> {
        None
    }
}

impl fmt::Debug for dyn RemoteJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteJob({})", self.job_id())
    }
}

/// Hub/group/project triple identifying a provider instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub hub: Option<String>,
    pub group: Option<String>,
    pub project: Option<String>,
}

/// Source of job handles and, optionally, an experiment service.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn retrieve_job(&self, job_id: &str) -> Result<Arc<dyn RemoteJob>, JobError>;

    /// Experiment service reachable through this provider's credentials.
    fn experiment_service(&self) -> Option<Arc<dyn ExperimentService>> {
        None
    }

    /// Instance that serves `backend_name`.
    fn instance(&self, _backend_name: &str) -> Option<ProviderInstance> {
        None
    }
}

/// A device or simulator that jobs run on.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn provider(&self) -> Option<Arc<dyn Provider>> {
        None
    }
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backend({})", self.name())
    }
}
