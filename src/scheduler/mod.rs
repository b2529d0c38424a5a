//! Batch scheduler abstraction
//!
//! Everything above this module only sees three operations and a small
//! error taxonomy. Transport failures and retries stay inside the adapter.

pub mod retry;
pub mod slurm;

#[cfg(any(test, feature = "testkit"))]
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recipe::ResolvedSpec;

pub use retry::RetryPolicy;
pub use slurm::{CommandRunner, LocalRunner, SlurmScheduler, SlurmSettings, TunnelRunner};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The scheduler rejected the job description
    #[error("Invalid job specification: {0}")]
    InvalidSpec(String),

    /// Account or QOS limits prevent the submission
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Transient failure that survived the retry budget
    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),

    /// Credentials were refused; not retried
    #[error("Scheduler authentication failed: {0}")]
    Unauthorized(String),

    #[error("Job '{0}' not found")]
    NotFound(String),
}

impl SchedulerError {
    /// Whether a retry might succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Unavailable(_))
    }
}

/// What gets submitted for one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job name shown by the scheduler, unique per replica
    pub name: String,
    pub spec: ResolvedSpec,
    /// Port the workload must listen on (exported as `SERVICE_PORT`)
    pub port: u16,
}

/// Coarse job state as the scheduler sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobState {
    /// Waiting for resources
    Queued,
    /// Resources allocated on `node`
    Running { node: String },
    /// Job finished with the given exit code
    Exited { code: i32 },
    /// Scheduler has no record of the job
    Unknown,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => f.write_str("queued"),
            JobState::Running { node } => write!(f, "running on {}", node),
            JobState::Exited { code } => write!(f, "exited({})", code),
            JobState::Unknown => f.write_str("unknown"),
        }
    }
}

/// Submit, query and cancel jobs on an external batch scheduler
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Submit a job and return its scheduler-assigned id
    async fn submit(&self, job: &JobSpec) -> Result<String, SchedulerError>;

    /// Current state of a job
    async fn query(&self, job_id: &str) -> Result<JobState, SchedulerError>;

    /// Cancel a job. Cancelling a job that already finished succeeds.
    async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError>;

    /// Cancel whatever job carries `name`, for submissions whose outcome
    /// is unknown. No matching job is not an error.
    async fn cancel_named(&self, name: &str) -> Result<(), SchedulerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(SchedulerError::Unavailable("timeout".into()).is_transient());
        assert!(!SchedulerError::InvalidSpec("bad".into()).is_transient());
        assert!(!SchedulerError::QuotaExceeded("qos".into()).is_transient());
        assert!(!SchedulerError::Unauthorized("key".into()).is_transient());
    }

    #[test]
    fn test_job_state_display() {
        assert_eq!(JobState::Queued.to_string(), "queued");
        assert_eq!(
            JobState::Running {
                node: "gpu01".into()
            }
            .to_string(),
            "running on gpu01"
        );
        assert_eq!(JobState::Exited { code: 1 }.to_string(), "exited(1)");
    }
}
