//! Service lifecycle: submission, stop and reconciliation against the scheduler
//!
//! ```text
//! pending -> configuring -> starting -> running -> {completed | failed | cancelled}
//! ```
//!
//! `pending` follows the scheduler queue, `configuring`/`starting`/`running`
//! follow what a probe of the service port observes, and terminal states
//! follow the scheduler's exit report (or a stop request).

pub mod manager;
pub mod probe;
pub mod reconciler;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recipe::RecipeError;
use crate::scheduler::SchedulerError;
use crate::store::StoreError;

pub use manager::{
    Deployment, LifecycleManager, ReconcileOutcome, ReconcileSummary, SubmitRequest,
};
pub use probe::{HealthProber, HttpProber, ProbeOutcome};
pub use reconciler::{spawn_reconciler, ReconcilerHandle};

#[cfg(any(test, feature = "testkit"))]
pub use probe::StaticProber;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid specification: {0}")]
    InvalidSpec(String),

    #[error("Quota exceeded: {0}. Reduce the replica count or wait for running jobs to finish")]
    QuotaExceeded(String),

    #[error("Scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    #[error("Scheduler authentication failed: {0}")]
    SchedulerAuth(String),

    #[error("Record '{0}' not found")]
    RecordNotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LifecycleError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::InvalidSpec(_) => "INVALID_SPEC",
            LifecycleError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            LifecycleError::SchedulerUnavailable(_) => "SCHEDULER_UNAVAILABLE",
            LifecycleError::SchedulerAuth(_) => "SCHEDULER_AUTH",
            LifecycleError::RecordNotFound(_) => "RECORD_NOT_FOUND",
            LifecycleError::Timeout(_) => "TIMEOUT",
            LifecycleError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<SchedulerError> for LifecycleError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::InvalidSpec(m) => LifecycleError::InvalidSpec(m),
            SchedulerError::QuotaExceeded(m) => LifecycleError::QuotaExceeded(m),
            SchedulerError::Unavailable(m) => LifecycleError::SchedulerUnavailable(m),
            SchedulerError::Unauthorized(m) => LifecycleError::SchedulerAuth(m),
            SchedulerError::NotFound(id) => {
                LifecycleError::Internal(format!("scheduler lost job {}", id))
            }
        }
    }
}

impl From<RecipeError> for LifecycleError {
    fn from(e: RecipeError) -> Self {
        match e {
            RecipeError::NotFound(name) => {
                LifecycleError::InvalidSpec(format!("unknown recipe '{}'", name))
            }
            invalid @ RecipeError::Invalid { .. } => LifecycleError::InvalidSpec(invalid.to_string()),
            other => LifecycleError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => LifecycleError::RecordNotFound(id),
            other => LifecycleError::Internal(other.to_string()),
        }
    }
}

/// Inclusive range of ports handed to services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 20000,
            end: 20999,
        }
    }
}

impl PortRange {
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleSettings {
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Query and probe timeouts together must stay below the reconcile
    /// interval
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
    /// Longest a placed service may take to become healthy
    #[serde(default = "default_starting_timeout")]
    pub starting_timeout_secs: u64,
    /// Consecutive failed queries before a record is failed
    #[serde(default = "default_max_reconcile_failures")]
    pub max_reconcile_failures: u32,
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_secs: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_reconcile_concurrency")]
    pub reconcile_concurrency: usize,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
    #[serde(default)]
    pub port_range: PortRange,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            probe_timeout_secs: default_probe_timeout(),
            query_timeout_secs: default_query_timeout(),
            starting_timeout_secs: default_starting_timeout(),
            max_reconcile_failures: default_max_reconcile_failures(),
            submit_timeout_secs: default_submit_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            reconcile_concurrency: default_reconcile_concurrency(),
            max_replicas: default_max_replicas(),
            port_range: PortRange::default(),
        }
    }
}

fn default_reconcile_interval() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_query_timeout() -> u64 {
    5
}

fn default_starting_timeout() -> u64 {
    1800
}

fn default_max_reconcile_failures() -> u32 {
    5
}

fn default_submit_timeout() -> u64 {
    60
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_reconcile_concurrency() -> usize {
    8
}

fn default_max_replicas() -> u32 {
    16
}

impl LifecycleSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn starting_timeout(&self) -> Duration {
        Duration::from_secs(self.starting_timeout_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}
