//! ServiceRecord - one scheduled unit and its lifecycle state

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::kind::ServiceKind;
use crate::recipe::ResolvedSpec;

/// Lifecycle status of a service
///
/// `pending -> configuring -> starting -> running -> {completed | failed | cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Accepted by the scheduler, waiting for resources
    Pending,
    /// Resources allocated, workload being prepared
    Configuring,
    /// Process listening, application not yet healthy
    Starting,
    /// Health probe succeeded
    Running,
    /// Scheduler reported a clean exit
    Completed,
    /// Non-zero exit, startup timeout or lost job
    Failed,
    /// Explicit stop honored
    Cancelled,
}

impl ServiceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Completed | ServiceStatus::Failed | ServiceStatus::Cancelled
        )
    }

    /// Position along the forward path; all terminal states share the last stage
    fn stage(&self) -> u8 {
        match self {
            ServiceStatus::Pending => 0,
            ServiceStatus::Configuring => 1,
            ServiceStatus::Starting => 2,
            ServiceStatus::Running => 3,
            ServiceStatus::Completed | ServiceStatus::Failed | ServiceStatus::Cancelled => 4,
        }
    }

    /// Whether `next` is a legal move from this status.
    ///
    /// Forward moves may skip stages. Any non-terminal status may jump to a
    /// terminal one. Terminal statuses never change.
    pub fn can_transition_to(&self, next: ServiceStatus) -> bool {
        if self.is_terminal() || *self == next {
            return false;
        }
        next.is_terminal() || next.stage() > self.stage()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Pending => "pending",
            ServiceStatus::Configuring => "configuring",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Completed => "completed",
            ServiceStatus::Failed => "failed",
            ServiceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a service ended up `failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum FailureReason {
    /// Scheduler reported a non-zero exit code
    ExitCode(i32),
    /// Placed but not healthy within the configured bound
    StartupTimeout,
    /// Too many consecutive reconciliation failures
    SchedulerUnreachable,
    /// Scheduler no longer knows the job
    JobLost,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitCode(code) => write!(f, "exited with code {}", code),
            FailureReason::StartupTimeout => f.write_str("startup timed out"),
            FailureReason::SchedulerUnreachable => f.write_str("scheduler unreachable"),
            FailureReason::JobLost => f.write_str("job lost by scheduler"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid transition for '{id}': {from} -> {to}")]
pub struct InvalidTransition {
    pub id: String,
    pub from: ServiceStatus,
    pub to: ServiceStatus,
}

/// One scheduled unit, keyed by its scheduler job id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Scheduler job id, also the public service id
    pub id: String,
    /// Job name handed to the scheduler
    pub name: String,
    pub recipe_name: String,
    pub resolved_config: ResolvedSpec,
    pub kind: ServiceKind,
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    /// Service port allocated at submission
    pub port: u16,
    /// Compute node reported by the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// host:port, only set once running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub status_changed_at: DateTime<Utc>,
    /// First time the scheduler reported the job on a node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl ServiceRecord {
    /// Create a freshly submitted record in `pending`
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        recipe_name: impl Into<String>,
        resolved_config: ResolvedSpec,
        port: u16,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            recipe_name: recipe_name.into(),
            kind: resolved_config.kind,
            resolved_config,
            status: ServiceStatus::Pending,
            failure_reason: None,
            port,
            node: None,
            endpoint: None,
            created_at: now,
            last_reconciled_at: None,
            status_changed_at: now,
            placed_at: None,
            group_id: None,
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_running(&self) -> bool {
        self.status == ServiceStatus::Running && self.endpoint.is_some()
    }

    /// Address the service will answer on once the node is known
    pub fn candidate_address(&self) -> Option<String> {
        self.node
            .as_ref()
            .map(|node| format!("{}:{}", node, self.port))
    }

    /// Time since placement while the service is still coming up
    /// (`configuring` or `starting`); `None` in any other status
    pub fn time_since_placed(&self) -> Option<chrono::Duration> {
        match self.status {
            ServiceStatus::Configuring | ServiceStatus::Starting => {
                let since = self.placed_at.unwrap_or(self.status_changed_at);
                Some(Utc::now() - since)
            }
            _ => None,
        }
    }

    /// Apply a status change.
    ///
    /// Returns `Ok(false)` when `next` equals the current status.
    pub fn transition_to(
        &mut self,
        next: ServiceStatus,
        reason: Option<FailureReason>,
    ) -> Result<bool, InvalidTransition> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        self.status_changed_at = Utc::now();
        if self.placed_at.is_none()
            && matches!(
                next,
                ServiceStatus::Configuring | ServiceStatus::Starting | ServiceStatus::Running
            )
        {
            self.placed_at = Some(self.status_changed_at);
        }

        match next {
            ServiceStatus::Running => self.endpoint = self.candidate_address(),
            ServiceStatus::Failed => self.failure_reason = reason,
            _ => {}
        }
        if next.is_terminal() {
            self.endpoint = None;
        }

        Ok(true)
    }

    /// Public base URL for running services
    pub fn describe_endpoint(&self) -> Option<String> {
        self.endpoint
            .as_deref()
            .map(|e| self.kind.workload().describe_endpoint(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{ResolvedSpec, Resources};

    fn record() -> ServiceRecord {
        let spec = ResolvedSpec {
            kind: ServiceKind::Inference,
            command: "vllm serve".to_string(),
            environment: Default::default(),
            resources: Resources::default(),
        };
        ServiceRecord::new("1001", "vllm-0", "vllm", spec, 20000)
    }

    #[test]
    fn test_forward_transitions_allowed() {
        use ServiceStatus::*;
        assert!(Pending.can_transition_to(Configuring));
        assert!(Configuring.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        use ServiceStatus::*;
        assert!(!Running.can_transition_to(Pending));
        assert!(!Starting.can_transition_to(Configuring));
        assert!(!Running.can_transition_to(Starting));
    }

    #[test]
    fn test_any_non_terminal_can_terminate() {
        use ServiceStatus::*;
        for from in [Pending, Configuring, Starting, Running] {
            for to in [Completed, Failed, Cancelled] {
                assert!(from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_terminal_is_final() {
        use ServiceStatus::*;
        for from in [Completed, Failed, Cancelled] {
            for to in [Pending, Configuring, Starting, Running, Completed, Failed, Cancelled] {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_endpoint_set_on_running() {
        let mut rec = record();
        rec.node = Some("gpu07".to_string());
        rec.transition_to(ServiceStatus::Starting, None).unwrap();
        assert!(rec.endpoint.is_none());

        rec.transition_to(ServiceStatus::Running, None).unwrap();
        assert_eq!(rec.endpoint.as_deref(), Some("gpu07:20000"));
        assert_eq!(
            rec.describe_endpoint().as_deref(),
            Some("http://gpu07:20000/v1")
        );
    }

    #[test]
    fn test_placement_clock_spans_configuring_and_starting() {
        let mut rec = record();
        assert!(rec.time_since_placed().is_none());

        rec.transition_to(ServiceStatus::Configuring, None).unwrap();
        let placed = rec.placed_at.unwrap();
        rec.transition_to(ServiceStatus::Starting, None).unwrap();
        assert_eq!(rec.placed_at, Some(placed));
        assert!(rec.status_changed_at >= placed);
        assert!(rec.time_since_placed().is_some());

        rec.transition_to(ServiceStatus::Running, None).unwrap();
        assert!(rec.time_since_placed().is_none());
    }

    #[test]
    fn test_failure_reason_recorded() {
        let mut rec = record();
        rec.transition_to(ServiceStatus::Failed, Some(FailureReason::ExitCode(137)))
            .unwrap();
        assert_eq!(rec.failure_reason, Some(FailureReason::ExitCode(137)));
        assert!(rec.is_terminal());
    }

    #[test]
    fn test_same_status_is_noop() {
        let mut rec = record();
        assert_eq!(rec.transition_to(ServiceStatus::Pending, None), Ok(false));
    }

    #[test]
    fn test_invalid_transition_error() {
        let mut rec = record();
        rec.transition_to(ServiceStatus::Cancelled, None).unwrap();
        let err = rec
            .transition_to(ServiceStatus::Running, None)
            .unwrap_err();
        assert_eq!(err.from, ServiceStatus::Cancelled);
        assert_eq!(err.to, ServiceStatus::Running);
    }
}
