//! ReplicaGroup - a set of services created together and routed as one

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::ServiceStatus;

/// Named collection of replica ids.
///
/// Members are stored as ids only; records are looked up through the
/// store. Membership is fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaGroup {
    /// Equal to the first member's id
    pub group_id: String,
    pub recipe_name: String,
    pub created_at: DateTime<Utc>,
    /// Insertion order is the routing tie-break
    pub members: Vec<String>,
    /// Round-robin cursor, shared by every clone of this group
    #[serde(skip)]
    routing_cursor: Arc<AtomicUsize>,
}

impl ReplicaGroup {
    /// Create a group from already-submitted member ids.
    ///
    /// Returns `None` for an empty member list.
    pub fn new(recipe_name: impl Into<String>, members: Vec<String>) -> Option<Self> {
        let group_id = members.first()?.clone();
        Some(Self {
            group_id,
            recipe_name: recipe_name.into(),
            created_at: Utc::now(),
            members,
            routing_cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Take the next cursor value; every call advances the cursor
    pub fn advance_cursor(&self) -> usize {
        self.routing_cursor.fetch_add(1, Ordering::Relaxed)
    }
}

/// Derived status of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    /// Every member running
    Running,
    /// Some but not all members running
    Partial,
    /// Nothing running yet, at least one member still progressing
    Pending,
    /// Nothing running and nothing left that could start
    Failed,
}

impl AggregateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateStatus::Running => "running",
            AggregateStatus::Partial => "partial",
            AggregateStatus::Pending => "pending",
            AggregateStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute a group's status from its members' statuses
pub fn aggregate_status<I>(statuses: I) -> AggregateStatus
where
    I: IntoIterator<Item = ServiceStatus>,
{
    let mut total = 0usize;
    let mut running = 0usize;
    let mut live = 0usize;

    for status in statuses {
        total += 1;
        if status == ServiceStatus::Running {
            running += 1;
        } else if !status.is_terminal() {
            live += 1;
        }
    }

    if total > 0 && running == total {
        AggregateStatus::Running
    } else if running > 0 {
        AggregateStatus::Partial
    } else if live > 0 {
        AggregateStatus::Pending
    } else {
        AggregateStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServiceStatus::*;

    #[test]
    fn test_group_id_is_first_member() {
        let group =
            ReplicaGroup::new("vllm", vec!["11".into(), "12".into(), "13".into()]).unwrap();
        assert_eq!(group.group_id, "11");
        assert_eq!(group.members.len(), 3);
        assert!(ReplicaGroup::new("vllm", vec![]).is_none());
    }

    #[test]
    fn test_cursor_shared_between_clones() {
        let group = ReplicaGroup::new("vllm", vec!["1".into(), "2".into()]).unwrap();
        let clone = group.clone();
        assert_eq!(group.advance_cursor(), 0);
        assert_eq!(clone.advance_cursor(), 1);
        assert_eq!(group.advance_cursor(), 2);
    }

    #[test]
    fn test_aggregate_status() {
        assert_eq!(
            aggregate_status([Running, Running, Running]),
            AggregateStatus::Running
        );
        assert_eq!(
            aggregate_status([Running, Failed, Running]),
            AggregateStatus::Partial
        );
        assert_eq!(
            aggregate_status([Pending, Starting, Failed]),
            AggregateStatus::Pending
        );
        assert_eq!(
            aggregate_status([Failed, Cancelled]),
            AggregateStatus::Failed
        );
        assert_eq!(aggregate_status([]), AggregateStatus::Failed);
    }

    #[test]
    fn test_cursor_not_serialized() {
        let group = ReplicaGroup::new("vllm", vec!["1".into()]).unwrap();
        group.advance_cursor();
        let json = serde_json::to_string(&group).unwrap();
        assert!(!json.contains("cursor"));
        let back: ReplicaGroup = serde_json::from_str(&json).unwrap();
        assert_eq!(back.advance_cursor(), 0);
    }
}
