//! Service data model: records, replica groups and workload kinds

pub mod group;
pub mod kind;
pub mod record;

pub use group::{aggregate_status, AggregateStatus, ReplicaGroup};
pub use kind::{ServiceKind, Workload};
pub use record::{FailureReason, InvalidTransition, ServiceRecord, ServiceStatus};
