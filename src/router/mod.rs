//! ReplicaRouter - picks a running replica and forwards to it
//!
//! Selection is round-robin over the running members of a group, driven by
//! the group's shared atomic cursor. A request key pins a caller to a
//! stable starting member instead. Failures before a response arrives fail
//! over to the next running member, a bounded number of times.

pub mod upstream;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::service::{ReplicaGroup, ServiceRecord, ServiceStatus};
use crate::store::RecordStore;
use crate::tunnel::{EndpointResolver, TunnelError};

pub use upstream::{
    strip_hop_by_hop, HttpUpstream, Upstream, UpstreamError, UpstreamRequest, UpstreamResponse,
};

#[cfg(any(test, feature = "testkit"))]
pub use upstream::MockUpstream;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Record '{0}' not found")]
    NotFound(String),

    #[error("Group '{0}' has no running member")]
    GroupUnavailable(String),

    #[error("Service '{id}' is {status}, not running")]
    ServiceUnavailable { id: String, status: ServiceStatus },

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Not retried: the request may already have been processed
    #[error("Upstream response interrupted: {0}")]
    Interrupted(String),

    #[error("Upstream timed out: {0}")]
    Timeout(String),
}

impl RouterError {
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::NotFound(_) => "RECORD_NOT_FOUND",
            RouterError::GroupUnavailable(_) | RouterError::ServiceUnavailable { .. } => {
                "GROUP_UNAVAILABLE"
            }
            RouterError::Tunnel(_) => "TUNNEL_DOWN",
            RouterError::Upstream(_) | RouterError::Interrupted(_) => "UPSTREAM_ERROR",
            RouterError::Timeout(_) => "TIMEOUT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Extra members tried after a transport failure
    #[serde(default = "default_max_failover")]
    pub max_failover: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_failover: default_max_failover(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_max_failover() -> usize {
    1
}

fn default_request_timeout() -> u64 {
    300
}

/// Member chosen for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteTarget {
    pub service_id: String,
    /// Cluster-internal `host:port`
    pub endpoint: String,
    pub port: u16,
}

impl RouteTarget {
    fn from_record(record: &ServiceRecord) -> Option<Self> {
        Some(Self {
            service_id: record.id.clone(),
            endpoint: record.endpoint.clone()?,
            port: record.port,
        })
    }
}

/// Response plus which member served it
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub served_by: String,
    pub port: u16,
    pub response: UpstreamResponse,
}

// ============================================================================
// SBIO: Pure selection
// ============================================================================

/// Stable index for a request key
pub fn key_index(key: &str) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) as usize
}

/// Running members rotated so that `start` comes first
pub fn rotate_running(members: &[ServiceRecord], start: usize) -> Vec<RouteTarget> {
    let running: Vec<RouteTarget> = members
        .iter()
        .filter(|m| m.is_running())
        .filter_map(RouteTarget::from_record)
        .collect();
    if running.is_empty() {
        return running;
    }
    let offset = start % running.len();
    running[offset..]
        .iter()
        .chain(running[..offset].iter())
        .cloned()
        .collect()
}

pub struct ReplicaRouter {
    store: Arc<RecordStore>,
    upstream: Arc<dyn Upstream>,
    endpoints: EndpointResolver,
    settings: RouterSettings,
}

impl ReplicaRouter {
    pub fn new(
        store: Arc<RecordStore>,
        upstream: Arc<dyn Upstream>,
        endpoints: EndpointResolver,
        settings: RouterSettings,
    ) -> Self {
        Self {
            store,
            upstream,
            endpoints,
            settings,
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    fn group(&self, group_id: &str) -> Result<ReplicaGroup, RouterError> {
        self.store
            .get_group(group_id)
            .ok_or_else(|| RouterError::NotFound(group_id.to_string()))
    }

    /// Candidates in try order. Advances the group cursor once unless a
    /// key is given.
    fn candidates(
        &self,
        group: &ReplicaGroup,
        request_key: Option<&str>,
    ) -> Result<Vec<RouteTarget>, RouterError> {
        let members = self.store.members(group);
        if !members.iter().any(|m| m.is_running()) {
            return Err(RouterError::GroupUnavailable(group.group_id.clone()));
        }

        let start = match request_key {
            Some(key) => key_index(key),
            None => group.advance_cursor(),
        };
        let candidates = rotate_running(&members, start);
        if candidates.is_empty() {
            return Err(RouterError::GroupUnavailable(group.group_id.clone()));
        }
        Ok(candidates)
    }

    /// Pick the member for the next request to a group
    pub fn route(
        &self,
        group_id: &str,
        request_key: Option<&str>,
    ) -> Result<RouteTarget, RouterError> {
        let group = self.group(group_id)?;
        self.candidates(&group, request_key)?
            .into_iter()
            .next()
            .ok_or_else(|| RouterError::GroupUnavailable(group_id.to_string()))
    }

    /// Forward to a group with bounded failover on transport errors
    pub async fn forward(
        &self,
        group_id: &str,
        request: UpstreamRequest,
        request_key: Option<&str>,
    ) -> Result<ForwardedResponse, RouterError> {
        let group = self.group(group_id)?;
        let candidates = self.candidates(&group, request_key)?;
        let attempts = (1 + self.settings.max_failover).min(candidates.len());

        let mut last_error = None;
        for (attempt, target) in candidates.into_iter().take(attempts).enumerate() {
            match self.send_to(&target, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(RouterError::Upstream(e)) => {
                    warn!(
                        group_id = %group_id,
                        service_id = %target.service_id,
                        "Attempt {}/{} failed: {}",
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
                Err(other) => return Err(other),
            }
        }

        Err(RouterError::Upstream(last_error.unwrap_or_else(|| {
            format!("no member of '{}' answered", group_id)
        })))
    }

    /// Forward to a single service, no retry
    pub async fn forward_service(
        &self,
        service_id: &str,
        request: UpstreamRequest,
    ) -> Result<ForwardedResponse, RouterError> {
        let record = self
            .store
            .get(service_id)
            .ok_or_else(|| RouterError::NotFound(service_id.to_string()))?;
        let target = match RouteTarget::from_record(&record) {
            Some(target) if record.is_running() => target,
            _ => {
                return Err(RouterError::ServiceUnavailable {
                    id: record.id,
                    status: record.status,
                })
            }
        };
        self.send_to(&target, request).await
    }

    /// Route by id: groups take precedence over single services
    pub async fn dispatch(
        &self,
        id: &str,
        request: UpstreamRequest,
        request_key: Option<&str>,
    ) -> Result<ForwardedResponse, RouterError> {
        if self.store.get_group(id).is_some() {
            self.forward(id, request, request_key).await
        } else {
            self.forward_service(id, request).await
        }
    }

    async fn send_to(
        &self,
        target: &RouteTarget,
        request: UpstreamRequest,
    ) -> Result<ForwardedResponse, RouterError> {
        let address = self.endpoints.resolve(&target.endpoint).await?;
        debug!(
            service_id = %target.service_id,
            "Forwarding {} {} to {}",
            request.method,
            request.path,
            address
        );

        match self.upstream.send(&address, request).await {
            Ok(response) => Ok(ForwardedResponse {
                served_by: target.service_id.clone(),
                port: target.port,
                response,
            }),
            Err(UpstreamError::Transport(e)) => Err(RouterError::Upstream(e)),
            Err(UpstreamError::Interrupted(e)) => Err(RouterError::Interrupted(format!(
                "{}: {}",
                target.service_id, e
            ))),
            Err(UpstreamError::Timeout(d)) => Err(RouterError::Timeout(format!(
                "{} did not answer within {}s",
                target.service_id,
                d.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{ResolvedSpec, Resources};
    use crate::service::ServiceKind;
    use axum::body::Bytes;
    use axum::http::Method;
    use std::collections::HashMap;

    fn member(id: &str, node: &str, running: bool) -> ServiceRecord {
        let spec = ResolvedSpec {
            kind: ServiceKind::Inference,
            command: "vllm serve".to_string(),
            environment: Default::default(),
            resources: Resources::default(),
        };
        let mut record = ServiceRecord::new(id, id, "vllm", spec, 20000).with_group("g");
        record.node = Some(node.to_string());
        if running {
            record.transition_to(ServiceStatus::Running, None).unwrap();
        }
        record
    }

    fn setup(running: [bool; 3]) -> (Arc<RecordStore>, Arc<MockUpstream>, ReplicaRouter) {
        let store = Arc::new(RecordStore::in_memory());
        let members: Vec<ServiceRecord> = ["g", "b", "c"]
            .iter()
            .zip(["n1", "n2", "n3"])
            .zip(running)
            .map(|((id, node), up)| member(id, node, up))
            .collect();
        let group = ReplicaGroup::new("vllm", members.iter().map(|m| m.id.clone()).collect())
            .unwrap();
        store.insert_group(group, members).unwrap();

        let upstream = Arc::new(MockUpstream::new());
        let router = ReplicaRouter::new(
            store.clone(),
            upstream.clone(),
            EndpointResolver::Direct,
            RouterSettings::default(),
        );
        (store, upstream, router)
    }

    fn request() -> UpstreamRequest {
        UpstreamRequest::new(Method::POST, "/v1/completions", Bytes::from("{}"))
    }

    #[test]
    fn test_rotate_running_skips_stopped() {
        let members = vec![
            member("a", "n1", true),
            member("b", "n2", false),
            member("c", "n3", true),
        ];
        let order: Vec<String> = rotate_running(&members, 1)
            .into_iter()
            .map(|t| t.service_id)
            .collect();
        assert_eq!(order, vec!["c", "a"]);
        assert!(rotate_running(&[member("x", "n", false)], 0).is_empty());
    }

    #[test]
    fn test_round_robin_is_even() {
        let (_, _, router) = setup([true, true, true]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..300 {
            let target = router.route("g", None).unwrap();
            *counts.entry(target.service_id).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 100));
    }

    #[test]
    fn test_request_key_is_sticky() {
        let (_, _, router) = setup([true, true, true]);
        let first = router.route("g", Some("session-42")).unwrap();
        for _ in 0..10 {
            assert_eq!(router.route("g", Some("session-42")).unwrap(), first);
        }
    }

    #[test]
    fn test_no_running_member() {
        let (_, _, router) = setup([false, false, false]);
        assert!(matches!(
            router.route("g", None),
            Err(RouterError::GroupUnavailable(_))
        ));
        assert!(matches!(
            router.route("missing", None),
            Err(RouterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_fails_over_on_transport_error() {
        let (_, upstream, router) = setup([true, true, true]);
        upstream.fail("n1:20000");

        for _ in 0..6 {
            let forwarded = router.forward("g", request(), None).await.unwrap();
            assert_ne!(forwarded.served_by, "g");
            assert_eq!(forwarded.port, 20000);
        }
    }

    #[tokio::test]
    async fn test_failover_is_bounded() {
        let (_, upstream, router) = setup([true, true, true]);
        let router = ReplicaRouter {
            settings: RouterSettings {
                max_failover: 1,
                ..RouterSettings::default()
            },
            ..router
        };
        for node in ["n1", "n2", "n3"] {
            upstream.fail(&format!("{}:20000", node));
        }

        let err = router.forward("g", request(), None).await.unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_ERROR");
        assert_eq!(upstream.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let (_, upstream, router) = setup([true, true, true]);
        for node in ["n1", "n2", "n3"] {
            upstream.fail_with(
                &format!("{}:20000", node),
                UpstreamError::Timeout(std::time::Duration::from_secs(1)),
            );
        }
        let err = router.forward("g", request(), None).await.unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(upstream.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_response_is_not_retried() {
        let (_, upstream, router) = setup([true, true, true]);
        for node in ["n1", "n2", "n3"] {
            upstream.fail_with(
                &format!("{}:20000", node),
                UpstreamError::Interrupted("connection reset mid-body".to_string()),
            );
        }
        let err = router.forward("g", request(), None).await.unwrap_err();
        assert!(matches!(err, RouterError::Interrupted(_)));
        assert_eq!(err.code(), "UPSTREAM_ERROR");
        assert_eq!(upstream.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_single_service_requires_running() {
        let (store, _, router) = setup([true, true, true]);
        let spec = ResolvedSpec {
            kind: ServiceKind::VectorDb,
            command: "qdrant".to_string(),
            environment: Default::default(),
            resources: Resources::default(),
        };
        store
            .insert_record(ServiceRecord::new("solo", "qdrant-0", "qdrant", spec, 20010))
            .unwrap();

        let err = router.dispatch("solo", request(), None).await.unwrap_err();
        assert_eq!(err.code(), "GROUP_UNAVAILABLE");

        store
            .update("solo", |r| {
                r.node = Some("n9".to_string());
                Ok(r.transition_to(ServiceStatus::Running, None)?)
            })
            .unwrap();
        let forwarded = router.dispatch("solo", request(), None).await.unwrap();
        assert_eq!(forwarded.served_by, "solo");
        assert_eq!(forwarded.port, 20010);
    }
}
