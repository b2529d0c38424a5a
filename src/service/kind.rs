//! Workload kinds and their capabilities
//!
//! Each recipe declares what kind of workload it deploys. The kind decides
//! how the workload is probed for readiness and how its endpoint is
//! presented to callers.

use serde::{Deserialize, Serialize};

/// Workload flavour of a deployed service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// OpenAI-compatible inference server (vLLM and friends)
    #[default]
    Inference,
    /// Vector database (Qdrant-style REST API)
    VectorDb,
    /// Anything else that exposes an HTTP port
    Generic,
}

/// Capabilities that differ per workload kind
pub trait Workload: Send + Sync {
    /// Path answered with 2xx once the application is ready for traffic
    fn health_path(&self) -> &'static str;

    /// Public description of an endpoint (base URL clients should use)
    fn describe_endpoint(&self, endpoint: &str) -> String;

    /// Data-plane route family this workload is reachable through
    fn data_plane(&self) -> &'static str;
}

struct InferenceWorkload;

impl Workload for InferenceWorkload {
    fn health_path(&self) -> &'static str {
        "/health"
    }

    fn describe_endpoint(&self, endpoint: &str) -> String {
        format!("http://{}/v1", endpoint)
    }

    fn data_plane(&self) -> &'static str {
        "vllm"
    }
}

struct VectorDbWorkload;

impl Workload for VectorDbWorkload {
    fn health_path(&self) -> &'static str {
        "/readyz"
    }

    fn describe_endpoint(&self, endpoint: &str) -> String {
        format!("http://{}", endpoint)
    }

    fn data_plane(&self) -> &'static str {
        "vector-db"
    }
}

struct GenericWorkload;

impl Workload for GenericWorkload {
    fn health_path(&self) -> &'static str {
        "/"
    }

    fn describe_endpoint(&self, endpoint: &str) -> String {
        format!("http://{}", endpoint)
    }

    fn data_plane(&self) -> &'static str {
        "generic"
    }
}

impl ServiceKind {
    /// Capability object for this kind
    pub fn workload(&self) -> &'static dyn Workload {
        match self {
            ServiceKind::Inference => &InferenceWorkload,
            ServiceKind::VectorDb => &VectorDbWorkload,
            ServiceKind::Generic => &GenericWorkload,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Inference => "inference",
            ServiceKind::VectorDb => "vector_db",
            ServiceKind::Generic => "generic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_paths_differ_per_kind() {
        assert_eq!(ServiceKind::Inference.workload().health_path(), "/health");
        assert_eq!(ServiceKind::VectorDb.workload().health_path(), "/readyz");
    }

    #[test]
    fn test_describe_endpoint() {
        let desc = ServiceKind::Inference
            .workload()
            .describe_endpoint("gpu01:8000");
        assert_eq!(desc, "http://gpu01:8000/v1");
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ServiceKind::VectorDb).unwrap();
        assert_eq!(json, "\"vector_db\"");
        let kind: ServiceKind = serde_json::from_str("\"generic\"").unwrap();
        assert_eq!(kind, ServiceKind::Generic);
    }
}
