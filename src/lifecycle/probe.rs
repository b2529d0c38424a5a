//! Readiness probing of service endpoints
//!
//! A probe distinguishes three observable situations: nothing accepts
//! connections yet, something listens but the health endpoint is not OK,
//! and the health endpoint answers with a success status.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// TCP connect failed or the connection was dropped before a response
    Unreachable,
    /// Port accepts connections but health is not OK yet
    Listening,
    Healthy,
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProbeOutcome::Unreachable => "unreachable",
            ProbeOutcome::Listening => "listening",
            ProbeOutcome::Healthy => "healthy",
        })
    }
}

/// Probes `address` (gateway-reachable `host:port`) at `health_path`
#[async_trait]
pub trait HealthProber: Send + Sync {
    async fn probe(&self, address: &str, health_path: &str) -> ProbeOutcome;
}

/// TCP connect followed by an HTTP GET, both inside one timeout budget
pub struct HttpProber {
    client: Client,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client, timeout }
    }
}

#[async_trait]
impl HealthProber for HttpProber {
    async fn probe(&self, address: &str, health_path: &str) -> ProbeOutcome {
        let start = Instant::now();

        match timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                trace!("Probe {} connect failed: {}", address, e);
                return ProbeOutcome::Unreachable;
            }
            Err(_) => {
                trace!("Probe {} connect timed out", address);
                return ProbeOutcome::Unreachable;
            }
        }

        let remaining = self.timeout.saturating_sub(start.elapsed());
        let url = format!("http://{}{}", address, health_path);

        match timeout(remaining, self.client.get(&url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(Ok(response)) => {
                trace!("Probe {} returned HTTP {}", url, response.status());
                ProbeOutcome::Listening
            }
            // A tunnel forward accepts locally even when nothing listens
            // remotely, then drops the connection
            Ok(Err(e)) if !e.is_timeout() => {
                trace!("Probe {} failed: {}", url, e);
                ProbeOutcome::Unreachable
            }
            Ok(Err(_)) | Err(_) => ProbeOutcome::Listening,
        }
    }
}

#[cfg(any(test, feature = "testkit"))]
pub use self::fixed::StaticProber;

#[cfg(any(test, feature = "testkit"))]
mod fixed {
    use super::*;
    use dashmap::DashMap;

    /// Prober answering from a table; unknown addresses are unreachable
    #[derive(Default)]
    pub struct StaticProber {
        outcomes: DashMap<String, ProbeOutcome>,
    }

    impl StaticProber {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, address: &str, outcome: ProbeOutcome) {
            self.outcomes.insert(address.to_string(), outcome);
        }
    }

    #[async_trait]
    impl HealthProber for StaticProber {
        async fn probe(&self, address: &str, _health_path: &str) -> ProbeOutcome {
            self.outcomes
                .get(address)
                .map(|o| *o)
                .unwrap_or(ProbeOutcome::Unreachable)
        }
    }
}
