//! Tunnel bridge between the gateway and the cluster network
//!
//! The scheduler and compute nodes are only reachable from the cluster side.
//! One authenticated session per cluster carries every port forward and
//! remote command; a supervisor keeps it alive and restores forwards after
//! a reconnect.

// =============================================================================
// SBIO: Pure types here; IO lives in bridge.rs (supervision) and ssh.rs
// (OpenSSH control master). memory.rs is the in-process double.
// =============================================================================

pub mod backoff;
pub mod bridge;
pub mod ssh;

#[cfg(any(test, feature = "testkit"))]
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use backoff::{Backoff, ReconnectPolicy};
pub use bridge::{BridgeSettings, EndpointResolver, ForwardHandle, TunnelBridge, TunnelSession};
pub use ssh::{shell_quote, SshConnector};

#[derive(Error, Debug)]
pub enum TunnelError {
    /// Session is (re)connecting; calls fail fast until it is back
    #[error("Tunnel to '{0}' is down")]
    Down(String),

    #[error("Failed to connect tunnel: {0}")]
    ConnectFailed(String),

    #[error("Tunnel authentication failed: {0}")]
    AuthFailed(String),

    #[error("Port forward failed: {0}")]
    ForwardFailed(String),

    #[error("Remote command failed: {0}")]
    Exec(String),

    #[error("No free local port for forward")]
    NoFreePort,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Who to connect to and as whom
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCredentials {
    /// Logical cluster name; one session per cluster
    pub cluster: String,
    /// Login node
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
}

impl TunnelCredentials {
    /// `user@host` or `host`
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardDirection {
    /// Gateway-side port reaching an address on the cluster (`-L`)
    Local,
    /// Cluster-side port reaching back to the gateway host (`-R`)
    Remote,
}

/// One registered forward
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub direction: ForwardDirection,
    /// Port on the gateway host
    pub local_port: u16,
    /// `host:port` on the cluster side (for remote forwards, the bind address)
    pub remote: String,
}

impl ForwardSpec {
    pub fn local(local_port: u16, remote: impl Into<String>) -> Self {
        Self {
            direction: ForwardDirection::Local,
            local_port,
            remote: remote.into(),
        }
    }

    pub fn remote(remote: impl Into<String>, local_port: u16) -> Self {
        Self {
            direction: ForwardDirection::Remote,
            local_port,
            remote: remote.into(),
        }
    }

    /// Address a gateway-side client should dial
    pub fn local_address(&self) -> String {
        format!("127.0.0.1:{}", self.local_port)
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            ForwardDirection::Local => write!(f, "L {} -> {}", self.local_port, self.remote),
            ForwardDirection::Remote => write!(f, "R {} -> {}", self.remote, self.local_port),
        }
    }
}

/// Result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Up,
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Up => "up",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        }
    }
}

/// A live connection to one cluster
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Liveness check; an error means the connection is gone
    async fn check(&self) -> Result<(), TunnelError>;

    async fn open_forward(&self, spec: &ForwardSpec) -> Result<(), TunnelError>;

    async fn close_forward(&self, spec: &ForwardSpec) -> Result<(), TunnelError>;

    async fn exec(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<ExecOutput, TunnelError>;

    async fn close(&self) -> Result<(), TunnelError>;
}

/// Opens transports; used for the first connect and every reconnect
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &TunnelCredentials,
    ) -> Result<Arc<dyn TunnelTransport>, TunnelError>;
}
