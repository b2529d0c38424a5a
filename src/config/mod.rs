//! Gateway configuration file
//!
//! ```yaml
//! gateway:
//!   bind_addr: 0.0.0.0
//!   port: 8080
//! state_dir: ~/.hpcserve/state
//! recipes_dir: ~/.hpcserve/recipes
//! scheduler:
//!   partition: gpu
//!   account: p200xxx
//! lifecycle:
//!   reconcile_interval_secs: 10
//!   probe_timeout_secs: 3
//! tunnel:
//!   cluster: meluxina
//!   host: login.lxp.lu
//!   user: u100xxx
//!   port: 8822
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::lifecycle::LifecycleSettings;
use crate::router::RouterSettings;
use crate::scheduler::SlurmSettings;
use crate::tunnel::{BridgeSettings, TunnelCredentials};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Default config file location: ~/.hpcserve/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hpcserve")
        .join("config.yaml")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// SSH tunnel to the cluster login node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(flatten)]
    pub credentials: TunnelCredentials,
    /// Where control sockets live
    #[serde(default = "default_control_dir")]
    pub control_dir: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(flatten)]
    pub bridge: BridgeSettings,
}

fn default_control_dir() -> String {
    "~/.hpcserve/ssh".to_string()
}

fn default_connect_timeout() -> u64 {
    15
}

impl TunnelConfig {
    pub fn control_dir_path(&self) -> PathBuf {
        expand_path(&self.control_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_recipes_dir")]
    pub recipes_dir: String,
    #[serde(default)]
    pub scheduler: SlurmSettings,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
    #[serde(default)]
    pub router: RouterSettings,
    /// Absent when the gateway runs inside the cluster network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            state_dir: default_state_dir(),
            recipes_dir: default_recipes_dir(),
            scheduler: SlurmSettings::default(),
            lifecycle: LifecycleSettings::default(),
            router: RouterSettings::default(),
            tunnel: None,
        }
    }
}

fn default_state_dir() -> String {
    "~/.hpcserve/state".to_string()
}

fn default_recipes_dir() -> String {
    "~/.hpcserve/recipes".to_string()
}

impl Config {
    pub fn state_dir_path(&self) -> PathBuf {
        expand_path(&self.state_dir)
    }

    pub fn recipes_dir_path(&self) -> PathBuf {
        expand_path(&self.recipes_dir)
    }
}

/// Expand `~` and `$VARS`; unknown variables are left as written
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| shellexpand::tilde(path).into_owned());
    PathBuf::from(expanded)
}

// ============================================================================
// SBIO: Pure parsing and validation
// ============================================================================

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let lifecycle = &config.lifecycle;

    if lifecycle.reconcile_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "lifecycle.reconcile_interval_secs must be at least 1".to_string(),
        ));
    }
    if lifecycle.probe_timeout_secs >= lifecycle.reconcile_interval_secs {
        return Err(ConfigError::Invalid(format!(
            "lifecycle.probe_timeout_secs ({}) must be shorter than reconcile_interval_secs ({})",
            lifecycle.probe_timeout_secs, lifecycle.reconcile_interval_secs
        )));
    }
    // One record's work is a query then a probe; it has to fit in a tick
    if lifecycle.query_timeout_secs + lifecycle.probe_timeout_secs
        >= lifecycle.reconcile_interval_secs
    {
        return Err(ConfigError::Invalid(format!(
            "lifecycle.query_timeout_secs ({}) plus probe_timeout_secs ({}) must be shorter than reconcile_interval_secs ({})",
            lifecycle.query_timeout_secs,
            lifecycle.probe_timeout_secs,
            lifecycle.reconcile_interval_secs
        )));
    }
    if lifecycle.port_range.is_empty() {
        return Err(ConfigError::Invalid(
            "lifecycle.port_range is empty".to_string(),
        ));
    }
    if lifecycle.reconcile_concurrency == 0 {
        return Err(ConfigError::Invalid(
            "lifecycle.reconcile_concurrency must be at least 1".to_string(),
        ));
    }
    if lifecycle.max_reconcile_failures == 0 {
        return Err(ConfigError::Invalid(
            "lifecycle.max_reconcile_failures must be at least 1".to_string(),
        ));
    }
    if lifecycle.max_replicas == 0 {
        return Err(ConfigError::Invalid(
            "lifecycle.max_replicas must be at least 1".to_string(),
        ));
    }

    if let Some(tunnel) = &config.tunnel {
        if tunnel.credentials.cluster.trim().is_empty() || tunnel.credentials.host.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "tunnel.cluster and tunnel.host are required".to_string(),
            ));
        }
    }

    Ok(())
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Load an explicit config file, or the default one if it exists
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => load_config_file(path),
        None => {
            let path = default_config_path();
            if path.exists() {
                load_config_file(&path)
            } else {
                info!("No config at {}, using defaults", path.display());
                Ok(Config::default())
            }
        }
    }
}
