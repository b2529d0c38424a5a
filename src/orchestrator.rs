//! Orchestrator - explicit context wiring every component together
//!
//! Built once in `main` (or a test) and shared with the gateway state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{Config, ConfigError};
use crate::lifecycle::{spawn_reconciler, LifecycleManager, ReconcilerHandle};
use crate::recipe::{RecipeCatalog, RecipeError, RecipeResolver};
use crate::router::{HttpUpstream, ReplicaRouter};
use crate::scheduler::{CommandRunner, LocalRunner, SchedulerClient, SlurmScheduler, TunnelRunner};
use crate::store::{RecordStore, StoreError};
use crate::tunnel::{EndpointResolver, SshConnector, TunnelBridge, TunnelError, TunnelSession};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("State store: {0}")]
    Store(#[from] StoreError),

    #[error("Recipes: {0}")]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub services: BTreeMap<String, usize>,
    pub groups: usize,
    pub recipes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<&'static str>,
    pub submissions_halted: bool,
    pub reconciler_running: bool,
}

pub struct Orchestrator {
    pub config: Config,
    pub store: Arc<RecordStore>,
    pub resolver: Arc<dyn RecipeResolver>,
    pub lifecycle: Arc<LifecycleManager>,
    pub router: Arc<ReplicaRouter>,
    tunnel: Option<(Arc<TunnelBridge>, TunnelSession)>,
    reconciler: Mutex<Option<ReconcilerHandle>>,
    started_at: DateTime<Utc>,
}

impl Orchestrator {
    /// Wire up already-built components
    pub fn assemble(
        config: Config,
        store: Arc<RecordStore>,
        resolver: Arc<dyn RecipeResolver>,
        lifecycle: Arc<LifecycleManager>,
        router: Arc<ReplicaRouter>,
        tunnel: Option<(Arc<TunnelBridge>, TunnelSession)>,
    ) -> Self {
        Self {
            config,
            store,
            resolver,
            lifecycle,
            router,
            tunnel,
            reconciler: Mutex::new(None),
            started_at: Utc::now(),
        }
    }

    /// Build the production stack: persistent store, YAML recipes, Slurm
    /// over the SSH tunnel (when configured) and HTTP upstreams.
    pub async fn from_config(config: Config) -> Result<Self, OrchestratorError> {
        let store = Arc::new(RecordStore::open(config.state_dir_path())?);
        let catalog = RecipeCatalog::load_dir(&config.recipes_dir_path())?;
        info!("Loaded {} recipe(s)", catalog.len());
        let resolver: Arc<dyn RecipeResolver> = Arc::new(catalog);

        let tunnel = match &config.tunnel {
            Some(tunnel_config) => {
                let connector = SshConnector::new(tunnel_config.control_dir_path())
                    .with_connect_timeout(tunnel_config.connect_timeout_secs);
                let bridge = Arc::new(TunnelBridge::new(
                    Arc::new(connector),
                    tunnel_config.bridge.clone(),
                ));
                let session = bridge.establish(tunnel_config.credentials.clone()).await?;
                Some((bridge, session))
            }
            None => None,
        };

        let endpoints = match &tunnel {
            Some((bridge, session)) => EndpointResolver::Tunnel {
                bridge: bridge.clone(),
                session: session.clone(),
            },
            None => EndpointResolver::Direct,
        };

        let runner: Arc<dyn CommandRunner> = match &tunnel {
            Some((bridge, session)) if config.scheduler.remote => {
                Arc::new(TunnelRunner::new(bridge.clone(), session.clone()))
            }
            _ => Arc::new(LocalRunner),
        };
        let scheduler: Arc<dyn SchedulerClient> =
            Arc::new(SlurmScheduler::new(runner, config.scheduler.clone()));

        let lifecycle = Arc::new(
            LifecycleManager::new(
                store.clone(),
                scheduler,
                resolver.clone(),
                config.lifecycle.clone(),
            )
            .with_endpoints(endpoints.clone()),
        );

        let upstream = Arc::new(HttpUpstream::new(Duration::from_secs(
            config.router.request_timeout_secs,
        )));
        let router = Arc::new(ReplicaRouter::new(
            store.clone(),
            upstream,
            endpoints,
            config.router.clone(),
        ));

        Ok(Self::assemble(
            config, store, resolver, lifecycle, router, tunnel,
        ))
    }

    /// Start background reconciliation (no-op if already running)
    pub async fn start(&self) {
        let mut reconciler = self.reconciler.lock().await;
        if reconciler.is_none() {
            let pending = self.store.non_terminal_ids().len();
            if pending > 0 {
                info!("Resuming reconciliation of {} record(s)", pending);
            }
            *reconciler = Some(spawn_reconciler(self.lifecycle.clone()));
        }
    }

    /// Stop the reconciler and close the tunnel
    pub async fn shutdown(&self) {
        if let Some(handle) = self.reconciler.lock().await.take() {
            handle.shutdown().await;
        }
        if let Some((bridge, _)) = &self.tunnel {
            bridge.shutdown().await;
        }
        info!("Orchestrator stopped");
    }

    pub fn tunnel_session(&self) -> Option<&TunnelSession> {
        self.tunnel.as_ref().map(|(_, session)| session)
    }

    pub async fn status(&self) -> StatusReport {
        let mut services: BTreeMap<String, usize> = BTreeMap::new();
        for record in self.store.list() {
            *services.entry(record.status.to_string()).or_default() += 1;
        }

        let reconciler_running = self
            .reconciler
            .lock()
            .await
            .as_ref()
            .map(|h| h.is_running())
            .unwrap_or(false);

        StatusReport {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            started_at: self.started_at,
            services,
            groups: self.store.list_groups().len(),
            recipes: self.resolver.names(),
            tunnel: self.tunnel_session().map(|s| s.state().as_str()),
            submissions_halted: self.lifecycle.submissions_halted(),
            reconciler_running,
        }
    }
}
