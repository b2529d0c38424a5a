use std::sync::Arc;

use crate::lifecycle::LifecycleManager;
use crate::orchestrator::Orchestrator;
use crate::router::ReplicaRouter;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.orchestrator.lifecycle
    }

    pub fn router(&self) -> &ReplicaRouter {
        &self.orchestrator.router
    }
}
