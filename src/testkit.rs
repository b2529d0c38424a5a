//! In-process stack for tests: in-memory scheduler, static prober and a
//! mock upstream behind a real orchestrator.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::lifecycle::{LifecycleManager, ProbeOutcome, StaticProber};
use crate::orchestrator::Orchestrator;
use crate::recipe::{Recipe, RecipeCatalog, RecipeResolver, Resources};
use crate::router::{MockUpstream, ReplicaRouter};
use crate::scheduler::memory::InMemoryScheduler;
use crate::scheduler::JobState;
use crate::service::{ServiceKind, ServiceRecord};
use crate::store::RecordStore;
use crate::tunnel::EndpointResolver;

pub fn inference_recipe() -> Recipe {
    Recipe {
        name: "vllm".to_string(),
        kind: ServiceKind::Inference,
        description: Some("vLLM OpenAI-compatible server".to_string()),
        command: "vllm serve $MODEL --port $SERVICE_PORT".to_string(),
        environment: [("MODEL".to_string(), "facebook/opt-125m".to_string())]
            .into_iter()
            .collect(),
        resources: Resources::default(),
    }
}

pub fn vector_db_recipe() -> Recipe {
    Recipe {
        name: "qdrant".to_string(),
        kind: ServiceKind::VectorDb,
        description: None,
        command: "qdrant --uri 0.0.0.0:$SERVICE_PORT".to_string(),
        environment: Default::default(),
        resources: Resources::default(),
    }
}

pub struct TestStack {
    pub scheduler: Arc<InMemoryScheduler>,
    pub prober: Arc<StaticProber>,
    pub upstream: Arc<MockUpstream>,
    pub store: Arc<RecordStore>,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestStack {
    pub fn new() -> Self {
        Self::with_store(Arc::new(RecordStore::in_memory()))
    }

    pub fn with_store(store: Arc<RecordStore>) -> Self {
        Self::build(store, Arc::new(InMemoryScheduler::new()), Config::default())
    }

    pub fn build(
        store: Arc<RecordStore>,
        scheduler: Arc<InMemoryScheduler>,
        config: Config,
    ) -> Self {
        let prober = Arc::new(StaticProber::new());
        let upstream = Arc::new(MockUpstream::new());
        let resolver: Arc<dyn RecipeResolver> = Arc::new(RecipeCatalog::from_recipes([
            inference_recipe(),
            vector_db_recipe(),
        ]));

        let lifecycle = Arc::new(
            LifecycleManager::new(
                store.clone(),
                scheduler.clone(),
                resolver.clone(),
                config.lifecycle.clone(),
            )
            .with_prober(prober.clone()),
        );
        let router = Arc::new(ReplicaRouter::new(
            store.clone(),
            upstream.clone(),
            EndpointResolver::Direct,
            config.router.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::assemble(
            config,
            store.clone(),
            resolver,
            lifecycle,
            router,
            None,
        ));

        Self {
            scheduler,
            prober,
            upstream,
            store,
            orchestrator,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.orchestrator.lifecycle
    }

    /// Address a service answers on once placed on `node`
    pub fn address(record: &ServiceRecord, node: &str) -> String {
        format!("{}:{}", node, record.port)
    }

    /// Place the job on `node` and make its health endpoint answer
    pub fn bring_up(&self, id: &str, node: &str) {
        if let Some(record) = self.store.get(id) {
            self.scheduler.set_state(
                id,
                JobState::Running {
                    node: node.to_string(),
                },
            );
            self.prober
                .set(&Self::address(&record, node), ProbeOutcome::Healthy);
        }
    }

    /// Reconcile until nothing transitions (bounded)
    pub async fn settle(&self) {
        for _ in 0..8 {
            if self.lifecycle().reconcile().await.transitioned == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl Default for TestStack {
    fn default() -> Self {
        Self::new()
    }
}
