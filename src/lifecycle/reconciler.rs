//! Background reconciliation loop

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::LifecycleManager;

/// Stops the reconciler and waits for the current pass to finish
pub struct ReconcilerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawn the reconciler as a background task.
///
/// The first pass runs immediately, which is what re-attaches records
/// loaded from disk after a restart.
pub fn spawn_reconciler(manager: Arc<LifecycleManager>) -> ReconcilerHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let period = manager.settings().reconcile_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Reconciler started, reconciling every {}s", period.as_secs());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // A pass in progress is not interrupted midway; each
                    // record is bounded by the query and probe timeouts
                    let started = Instant::now();
                    let summary = manager.reconcile().await;
                    let took = started.elapsed();
                    if took > period {
                        warn!(
                            took_ms = took.as_millis() as u64,
                            records = summary.examined,
                            "Reconcile pass overran the {}s interval; raise reconcile_concurrency",
                            period.as_secs()
                        );
                    } else if summary.transitioned > 0 || summary.query_failures > 0 {
                        debug!(?summary, "Reconcile pass");
                    }
                }
                _ = token.cancelled() => {
                    info!("Reconciler shutting down");
                    break;
                }
            }
        }
    });

    ReconcilerHandle { cancel, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::manager::SubmitRequest;
    use crate::lifecycle::LifecycleSettings;
    use crate::recipe::{Recipe, RecipeCatalog, Resources};
    use crate::scheduler::memory::InMemoryScheduler;
    use crate::scheduler::JobState;
    use crate::service::{ServiceKind, ServiceStatus};
    use crate::store::RecordStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reconciler_runs_and_stops() {
        let scheduler = Arc::new(InMemoryScheduler::new());
        let store = Arc::new(RecordStore::in_memory());
        let catalog = Arc::new(RecipeCatalog::from_recipes([Recipe {
            name: "echo".to_string(),
            kind: ServiceKind::Generic,
            description: None,
            command: "sleep infinity".to_string(),
            environment: Default::default(),
            resources: Resources::default(),
        }]));
        let manager = Arc::new(LifecycleManager::new(
            store.clone(),
            scheduler.clone(),
            catalog,
            LifecycleSettings {
                reconcile_interval_secs: 1,
                ..LifecycleSettings::default()
            },
        ));

        let deployment = manager.submit(SubmitRequest::new("echo")).await.unwrap();
        let id = deployment.id().to_string();
        scheduler.set_state(&id, JobState::Exited { code: 0 });

        let handle = spawn_reconciler(manager);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.get(&id).unwrap().status, ServiceStatus::Completed);

        assert!(handle.is_running());
        handle.shutdown().await;
    }
}
