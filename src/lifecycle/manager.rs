//! LifecycleManager - the only writer of service status

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::probe::{HealthProber, HttpProber, ProbeOutcome};
use super::{LifecycleError, LifecycleSettings};
use crate::recipe::{ConfigOverride, RecipeResolver};
use crate::scheduler::{JobSpec, JobState, SchedulerClient, SchedulerError};
use crate::service::{FailureReason, ReplicaGroup, ServiceRecord, ServiceStatus};
use crate::store::{RecordStore, StoreError};
use crate::tunnel::EndpointResolver;

/// Body of a create request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub recipe_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_override: Option<ConfigOverride>,
    /// Number of replicas; more than one creates a group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl SubmitRequest {
    pub fn new(recipe_name: impl Into<String>) -> Self {
        Self {
            recipe_name: recipe_name.into(),
            ..Self::default()
        }
    }

    pub fn replicas(mut self, replicas: u32) -> Self {
        self.replicas = Some(replicas);
        self
    }
}

/// What a submission created
#[derive(Debug, Clone)]
pub enum Deployment {
    Service(ServiceRecord),
    Group {
        group: ReplicaGroup,
        members: Vec<ServiceRecord>,
    },
}

impl Deployment {
    /// Public id: the service id, or the group id
    pub fn id(&self) -> &str {
        match self {
            Deployment::Service(record) => &record.id,
            Deployment::Group { group, .. } => &group.group_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Already being reconciled, gone, or terminal
    Skipped,
    Unchanged,
    Transitioned {
        from: ServiceStatus,
        to: ServiceStatus,
    },
    /// Scheduler query failed; retried next tick
    QueryFailed,
}

/// Totals of one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub examined: usize,
    pub transitioned: usize,
    pub query_failures: usize,
    pub skipped: usize,
}

/// Ports handed out to submissions that are not in the store yet
struct PortLease<'a> {
    reserved: &'a Mutex<HashSet<u16>>,
    ports: Vec<u16>,
}

impl Drop for PortLease<'_> {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|p| p.into_inner());
        for port in &self.ports {
            reserved.remove(port);
        }
    }
}

/// Marks a record as being reconciled
struct InFlight<'a> {
    set: &'a DashSet<String>,
    id: String,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a DashSet<String>, id: &str) -> Option<Self> {
        set.insert(id.to_string()).then(|| Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

pub struct LifecycleManager {
    store: Arc<RecordStore>,
    scheduler: Arc<dyn SchedulerClient>,
    resolver: Arc<dyn RecipeResolver>,
    prober: Arc<dyn HealthProber>,
    endpoints: EndpointResolver,
    settings: LifecycleSettings,
    reserved_ports: Mutex<HashSet<u16>>,
    in_flight: DashSet<String>,
    query_failures: DashMap<String, u32>,
    halted: AtomicBool,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<RecordStore>,
        scheduler: Arc<dyn SchedulerClient>,
        resolver: Arc<dyn RecipeResolver>,
        settings: LifecycleSettings,
    ) -> Self {
        let prober = Arc::new(HttpProber::new(settings.probe_timeout()));
        Self {
            store,
            scheduler,
            resolver,
            prober,
            endpoints: EndpointResolver::Direct,
            settings,
            reserved_ports: Mutex::new(HashSet::new()),
            in_flight: DashSet::new(),
            query_failures: DashMap::new(),
            halted: AtomicBool::new(false),
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn HealthProber>) -> Self {
        self.prober = prober;
        self
    }

    /// Probe through a tunnel instead of dialing nodes directly
    pub fn with_endpoints(mut self, endpoints: EndpointResolver) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// True after the scheduler refused our credentials
    pub fn submissions_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Accept submissions again; called once the scheduler answers again
    fn resume_submissions(&self) {
        if self.halted.swap(false, Ordering::SeqCst) {
            info!("Scheduler accepted credentials again, submissions resumed");
        }
    }

    fn halt_submissions(&self, reason: &str) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            error!(
                "Scheduler rejected credentials, halting new submissions: {}",
                reason
            );
        }
    }

    fn note_scheduler_error(&self, e: &SchedulerError) {
        if let SchedulerError::Unauthorized(msg) = e {
            self.halt_submissions(msg);
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit one job per replica.
    ///
    /// All scheduler calls share one deadline. On any failure the jobs that
    /// were already accepted are cancelled and nothing is recorded.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Deployment, LifecycleError> {
        if self.submissions_halted() {
            return Err(LifecycleError::SchedulerAuth(
                "submissions halted after a scheduler authentication failure".to_string(),
            ));
        }

        let replicas = request.replicas.unwrap_or(1);
        if replicas == 0 || replicas > self.settings.max_replicas {
            return Err(LifecycleError::InvalidSpec(format!(
                "replicas must be between 1 and {}",
                self.settings.max_replicas
            )));
        }

        let spec = self
            .resolver
            .resolve(&request.recipe_name, request.config_override.as_ref())?;
        let budget = request
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.settings.submit_timeout());
        let deadline = Instant::now() + budget;

        let lease = self.reserve_ports(replicas as usize)?;
        let batch = Uuid::new_v4().simple().to_string();

        let mut accepted: Vec<(String, String, u16)> = Vec::with_capacity(lease.ports.len());
        for (index, port) in lease.ports.iter().copied().enumerate() {
            let job = JobSpec {
                name: job_name(&request.recipe_name, &batch, index),
                spec: spec.clone(),
                port,
            };

            // Unavailable or timed out: the scheduler may hold the job anyway
            let result = match timeout_at(deadline, self.scheduler.submit(&job)).await {
                Ok(Ok(job_id)) => Ok(job_id),
                Ok(Err(e)) => {
                    self.note_scheduler_error(&e);
                    if e.is_transient() {
                        self.abandon(&job.name).await;
                    }
                    Err(LifecycleError::from(e))
                }
                Err(_) => {
                    self.abandon(&job.name).await;
                    Err(LifecycleError::Timeout(format!(
                        "submission did not finish within {}s",
                        budget.as_secs()
                    )))
                }
            };

            match result {
                Ok(job_id) => {
                    debug!(job_id = %job_id, "Submitted {} on port {}", job.name, port);
                    accepted.push((job_id, job.name, port));
                }
                Err(e) => {
                    warn!(
                        recipe = %request.recipe_name,
                        "Submission of replica {}/{} failed: {}",
                        index + 1,
                        replicas,
                        e
                    );
                    self.rollback(accepted.iter().map(|(id, _, _)| id.as_str()))
                        .await;
                    return Err(e);
                }
            }
        }

        let records: Vec<ServiceRecord> = accepted
            .iter()
            .map(|(id, name, port)| {
                ServiceRecord::new(id, name, &request.recipe_name, spec.clone(), *port)
            })
            .collect();

        let deployment = if let [record] = records.as_slice() {
            self.store
                .insert_record(record.clone())
                .map(|_| Deployment::Service(record.clone()))
        } else {
            let ids = records.iter().map(|r| r.id.clone()).collect();
            match ReplicaGroup::new(&request.recipe_name, ids) {
                Some(group) => {
                    let members: Vec<ServiceRecord> = records
                        .into_iter()
                        .map(|r| r.with_group(&group.group_id))
                        .collect();
                    self.store
                        .insert_group(group.clone(), members.clone())
                        .map(|_| Deployment::Group { group, members })
                }
                None => Err(StoreError::NotFound(request.recipe_name.clone())),
            }
        };
        drop(lease);

        match deployment {
            Ok(deployment) => {
                info!(
                    id = %deployment.id(),
                    recipe = %request.recipe_name,
                    replicas,
                    "Deployment submitted"
                );
                Ok(deployment)
            }
            Err(e) => {
                error!("Failed to record submission: {}", e);
                self.rollback(accepted.iter().map(|(id, _, _)| id.as_str()))
                    .await;
                Err(LifecycleError::Internal(e.to_string()))
            }
        }
    }

    fn reserve_ports(&self, count: usize) -> Result<PortLease<'_>, LifecycleError> {
        let mut reserved = self
            .reserved_ports
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let used = self.store.used_ports();

        let ports: Vec<u16> = self
            .settings
            .port_range
            .iter()
            .filter(|p| !used.contains(p) && !reserved.contains(p))
            .take(count)
            .collect();

        if ports.len() < count {
            return Err(LifecycleError::QuotaExceeded(format!(
                "no free service port in {}-{}",
                self.settings.port_range.start, self.settings.port_range.end
            )));
        }

        reserved.extend(ports.iter().copied());
        Ok(PortLease {
            reserved: &self.reserved_ports,
            ports,
        })
    }

    /// Best-effort cancel of jobs from a failed submission
    async fn rollback<'a>(&self, job_ids: impl Iterator<Item = &'a str>) {
        let limit = self.settings.stop_timeout();
        let cancels = job_ids.map(|id| async move {
            match timeout(limit, self.scheduler.cancel(id)).await {
                Ok(Ok(())) | Ok(Err(SchedulerError::NotFound(_))) => {
                    debug!(job_id = %id, "Rolled back job");
                }
                Ok(Err(e)) => warn!(job_id = %id, "Rollback cancel failed: {}", e),
                Err(_) => warn!(job_id = %id, "Rollback cancel timed out"),
            }
        });
        join_all(cancels).await;
    }

    /// Best-effort cancel of a job whose submission outcome is unknown
    async fn abandon(&self, job_name: &str) {
        let limit = self.settings.stop_timeout();
        match timeout(limit, self.scheduler.cancel_named(job_name)).await {
            Ok(Ok(())) => debug!(job_name = %job_name, "Cancelled unconfirmed submission"),
            Ok(Err(e)) => {
                warn!(job_name = %job_name, "Could not cancel unconfirmed submission: {}", e)
            }
            Err(_) => warn!(job_name = %job_name, "Cancel of unconfirmed submission timed out"),
        }
    }

    /// Close any tunnel forward opened for a service that has ended
    async fn release_endpoint(&self, record: &ServiceRecord) {
        if let Some(internal) = record.candidate_address() {
            self.endpoints.release(&internal).await;
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_status(&self, id: &str) -> Result<ServiceRecord, LifecycleError> {
        self.store
            .get(id)
            .ok_or_else(|| LifecycleError::RecordNotFound(id.to_string()))
    }

    pub fn get_group(
        &self,
        group_id: &str,
    ) -> Result<(ReplicaGroup, Vec<ServiceRecord>), LifecycleError> {
        let group = self
            .store
            .get_group(group_id)
            .ok_or_else(|| LifecycleError::RecordNotFound(group_id.to_string()))?;
        let members = self.store.members(&group);
        Ok((group, members))
    }

    pub fn list(&self) -> Vec<ServiceRecord> {
        self.store.list()
    }

    pub fn list_groups(&self) -> Vec<(ReplicaGroup, Vec<ServiceRecord>)> {
        self.store
            .list_groups()
            .into_iter()
            .map(|g| {
                let members = self.store.members(&g);
                (g, members)
            })
            .collect()
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Stop a service.
    ///
    /// With `preserve_record` the record is kept as `cancelled`; otherwise
    /// it is removed (legacy delete). Stopping something already terminal,
    /// or a job the scheduler no longer knows, succeeds. Legacy delete of an
    /// unknown id is a no-op.
    pub async fn stop(
        &self,
        id: &str,
        preserve_record: bool,
        stop_timeout: Option<Duration>,
    ) -> Result<Option<ServiceRecord>, LifecycleError> {
        let Some(record) = self.store.get(id) else {
            return if preserve_record {
                Err(LifecycleError::RecordNotFound(id.to_string()))
            } else {
                Ok(None)
            };
        };

        if !record.is_terminal() {
            let limit = stop_timeout.unwrap_or_else(|| self.settings.stop_timeout());
            match timeout(limit, self.scheduler.cancel(id)).await {
                Ok(Ok(())) => {}
                Ok(Err(SchedulerError::NotFound(_))) => {
                    debug!(job_id = %id, "Job already gone at stop");
                }
                Ok(Err(e)) => {
                    self.note_scheduler_error(&e);
                    return Err(e.into());
                }
                Err(_) => {
                    return Err(LifecycleError::Timeout(format!(
                        "cancel of {} did not finish within {}s",
                        id,
                        limit.as_secs()
                    )))
                }
            }

            match self.store.update(id, |r| {
                if r.is_terminal() {
                    return Ok(false);
                }
                Ok(r.transition_to(ServiceStatus::Cancelled, None)?)
            }) {
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            info!(id = %id, "Service cancelled");
        }
        self.release_endpoint(&record).await;
        self.query_failures.remove(id);

        if preserve_record {
            Ok(self.store.get(id))
        } else {
            let removed = self.store.remove(id)?;
            info!(id = %id, "Service record removed");
            Ok(removed)
        }
    }

    /// Stop every member of a group
    pub async fn stop_group(
        &self,
        group_id: &str,
        preserve_record: bool,
        stop_timeout: Option<Duration>,
    ) -> Result<Option<(ReplicaGroup, Vec<ServiceRecord>)>, LifecycleError> {
        let Some(group) = self.store.get_group(group_id) else {
            return if preserve_record {
                Err(LifecycleError::RecordNotFound(group_id.to_string()))
            } else {
                Ok(None)
            };
        };

        let stops = group
            .members
            .iter()
            .map(|id| self.stop(id, preserve_record, stop_timeout));
        let results = join_all(stops).await;

        // Every member was attempted; report the first failure
        if let Some(err) = results.into_iter().find_map(Result::err) {
            return Err(err);
        }

        let members = self.store.members(&group);
        if !preserve_record {
            self.store.remove_group(group_id)?;
            info!(group_id = %group_id, "Group removed");
        }
        Ok(Some((group, members)))
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// One pass over every non-terminal record
    pub async fn reconcile(&self) -> ReconcileSummary {
        let ids = self.store.non_terminal_ids();
        let concurrency = self.settings.reconcile_concurrency.max(1);

        let outcomes: Vec<ReconcileOutcome> = stream::iter(ids)
            .map(|id| async move { self.reconcile_record(&id).await })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut summary = ReconcileSummary::default();
        for outcome in outcomes {
            match outcome {
                ReconcileOutcome::Skipped => summary.skipped += 1,
                ReconcileOutcome::Unchanged => summary.examined += 1,
                ReconcileOutcome::Transitioned { .. } => {
                    summary.examined += 1;
                    summary.transitioned += 1;
                }
                ReconcileOutcome::QueryFailed => {
                    summary.examined += 1;
                    summary.query_failures += 1;
                }
            }
        }
        summary
    }

    /// Reconcile a single record against the scheduler
    pub async fn reconcile_record(&self, id: &str) -> ReconcileOutcome {
        let Some(_guard) = InFlight::acquire(&self.in_flight, id) else {
            return ReconcileOutcome::Skipped;
        };
        let Some(record) = self.store.get(id) else {
            return ReconcileOutcome::Skipped;
        };
        if record.is_terminal() {
            return ReconcileOutcome::Skipped;
        }

        let state = match timeout(self.settings.query_timeout(), self.scheduler.query(id)).await {
            Ok(Ok(state)) => {
                self.query_failures.remove(id);
                self.resume_submissions();
                state
            }
            Ok(Err(e)) => {
                self.note_scheduler_error(&e);
                return self.query_failed(&record, &e.to_string()).await;
            }
            Err(_) => return self.query_failed(&record, "query timed out").await,
        };

        let (node, target) = match state {
            JobState::Queued => (None, None),
            JobState::Running { node } => {
                if record.status == ServiceStatus::Running {
                    // Running services are not re-probed
                    (None, None)
                } else {
                    let target = self.observe(&record, &node).await;
                    (Some(node), target)
                }
            }
            JobState::Exited { code: 0 } => (None, Some((ServiceStatus::Completed, None))),
            JobState::Exited { code } => (
                None,
                Some((ServiceStatus::Failed, Some(FailureReason::ExitCode(code)))),
            ),
            JobState::Unknown => (
                None,
                Some((ServiceStatus::Failed, Some(FailureReason::JobLost))),
            ),
        };

        let timed_out = matches!(target, Some((_, Some(FailureReason::StartupTimeout))));
        let outcome = self.apply(id, node, target);

        if let ReconcileOutcome::Transitioned { to, .. } = outcome {
            if timed_out {
                self.cancel_best_effort(id).await;
            }
            if to.is_terminal() {
                if let Some(record) = self.store.get(id) {
                    self.release_endpoint(&record).await;
                }
            }
        }
        outcome
    }

    /// Map probe observations onto a target status
    async fn observe(
        &self,
        record: &ServiceRecord,
        node: &str,
    ) -> Option<(ServiceStatus, Option<FailureReason>)> {
        let internal = format!("{}:{}", node, record.port);
        let resolved = timeout(self.settings.probe_timeout(), self.endpoints.resolve(&internal)).await;
        let address = match resolved {
            Ok(Ok(address)) => address,
            Ok(Err(e)) => {
                debug!(id = %record.id, "Cannot reach {} yet: {}", internal, e);
                return None;
            }
            Err(_) => {
                debug!(id = %record.id, "Opening a path to {} timed out", internal);
                return None;
            }
        };

        let health_path = record.kind.workload().health_path();
        let outcome = self.prober.probe(&address, health_path).await;
        debug!(id = %record.id, "Probe {} ({}): {}", internal, address, outcome);

        let observed = match outcome {
            ProbeOutcome::Unreachable => ServiceStatus::Configuring,
            ProbeOutcome::Listening => ServiceStatus::Starting,
            ProbeOutcome::Healthy => ServiceStatus::Running,
        };

        let stuck = observed != ServiceStatus::Running
            && record
                .time_since_placed()
                .and_then(|d| d.to_std().ok())
                .map(|d| d >= self.settings.starting_timeout())
                .unwrap_or(false);
        if stuck {
            warn!(
                id = %record.id,
                "Service did not become healthy within {}s",
                self.settings.starting_timeout_secs
            );
            return Some((ServiceStatus::Failed, Some(FailureReason::StartupTimeout)));
        }

        Some((observed, None))
    }

    async fn query_failed(&self, record: &ServiceRecord, reason: &str) -> ReconcileOutcome {
        let failures = {
            let mut count = self.query_failures.entry(record.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        warn!(
            id = %record.id,
            "Scheduler query failed ({}/{}): {}",
            failures,
            self.settings.max_reconcile_failures,
            reason
        );

        if failures < self.settings.max_reconcile_failures {
            return ReconcileOutcome::QueryFailed;
        }

        self.query_failures.remove(&record.id);
        match self.apply(
            &record.id,
            None,
            Some((
                ServiceStatus::Failed,
                Some(FailureReason::SchedulerUnreachable),
            )),
        ) {
            ReconcileOutcome::Unchanged => ReconcileOutcome::QueryFailed,
            outcome => {
                self.release_endpoint(record).await;
                outcome
            }
        }
    }

    /// Apply a reconcile result under the store's entry lock.
    ///
    /// Moves the state machine forbids (backwards, or out of a terminal
    /// state reached concurrently) leave the record as it is.
    fn apply(
        &self,
        id: &str,
        node: Option<String>,
        target: Option<(ServiceStatus, Option<FailureReason>)>,
    ) -> ReconcileOutcome {
        let mut from = None;
        let result = self.store.update(id, |r| {
            r.last_reconciled_at = Some(chrono::Utc::now());
            let mut changed = false;
            if r.is_terminal() {
                return Ok(false);
            }
            if let Some(node) = &node {
                if r.node.as_deref() != Some(node.as_str()) {
                    r.node = Some(node.clone());
                    changed = true;
                }
            }
            if let Some((status, reason)) = target.clone() {
                if r.status.can_transition_to(status) {
                    from = Some(r.status);
                    changed |= r.transition_to(status, reason)?;
                }
            }
            Ok(changed)
        });

        match result {
            Ok(record) => match from {
                Some(from) if from != record.status => {
                    if record.is_terminal() {
                        self.query_failures.remove(id);
                    }
                    info!(
                        id = %id,
                        node = record.node.as_deref().unwrap_or("-"),
                        "Service {} -> {}",
                        from,
                        record.status
                    );
                    ReconcileOutcome::Transitioned {
                        from,
                        to: record.status,
                    }
                }
                _ => ReconcileOutcome::Unchanged,
            },
            Err(StoreError::NotFound(_)) => ReconcileOutcome::Skipped,
            Err(e) => {
                error!(id = %id, "Failed to update record: {}", e);
                ReconcileOutcome::Unchanged
            }
        }
    }

    async fn cancel_best_effort(&self, id: &str) {
        match timeout(self.settings.stop_timeout(), self.scheduler.cancel(id)).await {
            Ok(Ok(())) | Ok(Err(SchedulerError::NotFound(_))) => {
                debug!(job_id = %id, "Cancelled job after startup timeout");
            }
            Ok(Err(e)) => warn!(job_id = %id, "Cancel after startup timeout failed: {}", e),
            Err(_) => warn!(job_id = %id, "Cancel after startup timeout timed out"),
        }
    }
}

/// Scheduler job name, unique per replica so a lost submission can be found
fn job_name(recipe_name: &str, batch: &str, index: usize) -> String {
    format!("hpcserve-{}-{}-{}", recipe_name, &batch[..8.min(batch.len())], index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::probe::StaticProber;
    use crate::recipe::{Recipe, RecipeCatalog, Resources};
    use crate::scheduler::memory::InMemoryScheduler;
    use crate::service::ServiceKind;

    struct Harness {
        scheduler: Arc<InMemoryScheduler>,
        prober: Arc<StaticProber>,
        store: Arc<RecordStore>,
        manager: LifecycleManager,
    }

    fn recipe() -> Recipe {
        Recipe {
            name: "vllm".to_string(),
            kind: ServiceKind::Inference,
            description: None,
            command: "vllm serve $MODEL --port $SERVICE_PORT".to_string(),
            environment: Default::default(),
            resources: Resources::default(),
        }
    }

    fn harness_with(settings: LifecycleSettings) -> Harness {
        let scheduler = Arc::new(InMemoryScheduler::new());
        let prober = Arc::new(StaticProber::new());
        let store = Arc::new(RecordStore::in_memory());
        let catalog = Arc::new(RecipeCatalog::from_recipes([recipe()]));
        let manager =
            LifecycleManager::new(store.clone(), scheduler.clone(), catalog, settings)
                .with_prober(prober.clone());
        Harness {
            scheduler,
            prober,
            store,
            manager,
        }
    }

    fn harness() -> Harness {
        harness_with(LifecycleSettings::default())
    }

    fn running(node: &str) -> JobState {
        JobState::Running {
            node: node.to_string(),
        }
    }

    async fn submit_one(h: &Harness) -> ServiceRecord {
        match h.manager.submit(SubmitRequest::new("vllm")).await.unwrap() {
            Deployment::Service(record) => record,
            other => panic!("expected a single service, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_single_service() {
        let h = harness();
        let record = submit_one(&h).await;
        assert_eq!(record.status, ServiceStatus::Pending);
        assert_eq!(record.port, 20000);
        assert!(record.group_id.is_none());
        assert_eq!(h.scheduler.submitted()[0].port, 20000);
        assert_eq!(h.manager.get_status(&record.id).unwrap().id, record.id);
    }

    #[tokio::test]
    async fn test_submit_group_allocates_distinct_ports() {
        let h = harness();
        let deployment = h
            .manager
            .submit(SubmitRequest::new("vllm").replicas(3))
            .await
            .unwrap();
        let Deployment::Group { group, members } = deployment else {
            panic!("expected a group");
        };
        assert_eq!(group.group_id, members[0].id);
        assert_eq!(members.len(), 3);
        let ports: HashSet<u16> = members.iter().map(|m| m.port).collect();
        assert_eq!(ports.len(), 3);
        assert!(members
            .iter()
            .all(|m| m.group_id.as_deref() == Some(group.group_id.as_str())));
    }

    #[tokio::test]
    async fn test_failed_submission_rolls_back() {
        let h = harness();
        h.scheduler
            .fail_submit_after(2, SchedulerError::QuotaExceeded("QOSMaxSubmitJobPerUserLimit".into()));

        let err = h
            .manager
            .submit(SubmitRequest::new("vllm").replicas(3))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
        assert_eq!(h.scheduler.cancelled().len(), 2);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_recipe_is_invalid_spec() {
        let h = harness();
        let err = h.manager.submit(SubmitRequest::new("nope")).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_SPEC");
        assert_eq!(h.scheduler.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_port_range_exhaustion() {
        let h = harness_with(LifecycleSettings {
            port_range: crate::lifecycle::PortRange {
                start: 30000,
                end: 30001,
            },
            ..LifecycleSettings::default()
        });
        let err = h
            .manager
            .submit(SubmitRequest::new("vllm").replicas(3))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
        assert_eq!(h.scheduler.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_halts_submissions_until_scheduler_answers() {
        let h = harness();
        let existing = submit_one(&h).await.id;
        h.scheduler
            .fail_submit_after(0, SchedulerError::Unauthorized("Permission denied (publickey)".into()));

        let err = h.manager.submit(SubmitRequest::new("vllm")).await.unwrap_err();
        assert_eq!(err.code(), "SCHEDULER_AUTH");
        assert!(h.manager.submissions_halted());

        let err = h.manager.submit(SubmitRequest::new("vllm")).await.unwrap_err();
        assert_eq!(err.code(), "SCHEDULER_AUTH");
        assert_eq!(h.scheduler.submit_calls(), 2);

        // A successful query proves the credentials work again
        h.manager.reconcile_record(&existing).await;
        assert!(!h.manager.submissions_halted());
        assert!(h.manager.submit(SubmitRequest::new("vllm")).await.is_ok());
    }

    #[tokio::test]
    async fn test_job_names_are_unique_per_replica() {
        let h = harness();
        h.manager
            .submit(SubmitRequest::new("vllm").replicas(2))
            .await
            .unwrap();
        submit_one(&h).await;

        let names: HashSet<String> = h.scheduler.submitted().into_iter().map(|j| j.name).collect();
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|n| n.starts_with("hpcserve-vllm-")));
    }

    #[tokio::test]
    async fn test_unconfirmed_submission_is_cancelled_by_name() {
        let h = harness();
        h.scheduler.stall_submit_after(1, Duration::from_secs(5));

        let err = h
            .manager
            .submit(SubmitRequest {
                timeout_secs: Some(1),
                ..SubmitRequest::new("vllm").replicas(3)
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(h.scheduler.submit_calls(), 2);
        assert_eq!(h.scheduler.cancelled().len(), 2);
        assert!(h.scheduler.live_jobs().is_empty());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_walks_lifecycle() {
        let h = harness();
        let record = submit_one(&h).await;
        let id = record.id.clone();

        assert_eq!(h.manager.reconcile_record(&id).await, ReconcileOutcome::Unchanged);

        h.scheduler.set_state(&id, running("gpu01"));
        assert_eq!(
            h.manager.reconcile_record(&id).await,
            ReconcileOutcome::Transitioned {
                from: ServiceStatus::Pending,
                to: ServiceStatus::Configuring
            }
        );
        assert_eq!(h.store.get(&id).unwrap().node.as_deref(), Some("gpu01"));

        h.prober.set("gpu01:20000", ProbeOutcome::Listening);
        h.manager.reconcile_record(&id).await;
        assert_eq!(h.store.get(&id).unwrap().status, ServiceStatus::Starting);

        h.prober.set("gpu01:20000", ProbeOutcome::Healthy);
        h.manager.reconcile_record(&id).await;
        let rec = h.store.get(&id).unwrap();
        assert_eq!(rec.status, ServiceStatus::Running);
        assert_eq!(rec.endpoint.as_deref(), Some("gpu01:20000"));

        h.scheduler.set_state(&id, JobState::Exited { code: 0 });
        h.manager.reconcile_record(&id).await;
        let rec = h.store.get(&id).unwrap();
        assert_eq!(rec.status, ServiceStatus::Completed);
        assert!(rec.endpoint.is_none());
    }

    #[tokio::test]
    async fn test_probe_regression_does_not_move_backwards() {
        let h = harness();
        let id = submit_one(&h).await.id;
        h.scheduler.set_state(&id, running("gpu01"));
        h.prober.set("gpu01:20000", ProbeOutcome::Listening);
        h.manager.reconcile_record(&id).await;

        h.prober.set("gpu01:20000", ProbeOutcome::Unreachable);
        assert_eq!(h.manager.reconcile_record(&id).await, ReconcileOutcome::Unchanged);
        assert_eq!(h.store.get(&id).unwrap().status, ServiceStatus::Starting);
    }

    #[tokio::test]
    async fn test_nonzero_exit_and_lost_job() {
        let h = harness();
        let a = submit_one(&h).await.id;
        let b = submit_one(&h).await.id;
        h.scheduler.set_state(&a, JobState::Exited { code: 137 });
        h.scheduler.forget(&b);

        h.manager.reconcile().await;
        let ra = h.store.get(&a).unwrap();
        assert_eq!(ra.status, ServiceStatus::Failed);
        assert_eq!(ra.failure_reason, Some(FailureReason::ExitCode(137)));
        let rb = h.store.get(&b).unwrap();
        assert_eq!(rb.failure_reason, Some(FailureReason::JobLost));
    }

    #[tokio::test]
    async fn test_starting_timeout_fails_and_cancels() {
        let h = harness_with(LifecycleSettings {
            starting_timeout_secs: 0,
            ..LifecycleSettings::default()
        });
        let id = submit_one(&h).await.id;
        h.scheduler.set_state(&id, running("gpu03"));
        h.prober.set("gpu03:20000", ProbeOutcome::Listening);

        h.manager.reconcile_record(&id).await;
        assert_eq!(h.store.get(&id).unwrap().status, ServiceStatus::Starting);

        h.manager.reconcile_record(&id).await;
        let rec = h.store.get(&id).unwrap();
        assert_eq!(rec.status, ServiceStatus::Failed);
        assert_eq!(rec.failure_reason, Some(FailureReason::StartupTimeout));
        assert_eq!(h.scheduler.cancelled(), vec![id]);
    }

    #[tokio::test]
    async fn test_crash_before_listening_fails_after_startup_bound() {
        let h = harness_with(LifecycleSettings {
            starting_timeout_secs: 0,
            ..LifecycleSettings::default()
        });
        let id = submit_one(&h).await.id;
        h.scheduler.set_state(&id, running("gpu04"));

        h.manager.reconcile_record(&id).await;
        assert_eq!(h.store.get(&id).unwrap().status, ServiceStatus::Configuring);

        // Health endpoint never comes up
        h.manager.reconcile_record(&id).await;
        let rec = h.store.get(&id).unwrap();
        assert_eq!(rec.status, ServiceStatus::Failed);
        assert_eq!(rec.failure_reason, Some(FailureReason::StartupTimeout));
        assert_eq!(h.scheduler.cancelled(), vec![id]);
    }

    #[tokio::test]
    async fn test_queue_wait_does_not_count_towards_startup_bound() {
        let h = harness_with(LifecycleSettings {
            starting_timeout_secs: 0,
            ..LifecycleSettings::default()
        });
        let id = submit_one(&h).await.id;
        for _ in 0..3 {
            h.manager.reconcile_record(&id).await;
        }
        assert_eq!(h.store.get(&id).unwrap().status, ServiceStatus::Pending);
    }

    #[tokio::test]
    async fn test_forwards_released_when_services_end() {
        use crate::tunnel::memory::MemoryConnector;
        use crate::tunnel::{BridgeSettings, TunnelBridge, TunnelCredentials};

        let bridge = Arc::new(TunnelBridge::new(
            Arc::new(MemoryConnector::new()),
            BridgeSettings::default(),
        ));
        let session = bridge
            .establish(TunnelCredentials {
                cluster: "c1".to_string(),
                host: "login".to_string(),
                user: None,
                port: None,
                identity_file: None,
            })
            .await
            .unwrap();

        let scheduler = Arc::new(InMemoryScheduler::new());
        let store = Arc::new(RecordStore::in_memory());
        let catalog = Arc::new(RecipeCatalog::from_recipes([recipe()]));
        let manager = LifecycleManager::new(
            store,
            scheduler.clone(),
            catalog,
            LifecycleSettings::default(),
        )
        .with_prober(Arc::new(StaticProber::new()))
        .with_endpoints(EndpointResolver::Tunnel {
            bridge: bridge.clone(),
            session: session.clone(),
        });

        let group_id = manager
            .submit(SubmitRequest::new("vllm").replicas(2))
            .await
            .unwrap()
            .id()
            .to_string();
        let (_, members) = manager.get_group(&group_id).unwrap();
        for (i, member) in members.iter().enumerate() {
            scheduler.set_state(&member.id, running(&format!("gpu0{}", i + 1)));
        }
        manager.reconcile().await;
        assert_eq!(session.forwards().len(), 2);

        // One member exits, the group is then stopped
        scheduler.set_state(&members[1].id, JobState::Exited { code: 1 });
        manager.reconcile().await;
        assert_eq!(session.forwards().len(), 1);

        manager.stop_group(&group_id, true, None).await.unwrap();
        assert!(session.forwards().is_empty());

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_scheduler_unreachable_after_budget() {
        let h = harness_with(LifecycleSettings {
            max_reconcile_failures: 3,
            ..LifecycleSettings::default()
        });
        let id = submit_one(&h).await.id;
        h.scheduler.set_unavailable(true);

        for _ in 0..2 {
            assert_eq!(h.manager.reconcile_record(&id).await, ReconcileOutcome::QueryFailed);
            assert_eq!(h.store.get(&id).unwrap().status, ServiceStatus::Pending);
        }
        h.manager.reconcile_record(&id).await;
        let rec = h.store.get(&id).unwrap();
        assert_eq!(rec.status, ServiceStatus::Failed);
        assert_eq!(rec.failure_reason, Some(FailureReason::SchedulerUnreachable));
    }

    #[tokio::test]
    async fn test_query_success_resets_failure_count() {
        let h = harness_with(LifecycleSettings {
            max_reconcile_failures: 2,
            ..LifecycleSettings::default()
        });
        let id = submit_one(&h).await.id;

        h.scheduler.set_unavailable(true);
        h.manager.reconcile_record(&id).await;
        h.scheduler.set_unavailable(false);
        h.manager.reconcile_record(&id).await;
        h.scheduler.set_unavailable(true);
        h.manager.reconcile_record(&id).await;

        assert_eq!(h.store.get(&id).unwrap().status, ServiceStatus::Pending);
    }

    #[tokio::test]
    async fn test_stop_preserves_and_is_idempotent() {
        let h = harness();
        let id = submit_one(&h).await.id;

        let stopped = h.manager.stop(&id, true, None).await.unwrap().unwrap();
        assert_eq!(stopped.status, ServiceStatus::Cancelled);

        let again = h.manager.stop(&id, true, None).await.unwrap().unwrap();
        assert_eq!(again.status, ServiceStatus::Cancelled);
        assert_eq!(h.scheduler.cancel_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_when_job_already_gone() {
        let h = harness();
        let id = submit_one(&h).await.id;
        h.scheduler.forget(&id);

        let stopped = h.manager.stop(&id, true, None).await.unwrap().unwrap();
        assert_eq!(stopped.status, ServiceStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_legacy_stop_removes_record() {
        let h = harness();
        let id = submit_one(&h).await.id;

        let removed = h.manager.stop(&id, false, None).await.unwrap();
        assert_eq!(removed.unwrap().status, ServiceStatus::Cancelled);
        assert!(h.store.get(&id).is_none());

        assert!(h.manager.stop(&id, false, None).await.unwrap().is_none());
        assert_eq!(
            h.manager.stop(&id, true, None).await.unwrap_err().code(),
            "RECORD_NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_stop_group() {
        let h = harness();
        let group_id = h
            .manager
            .submit(SubmitRequest::new("vllm").replicas(2))
            .await
            .unwrap()
            .id()
            .to_string();

        let (_, members) = h
            .manager
            .stop_group(&group_id, true, None)
            .await
            .unwrap()
            .unwrap();
        assert!(members.iter().all(|m| m.status == ServiceStatus::Cancelled));
        assert_eq!(h.scheduler.cancel_calls(), 2);

        h.manager.stop_group(&group_id, false, None).await.unwrap();
        assert!(h.store.get_group(&group_id).is_none());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_record_ignores_late_exit() {
        let h = harness();
        let id = submit_one(&h).await.id;
        h.manager.stop(&id, true, None).await.unwrap();

        h.scheduler.set_state(&id, JobState::Exited { code: 1 });
        assert_eq!(h.manager.reconcile_record(&id).await, ReconcileOutcome::Skipped);
        assert_eq!(h.store.get(&id).unwrap().status, ServiceStatus::Cancelled);
    }
}
