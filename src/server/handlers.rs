use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::{Deployment, SubmitRequest};
use crate::server::error::ApiError;
use crate::server::state::AppState;
use crate::service::{
    aggregate_status, AggregateStatus, FailureReason, ReplicaGroup, ServiceRecord, ServiceStatus,
};

// ============================================================================
// Views
// ============================================================================

/// A record plus its public URL
#[derive(Debug, Serialize)]
pub struct ServiceView {
    #[serde(flatten)]
    pub record: ServiceRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl From<ServiceRecord> for ServiceView {
    fn from(record: ServiceRecord) -> Self {
        let url = record.describe_endpoint();
        Self { record, url }
    }
}

#[derive(Debug, Serialize)]
pub struct GroupView {
    pub group_id: String,
    pub recipe_name: String,
    pub created_at: DateTime<Utc>,
    pub status: AggregateStatus,
    pub running: usize,
    pub members: Vec<ServiceView>,
}

impl GroupView {
    pub fn new(group: ReplicaGroup, members: Vec<ServiceRecord>) -> Self {
        let status = aggregate_status(members.iter().map(|m| m.status));
        let running = members.iter().filter(|m| m.is_running()).count();
        Self {
            group_id: group.group_id,
            recipe_name: group.recipe_name,
            created_at: group.created_at,
            status,
            running,
            members: members.into_iter().map(ServiceView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum DeploymentView {
    Service(ServiceView),
    Group(GroupView),
}

impl From<Deployment> for DeploymentView {
    fn from(deployment: Deployment) -> Self {
        match deployment {
            Deployment::Service(record) => DeploymentView::Service(record.into()),
            Deployment::Group { group, members } => {
                DeploymentView::Group(GroupView::new(group, members))
            }
        }
    }
}

/// Compact status of one service
#[derive(Debug, Serialize)]
pub struct ServiceStatusView {
    pub id: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl From<&ServiceRecord> for ServiceStatusView {
    fn from(record: &ServiceRecord) -> Self {
        Self {
            id: record.id.clone(),
            status: record.status,
            failure_reason: record.failure_reason.clone(),
            url: record.describe_endpoint(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GroupStatusView {
    pub group_id: String,
    pub status: AggregateStatus,
    pub running: usize,
    pub total: usize,
    pub members: Vec<ServiceStatusView>,
}

impl GroupStatusView {
    fn new(group: &ReplicaGroup, members: &[ServiceRecord]) -> Self {
        Self {
            group_id: group.group_id.clone(),
            status: aggregate_status(members.iter().map(|m| m.status)),
            running: members.iter().filter(|m| m.is_running()).count(),
            total: members.len(),
            members: members.iter().map(ServiceStatusView::from).collect(),
        }
    }
}

/// Body of `POST .../status`
#[derive(Debug, Deserialize)]
pub struct StatusChange {
    pub status: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct Removed {
    pub id: String,
    pub removed: bool,
}

/// One Prometheus HTTP service-discovery entry
#[derive(Debug, Serialize)]
pub struct TargetGroup {
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

// ============================================================================
// SBIO: Pure helpers
// ============================================================================

/// Only cancellation can be requested by clients
fn parse_status_change(change: &StatusChange) -> Result<Option<Duration>, ApiError> {
    if change.status != ServiceStatus::Cancelled.as_str() {
        return Err(ApiError::invalid(format!(
            "Unsupported status '{}'; only 'cancelled' can be requested",
            change.status
        )));
    }
    Ok(change.timeout_secs.map(Duration::from_secs))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::invalid(e.body_text()))
}

/// Service-discovery entries for running services
pub fn discovery_targets(records: &[ServiceRecord]) -> Vec<TargetGroup> {
    records
        .iter()
        .filter(|r| r.is_running())
        .filter_map(|r| {
            let endpoint = r.endpoint.clone()?;
            let mut labels = BTreeMap::new();
            labels.insert("service_id".to_string(), r.id.clone());
            labels.insert("recipe".to_string(), r.recipe_name.clone());
            labels.insert("kind".to_string(), r.kind.as_str().to_string());
            if let Some(node) = &r.node {
                labels.insert("node".to_string(), node.clone());
            }
            if let Some(group_id) = &r.group_id {
                labels.insert("group_id".to_string(), group_id.clone());
            }
            Some(TargetGroup {
                targets: vec![endpoint],
                labels,
            })
        })
        .collect()
}

// ============================================================================
// Gateway
// ============================================================================

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.status().await)
}

pub async fn targets(State(state): State<AppState>) -> impl IntoResponse {
    Json(discovery_targets(&state.lifecycle().list()))
}

// ============================================================================
// Services
// ============================================================================

pub async fn create_service(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = json_body(body)?;
    let deployment = state.lifecycle().submit(request).await?;
    Ok((StatusCode::CREATED, Json(DeploymentView::from(deployment))))
}

pub async fn list_services(State(state): State<AppState>) -> impl IntoResponse {
    let views: Vec<ServiceView> = state
        .lifecycle()
        .list()
        .into_iter()
        .map(ServiceView::from)
        .collect();
    Json(views)
}

pub async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceView>, ApiError> {
    let record = state.lifecycle().get_status(&id)?;
    Ok(Json(record.into()))
}

pub async fn get_service_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceStatusView>, ApiError> {
    let record = state.lifecycle().get_status(&id)?;
    Ok(Json(ServiceStatusView::from(&record)))
}

/// Preferred stop: the record stays as `cancelled`
pub async fn update_service_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<StatusChange>, JsonRejection>,
) -> Result<Json<ServiceView>, ApiError> {
    let change = json_body(body)?;
    let stop_timeout = parse_status_change(&change)?;
    let record = state
        .lifecycle()
        .stop(&id, true, stop_timeout)
        .await?
        .ok_or_else(|| ApiError::not_found(&id))?;
    Ok(Json(record.into()))
}

/// Legacy stop: cancels and removes the record
pub async fn delete_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Removed>, ApiError> {
    let removed = state.lifecycle().stop(&id, false, None).await?;
    Ok(Json(Removed {
        id,
        removed: removed.is_some(),
    }))
}

// ============================================================================
// Service groups
// ============================================================================

pub async fn list_groups(State(state): State<AppState>) -> impl IntoResponse {
    let views: Vec<GroupView> = state
        .lifecycle()
        .list_groups()
        .into_iter()
        .map(|(group, members)| GroupView::new(group, members))
        .collect();
    Json(views)
}

pub async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<GroupView>, ApiError> {
    let (group, members) = state.lifecycle().get_group(&id)?;
    Ok(Json(GroupView::new(group, members)))
}

pub async fn get_group_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<GroupStatusView>, ApiError> {
    let (group, members) = state.lifecycle().get_group(&id)?;
    Ok(Json(GroupStatusView::new(&group, &members)))
}

pub async fn update_group_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<StatusChange>, JsonRejection>,
) -> Result<Json<GroupView>, ApiError> {
    let change = json_body(body)?;
    let stop_timeout = parse_status_change(&change)?;
    let (group, members) = state
        .lifecycle()
        .stop_group(&id, true, stop_timeout)
        .await?
        .ok_or_else(|| ApiError::not_found(&id))?;
    Ok(Json(GroupView::new(group, members)))
}

pub async fn delete_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Removed>, ApiError> {
    let removed = state.lifecycle().stop_group(&id, false, None).await?;
    Ok(Json(Removed {
        id,
        removed: removed.is_some(),
    }))
}
