//! Data plane: forwards client requests to a running replica

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method},
    response::{IntoResponse, Response},
};
use tracing::debug;
use uuid::Uuid;

use crate::router::{strip_hop_by_hop, ForwardedResponse, UpstreamRequest};
use crate::server::error::ApiError;
use crate::server::state::AppState;
use crate::service::ServiceKind;

/// Pins a client to one replica of a group
pub const SESSION_HEADER: &str = "x-session-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const SERVED_BY_HEADER: &str = "x-served-by";
pub const SERVED_PORT_HEADER: &str = "x-served-port";

const VLLM: &str = "vllm";
const VECTOR_DB: &str = "vector-db";

// ============================================================================
// SBIO: Pure helpers
// ============================================================================

/// Replica path with the client's query string appended
pub fn upstream_path(path: &str, query: Option<&str>) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path,
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn session_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn into_response(forwarded: ForwardedResponse, request_id: &str) -> Response {
    let ForwardedResponse {
        served_by,
        port,
        response,
    } = forwarded;

    let mut out = (response.status, response.body).into_response();
    let headers = out.headers_mut();
    headers.extend(strip_hop_by_hop(response.headers));
    if let Ok(value) = HeaderValue::from_str(&served_by) {
        headers.insert(HeaderName::from_static(SERVED_BY_HEADER), value);
    }
    headers.insert(HeaderName::from_static(SERVED_PORT_HEADER), HeaderValue::from(port));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    out
}

// ============================================================================
// Forwarding
// ============================================================================

/// Workload kind behind a group or service id
fn kind_of(state: &AppState, id: &str) -> Result<ServiceKind, ApiError> {
    let store = state.lifecycle().store();
    let record_id = match store.get_group(id) {
        Some(group) => group.members.first().cloned(),
        None => Some(id.to_string()),
    };
    record_id
        .and_then(|rid| store.get(&rid))
        .map(|r| r.kind)
        .ok_or_else(|| ApiError::not_found(id))
}

async fn forward(
    state: AppState,
    family: &'static str,
    id: String,
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let kind = kind_of(&state, &id)?;
    if kind.workload().data_plane() != family {
        return Err(ApiError::invalid(format!(
            "'{}' is a {} service, not reachable through /{}",
            id,
            kind.as_str(),
            family
        )));
    }

    let request_id = request_id(&headers);
    let key = session_key(&headers);
    debug!(id = %id, request_id = %request_id, "{} {} via /{}", method, path, family);

    let mut upstream_headers = headers;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        upstream_headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    let request = UpstreamRequest::new(method, path, body).with_headers(upstream_headers);

    let forwarded = state
        .router()
        .dispatch(&id, request, key.as_deref())
        .await?;
    Ok(into_response(forwarded, &request_id))
}

/// `POST vllm/{id}/prompt` -> `/v1/completions`
pub async fn vllm_prompt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let path = upstream_path("/v1/completions", query.as_deref());
    forward(state, VLLM, id, Method::POST, path, headers, body).await
}

/// `POST vllm/{id}/chat` -> `/v1/chat/completions`
pub async fn vllm_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let path = upstream_path("/v1/chat/completions", query.as_deref());
    forward(state, VLLM, id, Method::POST, path, headers, body).await
}

/// `GET vllm/{id}/models` -> `/v1/models`
pub async fn vllm_models(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    forward(
        state,
        VLLM,
        id,
        Method::GET,
        "/v1/models".to_string(),
        headers,
        Bytes::new(),
    )
    .await
}

/// `vector-db/{id}/{*path}`, any method
pub async fn vector_db(
    State(state): State<AppState>,
    Path((id, rest)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let path = upstream_path(&rest, query.as_deref());
    forward(state, VECTOR_DB, id, method, path, headers, body).await
}
