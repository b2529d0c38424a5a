//! Gateway HTTP surface: control plane under `/api/v1/services` and
//! `/api/v1/service-groups`, data plane under `/api/v1/vllm` and
//! `/api/v1/vector-db`.

pub mod error;
pub mod handlers;
pub mod proxy;
pub mod state;

use axum::{
    routing::{any, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ErrorBody};
pub use state::AppState;

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(handlers::status))
        .route("/targets", get(handlers::targets))
        .route(
            "/services",
            get(handlers::list_services).post(handlers::create_service),
        )
        .route(
            "/services/{id}",
            get(handlers::get_service).delete(handlers::delete_service),
        )
        .route(
            "/services/{id}/status",
            get(handlers::get_service_status).post(handlers::update_service_status),
        )
        .route("/service-groups", get(handlers::list_groups))
        .route(
            "/service-groups/{id}",
            get(handlers::get_group).delete(handlers::delete_group),
        )
        .route(
            "/service-groups/{id}/status",
            get(handlers::get_group_status).post(handlers::update_group_status),
        )
        .route("/vllm/{id}/prompt", post(proxy::vllm_prompt))
        .route("/vllm/{id}/chat", post(proxy::vllm_chat))
        .route("/vllm/{id}/models", get(proxy::vllm_models))
        .route("/vector-db/{id}/{*path}", any(proxy::vector_db));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
