//! JSON error responses with stable codes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::lifecycle::LifecycleError;
use crate::router::RouterError;

/// Body of every error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

/// HTTP status for an error code
pub fn status_for(code: &str) -> StatusCode {
    match code {
        "INVALID_SPEC" => StatusCode::BAD_REQUEST,
        "QUOTA_EXCEEDED" => StatusCode::TOO_MANY_REQUESTS,
        "SCHEDULER_UNAVAILABLE" | "SCHEDULER_AUTH" | "GROUP_UNAVAILABLE" => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        "RECORD_NOT_FOUND" => StatusCode::NOT_FOUND,
        "TUNNEL_DOWN" | "UPSTREAM_ERROR" => StatusCode::BAD_GATEWAY,
        "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: status_for(code),
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new("INVALID_SPEC", message)
    }

    pub fn not_found(id: &str) -> Self {
        Self::new("RECORD_NOT_FOUND", format!("Record '{}' not found", id))
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, "{}", self.message);
        } else {
            warn!(code = self.code, "{}", self.message);
        }
        let body = ErrorBody {
            code: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for("INVALID_SPEC"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for("QUOTA_EXCEEDED"), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for("SCHEDULER_AUTH"), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for("RECORD_NOT_FOUND"), StatusCode::NOT_FOUND);
        assert_eq!(status_for("TUNNEL_DOWN"), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for("TIMEOUT"), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for("INTERNAL"), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_lifecycle_error_conversion() {
        let err = ApiError::from(LifecycleError::QuotaExceeded("QOSMaxSubmitJob".into()));
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code, "QUOTA_EXCEEDED");
        assert!(err.message.contains("Reduce the replica count"));
    }
}
