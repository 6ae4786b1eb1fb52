// HTTP mapping of KainosError

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::KainosError;

/// Error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

/// Handler error wrapper so `?` works on `KainosError` inside handlers
#[derive(Debug)]
pub struct ApiError(pub KainosError);

impl From<KainosError> for ApiError {
    fn from(err: KainosError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_for(&self.0)
    }
}

/// Status code for an error class
pub fn status_for(err: &KainosError) -> StatusCode {
    match err {
        KainosError::UnknownSchedule(_)
        | KainosError::InvalidInput(_)
        | KainosError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
        KainosError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        KainosError::NotFound(_) => StatusCode::NOT_FOUND,
        KainosError::Conflict(_) => StatusCode::CONFLICT,
        e if e.is_guard() => StatusCode::SERVICE_UNAVAILABLE,
        KainosError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        e if e.is_transient() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_type(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "invalid_request_error",
        StatusCode::UNAUTHORIZED => "authentication_error",
        StatusCode::NOT_FOUND => "not_found_error",
        StatusCode::CONFLICT => "conflict_error",
        StatusCode::SERVICE_UNAVAILABLE => "unavailable_error",
        StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => "upstream_error",
        _ => "internal_error",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("❌ Request failed with {}: {}", status, self.0);
        }
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.0.to_string(),
                error_type: error_type(status).to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
