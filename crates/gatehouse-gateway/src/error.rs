use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use gatehouse_core::error::GatehouseError;

/// Handler error, rendered as `{"error": ..., "code": ...}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Engine(GatehouseError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl From<GatehouseError> for ApiError {
    fn from(e: GatehouseError) -> Self {
        Self::Engine(e)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Engine(e) if e.is_not_found() => (StatusCode::NOT_FOUND, "not_found"),
            Self::Engine(GatehouseError::Definition(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_definition")
            }
            Self::Engine(GatehouseError::InvalidState(_)) => (StatusCode::CONFLICT, "invalid_state"),
            Self::Engine(GatehouseError::InstanceBusy(_)) => (StatusCode::CONFLICT, "instance_busy"),
            Self::Engine(GatehouseError::Json(_)) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Engine(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match self {
            Self::BadRequest(msg) => msg,
            Self::Engine(e) => e.to_string(),
        };
        if status.is_server_error() {
            error!(error = %message, "Request failed");
        }
        (status, Json(ErrorBody { error: message, code })).into_response()
    }
}
