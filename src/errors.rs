// =============================================================================
// Error taxonomy for the edge gate core
// =============================================================================
//
// Internal subsystems return `CoreError`; the HTTP surface converts it to a
// status code at a single boundary (`impl IntoResponse`) instead of each
// handler picking its own code. `anyhow` is still used for startup-time
// failures that have no caller to report a typed error to.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport unavailable")]
    TransportUnavailable,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("not found")]
    NotFound,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Config(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound => StatusCode::NOT_FOUND,
        };

        let body = serde_json::json!({
            "ok": false,
            "error": { "message": self.to_string() },
        });

        (status, Json(body)).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
