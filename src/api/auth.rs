// =============================================================================
// Edge Token Authentication — Axum Extractor
// =============================================================================
//
// Extracts and validates the `X-Edge-Token` header against the live config's
// `auth.token`. Enforcement is skipped entirely when `auth.enabled` is false
// (the default — a gate on an isolated network segment need not set one up).
// Comparison is constant-time to avoid a timing side-channel on the token.
//
// Usage as an Axum extractor:
//
//   async fn handler(_auth: EdgeToken, State(state): State<Arc<AppState>>) { ... }
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::AppState;

/// Compare two byte slices in constant time. Returns `true` if identical.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Validate a presented token against the live config. Returns `true` when
/// auth is disabled (nothing to check) or the token matches.
pub fn validate_token(state: &AppState, presented: &str) -> bool {
    let config = state.config.read();
    if !config.auth.enabled {
        return true;
    }
    constant_time_eq(presented.as_bytes(), config.auth.token.as_bytes())
}

/// Marker extracted on success; carries nothing, the check is the point.
pub struct EdgeToken;

pub struct AuthRejection;

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "ok": false,
            "error": { "message": "unauthorized" },
        });
        (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response()
    }
}

impl<S> FromRequestParts<S> for EdgeToken
where
    Arc<AppState>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = Arc::<AppState>::from_ref(state);

        if !app_state.config.read().auth.enabled {
            return Ok(EdgeToken);
        }

        let presented = parts
            .headers
            .get("X-Edge-Token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if validate_token(&app_state, presented) {
            Ok(EdgeToken)
        } else {
            warn!("rejected request with missing or invalid X-Edge-Token");
            Err(AuthRejection)
        }
    }
}
