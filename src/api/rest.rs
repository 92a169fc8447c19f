// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Every handler is a thin binding onto Control Plane operations already
// implemented on `AppState`; none of them own domain state. `/health` is the
// one public route — everything else under `/v1/*` goes through the
// `EdgeToken` extractor, which itself is a no-op when `auth.enabled` is
// false.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::api::auth::EdgeToken;
use crate::app_state::AppState;
use crate::config::ConfigUpdate;
use crate::errors::{CoreError, CoreResult};
use crate::logging;

const MAX_ALARM_LIMIT: i64 = 100;
const ALARM_EXPORT_CAP: i64 = 10_000;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/v1/tags/in-cart", post(tags_in_cart))
        .route("/v1/tags/paid", post(tags_paid))
        .route("/v1/tags/remove", post(tags_remove))
        .route("/v1/tags/lookup", get(tags_lookup))
        .route("/v1/calibration/start", post(calibration_start))
        .route("/v1/calibration/stop", post(calibration_stop))
        .route("/v1/calibration/test-alarm", post(calibration_test_alarm))
        .route(
            "/v1/calibration/power",
            post(calibration_set_power).get(calibration_get_power),
        )
        .route("/v1/calibration/status", get(calibration_get_status))
        .route("/v1/config", get(config_get).put(config_put))
        .route("/v1/config/reload", post(config_reload))
        .route("/v1/alarms", get(alarms_list))
        .route("/v1/alarms/export", get(alarms_export))
        .route("/v1/stats", get(stats))
        .route("/v1/debug/cleanup", get(debug_cleanup))
        .route("/v1/debug/logs", get(debug_logs))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

fn ok_json(body: serde_json::Value) -> Response {
    let mut value = serde_json::json!({ "ok": true });
    if let (Some(obj), Some(extra)) = (value.as_object_mut(), body.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    Json(value).into_response()
}

// =============================================================================
// Health (public) / Stats / Debug
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    mqtt_connected: bool,
    db_ok: bool,
    gate_last_seen_seconds: Option<i64>,
    uptime_seconds: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mqtt_connected = state.gateway.is_connected();
    let now = Utc::now().timestamp();
    let db_ok = state.store.counts(now).await.is_ok();

    Json(HealthResponse {
        ok: mqtt_connected && db_ok,
        mqtt_connected,
        db_ok,
        gate_last_seen_seconds: state.gateway.last_tag_seen_seconds(),
        uptime_seconds: state.uptime_seconds(),
    })
}

async fn stats(_auth: EdgeToken, State(state): State<Arc<AppState>>) -> CoreResult<impl IntoResponse> {
    let now = Utc::now().timestamp();
    let counts = state.store.counts(now).await?;
    let alarms_last_24h = state.audit.count_last(86_400).await?;

    Ok(Json(serde_json::json!({
        "in_cart_count": counts.in_cart_count,
        "paid_count": counts.paid_count,
        "alarms_last_24h": alarms_last_24h,
    })))
}

async fn debug_cleanup(_auth: EdgeToken, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config.read();
    Json(serde_json::json!({
        "cleanup_running": true,
        "cleanup_interval_seconds": config.ttl.cleanup_interval_seconds,
        "in_cart_ttl_seconds": config.ttl.in_cart_seconds,
        "paid_ttl_seconds": config.ttl.paid_seconds,
    }))
}

#[derive(Deserialize)]
struct DebugLogsQuery {
    lines: Option<usize>,
}

async fn debug_logs(
    _auth: EdgeToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<DebugLogsQuery>,
) -> impl IntoResponse {
    let lines = query.lines.unwrap_or(100);
    let (exists, total_lines, tail) = logging::tail(&state.log_path, lines);

    if !exists {
        return Json(serde_json::json!({
            "log_path": state.log_path,
            "exists": false,
            "error": "log file not found",
            "lines": Vec::<String>::new(),
        }));
    }

    Json(serde_json::json!({
        "log_path": state.log_path,
        "exists": true,
        "total_lines": total_lines,
        "lines": tail,
    }))
}

// =============================================================================
// Tags
// =============================================================================

#[derive(Deserialize)]
struct TagsInCartRequest {
    #[serde(default)]
    store_id: String,
    #[serde(default)]
    pos_id: String,
    order_id: String,
    #[serde(default)]
    ttl_seconds: Option<i64>,
    qr_codes: Vec<String>,
}

async fn tags_in_cart(
    _auth: EdgeToken,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TagsInCartRequest>,
) -> CoreResult<impl IntoResponse> {
    let (upserted, ignored_paid, ttl) = state
        .register_in_cart(&req.qr_codes, &req.order_id, &req.pos_id, &req.store_id, req.ttl_seconds)
        .await?;

    Ok(ok_json(serde_json::json!({
        "upserted": upserted,
        "ignored_paid": ignored_paid,
        "expires_in_seconds": ttl,
    })))
}

#[derive(Deserialize)]
struct TagsPaidRequest {
    #[serde(default)]
    store_id: String,
    #[serde(default)]
    pos_id: String,
    order_id: String,
    #[serde(default)]
    ttl_seconds: Option<i64>,
    qr_codes: Vec<String>,
}

async fn tags_paid(
    _auth: EdgeToken,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TagsPaidRequest>,
) -> CoreResult<impl IntoResponse> {
    let (upserted, ttl) = state
        .register_paid(&req.qr_codes, &req.order_id, &req.pos_id, &req.store_id, req.ttl_seconds)
        .await?;

    Ok(ok_json(serde_json::json!({
        "upserted": upserted,
        "expires_in_seconds": ttl,
    })))
}

#[derive(Deserialize)]
struct TagsRemoveRequest {
    #[serde(default)]
    order_id: String,
    qr_codes: Vec<String>,
}

async fn tags_remove(
    _auth: EdgeToken,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TagsRemoveRequest>,
) -> CoreResult<impl IntoResponse> {
    let deleted = state.remove_tags(&req.qr_codes, &req.order_id).await?;
    Ok(ok_json(serde_json::json!({ "deleted": deleted })))
}

#[derive(Deserialize)]
struct TagsLookupQuery {
    qr_code: Option<String>,
    epc: Option<String>,
}

async fn tags_lookup(
    _auth: EdgeToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TagsLookupQuery>,
) -> CoreResult<impl IntoResponse> {
    let status = state.lookup(query.qr_code.as_deref(), query.epc.as_deref()).await?;
    Ok(ok_json(serde_json::to_value(&status).unwrap_or_default()))
}

// =============================================================================
// Calibration
// =============================================================================

async fn calibration_start(_auth: EdgeToken, State(state): State<Arc<AppState>>) -> CoreResult<impl IntoResponse> {
    state.start_inventory().await?;
    Ok(ok_json(serde_json::json!({ "message": "inventory scan started" })))
}

async fn calibration_stop(_auth: EdgeToken, State(state): State<Arc<AppState>>) -> CoreResult<impl IntoResponse> {
    state.stop_inventory().await?;
    Ok(ok_json(serde_json::json!({ "message": "inventory scan stopped" })))
}

async fn calibration_test_alarm(_auth: EdgeToken, State(state): State<Arc<AppState>>) -> CoreResult<impl IntoResponse> {
    state.trigger_test_pulse().await?;
    Ok(ok_json(serde_json::json!({ "message": "test alarm pulse sent" })))
}

#[derive(Deserialize)]
struct AntennaPowerRequest {
    #[serde(default = "default_high_power")]
    antenna1: i64,
    #[serde(default = "default_high_power")]
    antenna2: i64,
    #[serde(default = "default_low_power")]
    antenna3: i64,
    #[serde(default = "default_low_power")]
    antenna4: i64,
}

fn default_high_power() -> i64 {
    20
}
fn default_low_power() -> i64 {
    15
}

async fn calibration_set_power(
    _auth: EdgeToken,
    State(state): State<Arc<AppState>>,
    Json(req): Json<AntennaPowerRequest>,
) -> CoreResult<impl IntoResponse> {
    state
        .set_power(req.antenna1, req.antenna2, req.antenna3, req.antenna4)
        .await?;
    Ok(ok_json(serde_json::json!({ "message": "antenna power set" })))
}

async fn calibration_get_power(_auth: EdgeToken, State(state): State<Arc<AppState>>) -> CoreResult<impl IntoResponse> {
    state.get_power().await?;
    Ok(ok_json(serde_json::json!({ "message": "power query sent, response will arrive via websocket" })))
}

async fn calibration_get_status(_auth: EdgeToken, State(state): State<Arc<AppState>>) -> CoreResult<impl IntoResponse> {
    state.get_reader_status().await?;
    Ok(ok_json(serde_json::json!({ "message": "status query sent, response will arrive via websocket" })))
}

// =============================================================================
// Config
// =============================================================================

async fn config_get(_auth: EdgeToken, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let masked = state.config.read().masked();
    ok_json(serde_json::json!({ "config": masked }))
}

async fn config_put(
    _auth: EdgeToken,
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> CoreResult<impl IntoResponse> {
    let merged = {
        let current = state.config.read().clone();
        current
            .merge(&update)
            .map_err(|e| CoreError::Config(format!("Invalid configuration: {e}")))?
    };

    *state.config.write() = merged;
    state.save_config();

    let masked = state.config.read().masked();
    Ok(ok_json(serde_json::json!({ "config": masked })))
}

async fn config_reload(_auth: EdgeToken, State(state): State<Arc<AppState>>) -> CoreResult<impl IntoResponse> {
    state.reload_config().map_err(|e| CoreError::Config(e.to_string()))?;
    Ok(ok_json(serde_json::json!({ "message": "config reloaded" })))
}

// =============================================================================
// Alarms
// =============================================================================

#[derive(Deserialize)]
struct AlarmsQuery {
    page: Option<i64>,
    limit: Option<i64>,
    from: Option<String>,
    to: Option<String>,
}

/// Parse a `YYYY-MM-DD` date into a UTC unix timestamp at midnight. When
/// `inclusive_end` is set, the result is shifted to the last second of that
/// day so the date's whole range is covered by a `<=` comparison.
fn parse_date_bound(date: &str, inclusive_end: bool) -> CoreResult<i64> {
    let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| CoreError::Validation(format!("invalid date '{date}', expected YYYY-MM-DD")))?;
    let midnight = parsed
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| CoreError::Validation("invalid date".to_string()))?;
    let ts = Utc.from_utc_datetime(&midnight).timestamp();
    Ok(if inclusive_end { ts + 86_400 - 1 } else { ts })
}

async fn alarms_list(
    _auth: EdgeToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlarmsQuery>,
) -> CoreResult<impl IntoResponse> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_ALARM_LIMIT);
    let from_ts = query.from.as_deref().map(|d| parse_date_bound(d, false)).transpose()?;
    let to_ts = query.to.as_deref().map(|d| parse_date_bound(d, true)).transpose()?;

    let (items, total) = state.audit.query(from_ts, to_ts, page, limit).await?;

    Ok(Json(serde_json::json!({
        "items": items,
        "total": total,
        "page": page,
        "limit": limit,
    })))
}

async fn alarms_export(
    _auth: EdgeToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlarmsQuery>,
) -> CoreResult<Response> {
    let from_ts = query.from.as_deref().map(|d| parse_date_bound(d, false)).transpose()?;
    let to_ts = query.to.as_deref().map(|d| parse_date_bound(d, true)).transpose()?;

    let csv_text = state.audit.export_csv(from_ts, to_ts, ALARM_EXPORT_CAP).await?;

    let filename = format!(
        "alarms_{}_{}.csv",
        query.from.as_deref().unwrap_or("all"),
        query.to.as_deref().unwrap_or("now"),
    );

    let headers = [
        (header::CONTENT_TYPE, "text/csv".to_string()),
        (header::CONTENT_DISPOSITION, format!("attachment; filename={filename}")),
    ];

    Ok((StatusCode::OK, headers, csv_text).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::to_bytes;
    use parking_lot::RwLock;
    use tower::ServiceExt;

    use crate::audit::AuditLog;
    use crate::config::EdgeConfig;
    use crate::decision::DecisionEngine;
    use crate::events::EventBus;
    use crate::gateway::ReaderGateway;
    use crate::store::StateStore;

    async fn test_state() -> Arc<AppState> {
        let config = Arc::new(RwLock::new(EdgeConfig::default()));
        let store = Arc::new(StateStore::open_in_memory().await.unwrap());
        let audit = Arc::new(AuditLog::open_in_memory().await.unwrap());
        let engine = Arc::new(DecisionEngine::with_system_clock());
        let bus = Arc::new(EventBus::new());
        let (gateway, _eventloop) = ReaderGateway::new(&config.read().mqtt, &config.read().gate);

        Arc::new(AppState::new(
            config,
            "test-config.json".to_string(),
            store,
            audit,
            engine,
            bus,
            Arc::new(gateway),
            "test.log".to_string(),
        ))
    }

    #[tokio::test]
    async fn health_is_public_and_reports_db_ok() {
        let state = test_state().await;
        let app = router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["db_ok"], true);
        assert_eq!(json["mqtt_connected"], false);
    }

    #[tokio::test]
    async fn tags_in_cart_then_lookup_round_trips_over_http() {
        let state = test_state().await;
        let app = router(state);

        let body = serde_json::json!({
            "order_id": "O1",
            "qr_codes": ["ABC1234"],
        });
        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/tags/in-cart")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/v1/tags/lookup?qr_code=ABC1234")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["present"], true);
        assert_eq!(json["state"], "IN_CART");
    }

    #[tokio::test]
    async fn tags_lookup_rejects_neither_param() {
        let state = test_state().await;
        let app = router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/v1/tags/lookup")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn calibration_fails_503_when_disconnected() {
        let state = test_state().await;
        let app = router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/calibration/start")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn config_get_masks_secrets() {
        let state = test_state().await;
        state.config.write().mqtt.password = "hunter2".to_string();
        let app = router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/v1/config")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["config"]["mqtt"]["password"], "***");
    }
}
