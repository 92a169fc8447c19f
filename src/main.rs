// =============================================================================
// Edge Gate Core — Main Entry Point
// =============================================================================
//
// Composition root: loads config, opens the SQLite-backed store and audit
// log, wires the decision engine and event bus to the MQTT reader gateway,
// and serves the HTTP/WS control plane. Every long-running subsystem is its
// own task; a failure in one (a bad MQTT frame, a slow HTTP client) must
// never take the others down with it.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod audit;
mod codec;
mod config;
mod decision;
mod errors;
mod events;
mod gateway;
mod janitor;
mod logging;
mod store;
mod types;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::audit::AuditLog;
use crate::config::EdgeConfig;
use crate::decision::DecisionEngine;
use crate::events::{Event, EventBus};
use crate::gateway::{Inbound, ReaderGateway};
use crate::store::StateStore;

const CONFIG_PATH: &str = "config.json";
const LOG_PATH: &str = "logs/edge-gate.log";
const STATUS_BROADCAST_INTERVAL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    logging::init(LOG_PATH);

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Edge Gate Core — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = EdgeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EdgeConfig::default()
    });

    info!(
        client_id = %config.gate.client_id,
        http_addr = %format!("{}:{}", config.http.host, config.http.port),
        mqtt_host = %config.mqtt.host,
        "configuration loaded"
    );

    // ── 2. Open persistent storage ────────────────────────────────────────
    let store = Arc::new(StateStore::open(&config.storage.sqlite_path).await?);
    let audit = Arc::new(AuditLog::open(&config.storage.sqlite_path).await?);

    // ── 3. Build decision engine, event bus, reader gateway ──────────────
    let engine = Arc::new(DecisionEngine::with_system_clock());
    let bus = Arc::new(EventBus::new());
    let (gateway, eventloop) = ReaderGateway::new(&config.mqtt, &config.gate);
    let gateway = Arc::new(gateway);

    let config = Arc::new(RwLock::new(config));

    // ── 4. Compose shared application state ──────────────────────────────
    let state = Arc::new(AppState::new(
        config.clone(),
        CONFIG_PATH.to_string(),
        store.clone(),
        audit,
        engine.clone(),
        bus.clone(),
        gateway.clone(),
        LOG_PATH.to_string(),
    ));

    // ── 5. Drive the reader gateway's MQTT event loop ────────────────────
    let gw_state = state.clone();
    let gw = gateway.clone();
    tokio::spawn(async move {
        gw.run(eventloop, move |inbound| {
            let state = gw_state.clone();
            async move {
                match inbound {
                    Inbound::Detection(detections, gate_id) => {
                        state.process_detections(detections, gate_id).await;
                    }
                    Inbound::CommandResponse(payload) => {
                        state.handle_command_response(payload);
                    }
                    Inbound::ReaderStatus(payload) => {
                        state.handle_reader_status(payload);
                    }
                }
            }
        })
        .await;
    });

    // ── 6. TTL janitor ─────────────────────────────────────────────────────
    tokio::spawn(janitor::run(config.clone(), store.clone(), engine.clone()));

    // ── 7. Periodic status broadcast (only when someone is listening) ───
    let status_bus = bus.clone();
    let status_store = store.clone();
    let status_gateway = gateway.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(STATUS_BROADCAST_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if status_bus.subscriber_count() == 0 {
                continue;
            }
            let now = chrono::Utc::now().timestamp();
            match status_store.counts(now).await {
                Ok(counts) => {
                    status_bus.broadcast(Event::StatusUpdate {
                        mqtt_connected: status_gateway.is_connected(),
                        in_cart_count: counts.in_cart_count,
                        paid_count: counts.paid_count,
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to read tag counts for status broadcast");
                }
            }
        }
    });

    // ── 8. HTTP/WS control plane ──────────────────────────────────────────
    let bind_addr = {
        let config = state.config.read();
        format!("{}:{}", config.http.host, config.http.port)
    };

    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "HTTP/WS control plane listening");

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ───────────────────────────────────────────────
    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server exited unexpectedly");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            warn!("shutdown signal received — stopping gracefully");
        }
    }

    state.save_config();
    info!("edge gate core shut down complete.");
    Ok(())
}
