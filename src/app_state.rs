// =============================================================================
// Central Application State — Edge Gate Core
// =============================================================================
//
// The single source of truth shared across every async task: the HTTP
// handlers, the reader gateway's inbound-event callback, and the janitor all
// hold an `Arc<AppState>`. Each subsystem owns its own interior mutability
// (the store and audit log pool their own connections, the decision engine
// locks its own tables); `AppState` itself only adds the config handle and
// the start time needed for uptime reporting.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::audit::{AuditLog, NewAlarmEvent};
use crate::codec;
use crate::config::EdgeConfig;
use crate::decision::DecisionEngine;
use crate::errors::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::gateway::{ParsedDetection, ReaderGateway};
use crate::store::StateStore;

/// Everything a POS-facing tag lookup needs to answer the caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TagStatus {
    pub qr_code: String,
    pub epc: Option<String>,
    pub present: bool,
    pub state: Option<String>,
    pub order_id: Option<String>,
    pub pos_id: Option<String>,
    pub ttl_remaining_seconds: Option<i64>,
}

pub struct AppState {
    pub config: Arc<RwLock<EdgeConfig>>,
    pub config_path: String,
    pub store: Arc<StateStore>,
    pub audit: Arc<AuditLog>,
    pub engine: Arc<DecisionEngine>,
    pub bus: Arc<EventBus>,
    pub gateway: Arc<ReaderGateway>,
    pub log_path: String,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: Arc<RwLock<EdgeConfig>>,
        config_path: String,
        store: Arc<StateStore>,
        audit: Arc<AuditLog>,
        engine: Arc<DecisionEngine>,
        bus: Arc<EventBus>,
        gateway: Arc<ReaderGateway>,
        log_path: String,
    ) -> Self {
        Self {
            config,
            config_path,
            store,
            audit,
            engine,
            bus,
            gateway,
            log_path,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        self.start_time.elapsed().as_secs() as i64
    }

    // ── Detection pipeline ───────────────────────────────────────────────

    /// Process every detection carried by one inbound tag-stream message.
    pub async fn process_detections(&self, detections: Vec<ParsedDetection>, gate_id: String) {
        for detection in detections {
            self.process_one_detection(&detection, &gate_id).await;
        }
    }

    async fn process_one_detection(&self, detection: &ParsedDetection, gate_id: &str) {
        let (debounce_ms, cooldown_ms, pass_when_in_cart) = {
            let config = self.config.read();
            (
                config.decision.debounce_ms,
                config.decision.alarm_cooldown_ms,
                config.decision.pass_when_in_cart,
            )
        };

        // A detection still inside its debounce window can never change the
        // outcome `decide` below will reach, so skip the decode and the store
        // round-trip entirely — debounce is keyed pre-decode precisely to
        // keep the cost of duplicate reads minimal.
        let row = if self.engine.would_debounce(&detection.epc, debounce_ms) {
            None
        } else {
            let qr = codec::decode(&detection.epc);
            if qr.is_empty() {
                None
            } else {
                let now = Utc::now().timestamp();
                match self.store.get(&qr, now).await {
                    Ok(row) => row,
                    Err(e) => {
                        error!(error = %e, "store lookup failed during detection processing");
                        None
                    }
                }
            }
        };

        let outcome = self.engine.decide(
            &detection.epc,
            debounce_ms,
            cooldown_ms,
            pass_when_in_cart,
            row.as_ref(),
        );

        if matches!(outcome.reason, "debounced" | "alarm_cooldown") {
            return;
        }

        let tag_id = if outcome.qr.is_empty() {
            detection.epc.clone()
        } else {
            outcome.qr.clone()
        };

        self.bus.broadcast(Event::TagDetected {
            tag_id: tag_id.clone(),
            rssi: detection.rssi,
            antenna: detection.antenna,
            decision: outcome.decision,
            timestamp: Utc::now(),
        });

        if outcome.should_act {
            let qr_code = if outcome.qr.is_empty() { None } else { Some(outcome.qr.as_str()) };
            if let Err(e) = self
                .audit
                .append(NewAlarmEvent {
                    gate_id,
                    epc: &detection.epc,
                    qr_code,
                    rssi: detection.rssi,
                    antenna: detection.antenna,
                })
                .await
            {
                error!(error = %e, "failed to append alarm event");
            }

            self.gateway.trigger_alarm(None).await;

            self.bus.broadcast(Event::AlarmTriggered {
                tag_id,
                gate_id: gate_id.to_string(),
                rssi: detection.rssi,
                timestamp: Utc::now(),
            });
        }
    }

    // ── Inbound broker replies ───────────────────────────────────────────

    /// A message on `data/response`. A reply to an `rfid status` query is
    /// reinterpreted and broadcast as `READER_STATUS` instead of
    /// `COMMAND_RESPONSE` — everything else passes through unchanged.
    pub fn handle_command_response(&self, payload: Value) {
        let command = payload.get("command").and_then(|v| v.as_str());
        let action = payload.get("action").and_then(|v| v.as_str());

        if command == Some("rfid") && action == Some("status") {
            let system = payload.get("system").cloned();
            let status = payload.get("status").and_then(|v| v.as_str());
            let uptime = system.as_ref().and_then(|s| s.get("uptime")).and_then(|v| v.as_i64());
            let memory = system.as_ref().and_then(|s| s.get("free_heap")).and_then(|v| v.as_i64());

            self.bus.broadcast(Event::ReaderStatus {
                status: Some(if status == Some("success") { "online".to_string() } else { "offline".to_string() }),
                uptime,
                memory,
                antennas: None,
                network: payload.get("network").cloned(),
                system,
                timestamp: Utc::now(),
            });
            return;
        }

        self.bus.broadcast(Event::CommandResponse {
            command: command.map(String::from),
            action: action.map(String::from),
            status: payload.get("status").and_then(|v| v.as_str()).map(String::from),
            message: payload.get("message").and_then(|v| v.as_str()).map(String::from),
            data: payload
                .get("data")
                .or_else(|| payload.get("power"))
                .or_else(|| payload.get("gpo"))
                .cloned(),
            timestamp: Utc::now(),
        });
    }

    /// A message on `data/status` — always a direct `READER_STATUS`.
    pub fn handle_reader_status(&self, payload: Value) {
        self.bus.broadcast(Event::ReaderStatus {
            status: payload.get("status").and_then(|v| v.as_str()).map(String::from),
            uptime: payload.get("uptime").and_then(|v| v.as_i64()),
            memory: payload.get("memory").and_then(|v| v.as_i64()),
            antennas: payload.get("antennas").cloned(),
            network: payload.get("network").cloned(),
            system: payload.get("system").cloned(),
            timestamp: Utc::now(),
        });
    }

    // ── Control Plane (§4.7) ─────────────────────────────────────────────

    pub async fn register_in_cart(
        &self,
        qr_codes: &[String],
        order_id: &str,
        pos_id: &str,
        store_id: &str,
        ttl_seconds: Option<i64>,
    ) -> CoreResult<(i64, i64, i64)> {
        if qr_codes.is_empty() {
            return Err(CoreError::Validation("qr_codes must not be empty".to_string()));
        }
        let ttl = ttl_seconds.unwrap_or_else(|| self.config.read().ttl.in_cart_seconds);
        if !(60..=86400).contains(&ttl) {
            return Err(CoreError::Validation(
                "ttl_seconds must be between 60 and 86400".to_string(),
            ));
        }

        let (upserted, ignored_paid) = self
            .store
            .upsert_in_cart(qr_codes, order_id, pos_id, store_id, ttl)
            .await?;
        Ok((upserted, ignored_paid, ttl))
    }

    pub async fn register_paid(
        &self,
        qr_codes: &[String],
        order_id: &str,
        pos_id: &str,
        store_id: &str,
        ttl_seconds: Option<i64>,
    ) -> CoreResult<(i64, i64)> {
        if qr_codes.is_empty() {
            return Err(CoreError::Validation("qr_codes must not be empty".to_string()));
        }
        let ttl = ttl_seconds.unwrap_or_else(|| self.config.read().ttl.paid_seconds);
        if !(60..=604_800).contains(&ttl) {
            return Err(CoreError::Validation(
                "ttl_seconds must be between 60 and 604800".to_string(),
            ));
        }

        let upserted = self
            .store
            .upsert_paid(qr_codes, order_id, pos_id, store_id, ttl)
            .await?;
        Ok((upserted, ttl))
    }

    pub async fn remove_tags(&self, qr_codes: &[String], order_id: &str) -> CoreResult<i64> {
        if qr_codes.is_empty() {
            return Err(CoreError::Validation("qr_codes must not be empty".to_string()));
        }
        let order_id = if order_id.is_empty() { None } else { Some(order_id) };
        Ok(self.store.remove(qr_codes, order_id).await?)
    }

    /// Look up by `qr_code` or `epc` — exactly one must be supplied.
    pub async fn lookup(&self, qr_code: Option<&str>, epc: Option<&str>) -> CoreResult<TagStatus> {
        let (qr, epc) = match (qr_code, epc) {
            (Some(qr), None) if !qr.is_empty() => (qr.to_string(), None),
            (None, Some(epc)) if !epc.is_empty() => (codec::decode(epc), Some(epc.to_string())),
            _ => {
                return Err(CoreError::Validation(
                    "exactly one of qr_code or epc must be supplied".to_string(),
                ))
            }
        };

        let now = Utc::now().timestamp();
        let row = self.store.get(&qr, now).await?;

        Ok(match row {
            Some(row) => TagStatus {
                qr_code: row.qr_code,
                epc,
                present: true,
                state: Some(row.state.to_string()),
                order_id: row.order_id,
                pos_id: row.pos_id,
                ttl_remaining_seconds: Some((row.expires_at - now).max(0)),
            },
            None => TagStatus {
                qr_code: qr,
                epc,
                present: false,
                state: None,
                order_id: None,
                pos_id: None,
                ttl_remaining_seconds: None,
            },
        })
    }

    fn require_connected(&self) -> CoreResult<()> {
        if self.gateway.is_connected() {
            Ok(())
        } else {
            Err(CoreError::TransportUnavailable)
        }
    }

    pub async fn trigger_test_pulse(&self) -> CoreResult<()> {
        self.require_connected()?;
        self.gateway.trigger_alarm(None).await;
        Ok(())
    }

    pub async fn set_power(&self, a1: i64, a2: i64, a3: i64, a4: i64) -> CoreResult<()> {
        self.require_connected()?;
        for (name, value) in [("antenna1", a1), ("antenna2", a2), ("antenna3", a3), ("antenna4", a4)] {
            if !(0..=30).contains(&value) {
                return Err(CoreError::Validation(format!("{name} must be between 0 and 30")));
            }
        }
        self.gateway.set_antenna_power(a1, a2, a3, a4).await;
        Ok(())
    }

    pub async fn get_power(&self) -> CoreResult<()> {
        self.require_connected()?;
        self.gateway.get_antenna_power().await;
        Ok(())
    }

    pub async fn get_reader_status(&self) -> CoreResult<()> {
        self.require_connected()?;
        self.gateway.get_reader_status().await;
        Ok(())
    }

    pub async fn start_inventory(&self) -> CoreResult<()> {
        self.require_connected()?;
        self.gateway.send_rfid_command("start").await;
        Ok(())
    }

    pub async fn stop_inventory(&self) -> CoreResult<()> {
        self.require_connected()?;
        self.gateway.send_rfid_command("stop").await;
        Ok(())
    }

    // ── Config ────────────────────────────────────────────────────────────

    pub fn reload_config(&self) -> CoreResult<()> {
        let reloaded = EdgeConfig::load(&self.config_path)
            .map_err(|e| CoreError::Config(e.to_string()))?;
        *self.config.write() = reloaded;
        info!(path = %self.config_path, "config reloaded from disk");
        Ok(())
    }

    pub fn save_config(&self) {
        let snapshot = self.config.read().clone();
        if let Err(e) = snapshot.save(&self.config_path) {
            warn!(error = %e, "failed to persist config");
        }
    }
}
