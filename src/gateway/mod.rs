// =============================================================================
// Reader Gateway — MQTT client for gate reader communication
// =============================================================================
//
// Wraps an `rumqttc::AsyncClient`/`EventLoop` pair. The event loop owns the
// actual socket and runs its own reconnect machinery internally (rumqttc
// reconnects on `poll()` error automatically), but we still wrap the poll
// call in a loop with manual exponential backoff so a broker that's
// unreachable at startup doesn't spin the task hot.
//
// Detection parsing lives here rather than in the decision engine so the
// engine stays free of wire-format knowledge.
// =============================================================================

mod detection;

pub use detection::ParsedDetection;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{GateConfig, MqttConfig};

const MAX_BACKOFF_SECS: u64 = 60;

/// Outbound command topics, resolved once at construction.
struct Topics {
    tag_stream: String,
    data_response: String,
    data_status: String,
    rfid_cmd: String,
    power_cmd: String,
    gpo_cmd: String,
}

impl Topics {
    fn resolve(gate: &GateConfig) -> Self {
        Self {
            tag_stream: gate.topic(&gate.topic_tag_stream),
            data_response: gate.topic(&gate.topic_data_response),
            data_status: gate.topic(&gate.topic_data_status),
            rfid_cmd: gate.topic(&gate.topic_rfid_cmd),
            power_cmd: gate.topic(&gate.topic_power_cmd),
            gpo_cmd: gate.topic(&gate.topic_gpo_cmd),
        }
    }
}

/// What an inbound message on one of the three subscribed topics becomes.
pub enum Inbound {
    Detection(Vec<ParsedDetection>, String),
    CommandResponse(Value),
    ReaderStatus(Value),
}

pub struct ReaderGateway {
    client: AsyncClient,
    topics: Topics,
    gpo_pulse_seconds: u64,
    connected: AtomicBool,
    last_tag_seen_ms: AtomicI64,
}

impl ReaderGateway {
    /// Build the client and its event loop. The event loop must be driven by
    /// `run` in its own task; nothing is sent on the wire until then.
    pub fn new(mqtt: &MqttConfig, gate: &GateConfig) -> (Self, rumqttc::EventLoop) {
        let mut options = MqttOptions::new(&gate.client_id, &mqtt.host, mqtt.port);
        options.set_keep_alive(Duration::from_secs(30));
        if !mqtt.username.is_empty() {
            options.set_credentials(mqtt.username.clone(), mqtt.password.clone());
        }
        if mqtt.use_tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);

        let gateway = Self {
            client,
            topics: Topics::resolve(gate),
            gpo_pulse_seconds: gate.gpo_pulse_seconds,
            connected: AtomicBool::new(false),
            last_tag_seen_ms: AtomicI64::new(0),
        };
        (gateway, eventloop)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Seconds since the last detection was received, if any yet.
    pub fn last_tag_seen_seconds(&self) -> Option<i64> {
        let last = self.last_tag_seen_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        Some((chrono::Utc::now().timestamp_millis() - last) / 1000)
    }

    async fn subscribe_all(&self) {
        for topic in [
            &self.topics.tag_stream,
            &self.topics.data_response,
            &self.topics.data_status,
        ] {
            if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
                error!(topic = %topic, error = %e, "subscribe failed");
            } else {
                info!(topic = %topic, "subscribed");
            }
        }
    }

    /// Drive the event loop forever, reconnecting with capped exponential
    /// backoff on error. Dispatches parsed inbound events to `on_event`.
    pub async fn run<F, Fut>(&self, mut eventloop: rumqttc::EventLoop, on_event: F)
    where
        F: Fn(Inbound) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut backoff = 1u64;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(?ack, "mqtt connected");
                    self.connected.store(true, Ordering::Relaxed);
                    backoff = 1;
                    self.subscribe_all().await;
                    self.auto_start_scan();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_publish(&publish.topic, &publish.payload, &on_event)
                        .await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt broker sent disconnect");
                    self.connected.store(false, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(e) => {
                    self.connected.store(false, Ordering::Relaxed);
                    warn!(error = %e, backoff_secs = backoff, "mqtt connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
    }

    async fn handle_publish<F, Fut>(&self, topic: &str, payload: &[u8], on_event: &F)
    where
        F: Fn(Inbound) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let parsed: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(topic = %topic, error = %e, "invalid JSON on mqtt message, dropping");
                return;
            }
        };

        debug!(topic = %topic, "mqtt message received");

        if topic == self.topics.tag_stream {
            self.last_tag_seen_ms
                .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
            let gate_id = detection::extract_gate_id(&parsed)
                .unwrap_or_else(|| self.client_id_fallback());
            let detections = detection::parse(&parsed);
            if detections.is_empty() {
                warn!("tag detection message carried no usable EPC, dropping");
                return;
            }
            on_event(Inbound::Detection(detections, gate_id)).await;
        } else if topic == self.topics.data_response {
            on_event(Inbound::CommandResponse(parsed)).await;
        } else if topic == self.topics.data_status {
            on_event(Inbound::ReaderStatus(parsed)).await;
        }
    }

    fn client_id_fallback(&self) -> String {
        // Topics are already resolved with the configured client_id; reuse
        // the tag-stream topic's embedded segment as a last resort label.
        self.topics
            .tag_stream
            .split('/')
            .nth(1)
            .unwrap_or("unknown")
            .to_string()
    }

    fn auto_start_scan(&self) {
        let client = self.client.clone();
        let topic = self.topics.rfid_cmd.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let payload = serde_json::json!({ "action": "start" }).to_string();
            if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                warn!(error = %e, "auto-start scan publish failed");
            } else {
                info!("auto-start inventory scan sent");
            }
        });
    }

    async fn publish(&self, topic: &str, payload: Value) {
        if !self.is_connected() {
            warn!(topic = %topic, "mqtt not connected, dropping publish");
            return;
        }
        let body = payload.to_string();
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .await
        {
            warn!(topic = %topic, error = %e, "publish failed");
        }
    }

    pub async fn send_rfid_command(&self, action: &str) {
        self.publish(&self.topics.rfid_cmd.clone(), serde_json::json!({ "action": action }))
            .await;
    }

    pub async fn set_antenna_power(&self, ant1: i64, ant2: i64, ant3: i64, ant4: i64) {
        self.publish(
            &self.topics.power_cmd.clone(),
            serde_json::json!({ "action": "set", "ant1": ant1, "ant2": ant2, "ant3": ant3, "ant4": ant4 }),
        )
        .await;
    }

    pub async fn get_antenna_power(&self) {
        self.publish(&self.topics.power_cmd.clone(), serde_json::json!({ "action": "get" }))
            .await;
    }

    pub async fn get_reader_status(&self) {
        self.publish(&self.topics.rfid_cmd.clone(), serde_json::json!({ "action": "status" }))
            .await;
    }

    pub async fn trigger_alarm(&self, duration_seconds: Option<u64>) {
        let duration = duration_seconds.unwrap_or(self.gpo_pulse_seconds);
        self.publish(
            &self.topics.gpo_cmd.clone(),
            serde_json::json!({ "action": "pulse", "gpo3": 1, "duration": duration }),
        )
        .await;
    }
}
