// =============================================================================
// Configuration — hot-reloadable edge gate settings with atomic save
// =============================================================================
//
// Every tunable used by the core lives here so the gate can be reconfigured
// without a restart. Every field carries a serde default so that an older
// on-disk file missing newer fields still loads; persistence uses an atomic
// tmp + rename so a crash mid-write never leaves a half-written file where
// the loader expects a complete one.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8088
}
fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "mqttx_1e40cea4".to_string()
}
fn default_topic_tag_stream() -> String {
    "reader/{client_id}/stream/tag".to_string()
}
fn default_topic_gpo_cmd() -> String {
    "reader/{client_id}/cmd/gpo".to_string()
}
fn default_topic_rfid_cmd() -> String {
    "reader/{client_id}/cmd/rfid".to_string()
}
fn default_topic_power_cmd() -> String {
    "reader/{client_id}/cmd/power".to_string()
}
fn default_topic_data_response() -> String {
    "reader/{client_id}/data/response".to_string()
}
fn default_topic_data_status() -> String {
    "reader/{client_id}/data/status".to_string()
}
fn default_gpo_pulse_seconds() -> u64 {
    5
}
fn default_in_cart_seconds() -> i64 {
    3600
}
fn default_paid_seconds() -> i64 {
    86400
}
fn default_cleanup_interval_seconds() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_debounce_ms() -> i64 {
    2500
}
fn default_cooldown_ms() -> i64 {
    7000
}
fn default_sqlite_path() -> String {
    "data/edge.db".to_string()
}

/// HTTP/WS surface bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

/// Broker connection parameters.
#[derive(Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub use_tls: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: String::new(),
            password: String::new(),
            use_tls: false,
        }
    }
}

// Manual Debug: never print the broker password in logs or panics.
impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// Reader/gate topic templates and identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_tag_stream")]
    pub topic_tag_stream: String,
    #[serde(default = "default_topic_gpo_cmd")]
    pub topic_gpo_cmd: String,
    #[serde(default = "default_topic_rfid_cmd")]
    pub topic_rfid_cmd: String,
    #[serde(default = "default_topic_power_cmd")]
    pub topic_power_cmd: String,
    #[serde(default = "default_topic_data_response")]
    pub topic_data_response: String,
    #[serde(default = "default_topic_data_status")]
    pub topic_data_status: String,
    #[serde(default = "default_gpo_pulse_seconds")]
    pub gpo_pulse_seconds: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            topic_tag_stream: default_topic_tag_stream(),
            topic_gpo_cmd: default_topic_gpo_cmd(),
            topic_rfid_cmd: default_topic_rfid_cmd(),
            topic_power_cmd: default_topic_power_cmd(),
            topic_data_response: default_topic_data_response(),
            topic_data_status: default_topic_data_status(),
            gpo_pulse_seconds: default_gpo_pulse_seconds(),
        }
    }
}

impl GateConfig {
    /// Substitute `{client_id}` into a topic template.
    pub fn topic(&self, template: &str) -> String {
        template.replace("{client_id}", &self.client_id)
    }
}

/// Default TTLs applied to store writes and the janitor's cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    #[serde(default = "default_in_cart_seconds")]
    pub in_cart_seconds: i64,
    #[serde(default = "default_paid_seconds")]
    pub paid_seconds: i64,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            in_cart_seconds: default_in_cart_seconds(),
            paid_seconds: default_paid_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

/// Decision engine policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    #[serde(default = "default_true")]
    pub pass_when_in_cart: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: i64,
    #[serde(default = "default_cooldown_ms")]
    pub alarm_cooldown_ms: i64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            pass_when_in_cart: true,
            debounce_ms: default_debounce_ms(),
            alarm_cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Persistent state store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

/// Control-plane bearer token auth.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("enabled", &self.enabled)
            .field("token", &"***")
            .finish()
    }
}

/// Top-level, hot-reloadable edge gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            mqtt: MqttConfig::default(),
            gate: GateConfig::default(),
            ttl: TtlConfig::default(),
            decision: DecisionConfig::default(),
            storage: StorageConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl EdgeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist or fails to parse, returns an error so the
    /// caller can fall back to defaults with a warning rather than fail hard.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), client_id = %config.gate.client_id, "config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to a sibling `.tmp` file, then rename over the target).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Render a copy of this config with secrets masked, for display over the
    /// HTTP surface.
    pub fn masked(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            if let Some(mqtt) = obj.get_mut("mqtt").and_then(|v| v.as_object_mut()) {
                if !self.mqtt.password.is_empty() {
                    mqtt.insert("password".to_string(), serde_json::json!("***"));
                }
            }
            if let Some(auth) = obj.get_mut("auth").and_then(|v| v.as_object_mut()) {
                if !self.auth.token.is_empty() {
                    auth.insert("token".to_string(), serde_json::json!("***"));
                }
            }
        }
        value
    }

    /// Merge a partial update (only the named top-level sections supplied)
    /// onto this config and re-validate the merged whole. On success returns
    /// the new config; on failure the caller's held config is left untouched
    /// because nothing here has been mutated in place.
    pub fn merge(&self, update: &ConfigUpdate) -> Result<Self> {
        let mut value = serde_json::to_value(self).context("failed to serialise base config")?;
        let obj = value
            .as_object_mut()
            .context("base config did not serialise to a JSON object")?;

        if let Some(section) = &update.mqtt {
            merge_section(obj, "mqtt", section);
        }
        if let Some(section) = &update.gate {
            merge_section(obj, "gate", section);
        }
        if let Some(section) = &update.ttl {
            merge_section(obj, "ttl", section);
        }
        if let Some(section) = &update.decision {
            merge_section(obj, "decision", section);
        }

        serde_json::from_value(value).context("merged configuration failed validation")
    }
}

fn merge_section(
    obj: &mut serde_json::Map<String, serde_json::Value>,
    key: &str,
    patch: &serde_json::Value,
) {
    let existing = obj
        .entry(key.to_string())
        .or_insert_with(|| serde_json::json!({}));
    if let (Some(existing_obj), Some(patch_obj)) = (existing.as_object_mut(), patch.as_object()) {
        for (k, v) in patch_obj {
            existing_obj.insert(k.clone(), v.clone());
        }
    }
}

/// A partial configuration update accepted by `PUT /v1/config`. Each section
/// is an opaque JSON object merged onto the currently-held config before
/// re-validating the whole document.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub mqtt: Option<serde_json::Value>,
    #[serde(default)]
    pub gate: Option<serde_json::Value>,
    #[serde(default)]
    pub ttl: Option<serde_json::Value>,
    #[serde(default)]
    pub decision: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EdgeConfig::default();
        assert_eq!(cfg.http.port, 8088);
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.ttl.in_cart_seconds, 3600);
        assert_eq!(cfg.ttl.paid_seconds, 86400);
        assert!(cfg.decision.pass_when_in_cart);
        assert_eq!(cfg.decision.debounce_ms, 2500);
        assert_eq!(cfg.decision.alarm_cooldown_ms, 7000);
        assert!(!cfg.auth.enabled);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EdgeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.gate.client_id, "mqttx_1e40cea4");
        assert_eq!(cfg.storage.sqlite_path, "data/edge.db");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "decision": { "pass_when_in_cart": false } }"#;
        let cfg: EdgeConfig = serde_json::from_str(json).unwrap();
        assert!(!cfg.decision.pass_when_in_cart);
        assert_eq!(cfg.decision.debounce_ms, 2500);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EdgeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EdgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.gate.client_id, cfg2.gate.client_id);
        assert_eq!(cfg.ttl.in_cart_seconds, cfg2.ttl.in_cart_seconds);
    }

    #[test]
    fn merge_overlays_only_named_sections() {
        let base = EdgeConfig::default();
        let update = ConfigUpdate {
            decision: Some(serde_json::json!({ "debounce_ms": 1000 })),
            ..Default::default()
        };
        let merged = base.merge(&update).unwrap();
        assert_eq!(merged.decision.debounce_ms, 1000);
        assert!(merged.decision.pass_when_in_cart);
        assert_eq!(merged.gate.client_id, base.gate.client_id);
    }

    #[test]
    fn merge_rejects_invalid_result_without_mutating_caller() {
        let base = EdgeConfig::default();
        let update = ConfigUpdate {
            ttl: Some(serde_json::json!({ "in_cart_seconds": "not-a-number" })),
            ..Default::default()
        };
        assert!(base.merge(&update).is_err());
        // `base` itself is untouched — merge never mutates in place.
        assert_eq!(base.ttl.in_cart_seconds, 3600);
    }

    #[test]
    fn masked_config_hides_secrets_when_present() {
        let mut cfg = EdgeConfig::default();
        cfg.mqtt.password = "hunter2".to_string();
        cfg.auth.token = "secret-token".to_string();
        let masked = cfg.masked();
        assert_eq!(masked["mqtt"]["password"], "***");
        assert_eq!(masked["auth"]["token"], "***");
    }
}
