//! Layered configuration for the broker, the clients and logging.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If `~/.chatroom/settings.json` exists, deep-merge it over the defaults
//! 3. Apply `CHATROOM_*` environment overrides (highest priority)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur when loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid settings JSON.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything loaded from the settings file and environment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Broker listening and announcing.
    pub broker: BrokerSettings,
    /// Client timeouts and worker pool.
    pub client: ClientSettings,
    /// Log level and format.
    pub logging: LoggingSettings,
}

/// Where the broker listens and what it announces.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Logical service name published to discovery.
    pub name: String,
    /// Interface to bind.
    pub host: String,
    /// Port to bind, 0 for any.
    pub port: u16,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            name: "chatroom".to_string(),
            host: "127.0.0.1".to_string(),
            port: 5037,
            max_send_queue: 1024,
        }
    }
}

/// Client-side timeouts and RPC worker pool sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Logical service name to resolve.
    pub broker_name: String,
    /// How long to wait for the broker's ack.
    pub emit_timeout_ms: u64,
    /// How long to wait for an RPC reply.
    pub rpc_timeout_ms: u64,
    /// How long to wait for the broker to be found.
    pub discovery_timeout_ms: u64,
    /// Handlers run concurrently.
    pub rpc_workers: usize,
    /// Requests queued before the pump waits.
    pub rpc_queue: usize,
}

impl ClientSettings {
    /// Ack timeout.
    pub fn emit_timeout(&self) -> Duration {
        Duration::from_millis(self.emit_timeout_ms)
    }

    /// RPC reply timeout.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Broker lookup timeout.
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            broker_name: "chatroom".to_string(),
            emit_timeout_ms: 60_000,
            rpc_timeout_ms: 60_000,
            discovery_timeout_ms: 60_000,
            rpc_workers: 2,
            rpc_queue: 64,
        }
    }
}

/// Log filtering and output format.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level, e.g. `info`.
    pub level: String,
    /// Emit JSON lines instead of text.
    pub json: bool,
    /// Per-module overrides, e.g. `{"chatroom_broker": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            module_levels: BTreeMap::new(),
        }
    }
}

/// `~/.chatroom/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".chatroom").join("settings.json")
}

/// Load from [`settings_path`] and apply environment overrides.
pub fn load_settings() -> Result<Settings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` (defaults if missing) and apply environment overrides.
pub fn load_settings_from_path(path: &Path) -> Result<Settings, SettingsError> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive merge: objects merge per key, everything else is replaced,
/// nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CHATROOM_*` environment variables.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides_from(settings, |key| std::env::var(key).ok());
}

/// Apply overrides read through `lookup`. Invalid values are ignored.
pub fn apply_overrides_from(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |key: &str| lookup(key).filter(|v| !v.is_empty());
    let parsed = |key: &str, parse: &dyn Fn(&str) -> Option<u64>| {
        let raw = lookup(key)?;
        let value = parse(&raw);
        if value.is_none() {
            warn!(key, value = %raw, "invalid env var, ignoring");
        }
        value
    };

    if let Some(v) = string("CHATROOM_HOST") {
        settings.broker.host = v;
    }
    if let Some(v) = parsed("CHATROOM_PORT", &|s| parse_range(s, 1, 65_535)) {
        settings.broker.port = v as u16;
    }
    if let Some(v) = string("CHATROOM_BROKER_NAME") {
        settings.broker.name = v.clone();
        settings.client.broker_name = v;
    }
    if let Some(v) = parsed("CHATROOM_MAX_SEND_QUEUE", &|s| parse_range(s, 1, 1 << 20)) {
        settings.broker.max_send_queue = v as usize;
    }
    if let Some(v) = parsed("CHATROOM_EMIT_TIMEOUT_MS", &|s| parse_range(s, 1, 3_600_000)) {
        settings.client.emit_timeout_ms = v;
        settings.client.rpc_timeout_ms = v;
    }
    if let Some(v) = parsed("CHATROOM_RPC_WORKERS", &|s| parse_range(s, 1, 1024)) {
        settings.client.rpc_workers = v as usize;
    }
    if let Some(v) = parsed("CHATROOM_RPC_QUEUE", &|s| parse_range(s, 1, 1 << 20)) {
        settings.client.rpc_queue = v as usize;
    }
    if let Some(v) = parsed("CHATROOM_DISCOVERY_TIMEOUT_MS", &|s| parse_range(s, 1, 3_600_000)) {
        settings.client.discovery_timeout_ms = v;
    }
    if let Some(v) = string("CHATROOM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = parsed("CHATROOM_LOG_JSON", &|s| parse_bool(s).map(u64::from)) {
        settings.logging.json = v != 0;
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Integer within `min..=max`.
pub fn parse_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.broker.name, "chatroom");
        assert_eq!(s.broker.port, 5037);
        assert_eq!(s.broker.max_send_queue, 1024);
        assert_eq!(s.client.rpc_workers, 2);
        assert_eq!(s.client.rpc_queue, 64);
        assert_eq!(s.client.emit_timeout(), Duration::from_secs(60));
        assert_eq!(s.logging.level, "info");
    }

    #[test]
    fn merge_nested_override_keeps_siblings() {
        let merged = deep_merge(
            json!({"broker": {"port": 1, "host": "h"}}),
            json!({"broker": {"port": 2}}),
        );
        assert_eq!(merged["broker"]["port"], 2);
        assert_eq!(merged["broker"]["host"], "h");
    }

    #[test]
    fn merge_null_and_arrays() {
        let merged = deep_merge(json!({"a": 1, "b": [1, 2]}), json!({"a": null, "b": [3]}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], json!([3]));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let s = load_settings_from_path(Path::new("/nonexistent/chatroom.json")).unwrap();
        assert_eq!(s.client.broker_name, Settings::default().client.broker_name);
    }

    #[test]
    fn load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"broker": {"port": 6000}, "client": {"rpcWorkers": 8}}"#).unwrap();

        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.broker.port, 6000);
        assert_eq!(s.broker.host, "127.0.0.1");
        assert_eq!(s.client.rpc_workers, 8);
        assert_eq!(s.client.rpc_queue, 64);
    }

    #[test]
    fn load_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = Settings::default();
        apply_overrides_from(
            &mut s,
            env(&[
                ("CHATROOM_PORT", "7000"),
                ("CHATROOM_BROKER_NAME", "lab"),
                ("CHATROOM_RPC_WORKERS", "4"),
                ("CHATROOM_EMIT_TIMEOUT_MS", "1500"),
                ("CHATROOM_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(s.broker.port, 7000);
        assert_eq!(s.broker.name, "lab");
        assert_eq!(s.client.broker_name, "lab");
        assert_eq!(s.client.rpc_workers, 4);
        assert_eq!(s.client.emit_timeout_ms, 1500);
        assert!(s.logging.json);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut s = Settings::default();
        apply_overrides_from(
            &mut s,
            env(&[
                ("CHATROOM_PORT", "99999"),
                ("CHATROOM_RPC_WORKERS", "zero"),
                ("CHATROOM_LOG_JSON", "maybe"),
                ("CHATROOM_HOST", ""),
            ]),
        );
        assert_eq!(s.broker.port, 5037);
        assert_eq!(s.client.rpc_workers, 2);
        assert!(!s.logging.json);
        assert_eq!(s.broker.host, "127.0.0.1");
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_range("10", 1, 10), Some(10));
        assert_eq!(parse_range("0", 1, 10), None);
        assert_eq!(parse_range("-1", 0, 10), None);
    }
}
