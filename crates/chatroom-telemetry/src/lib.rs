//! # chatroom-telemetry
//!
//! `tracing` setup shared by the broker and client binaries: an env-filtered
//! fmt layer (plain or JSON), runtime-adjustable module levels, and an
//! in-memory buffer of recent warnings.

#![deny(unsafe_code)]

mod recent;

pub use recent::{RecentLog, RecentLogLayer, WarnRecord};

use std::sync::Arc;

use chatroom_core::settings::LoggingSettings;
use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Errors raised while installing or reconfiguring logging.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A level or module directive did not parse.
    #[error("invalid filter directive: {0}")]
    Filter(String),
    /// Logging was already set up in this process.
    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default level. `RUST_LOG` takes precedence when set.
    pub log_level: Level,
    /// Per-module overrides (e.g. `chatroom_broker` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of text.
    pub json: bool,
    /// How many warn+ records to keep in memory. Zero disables the buffer.
    pub recent_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            recent_capacity: 256,
        }
    }
}

impl TelemetryConfig {
    /// Build from the `logging` section of the settings file.
    /// Unparseable levels fall back to the default.
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        let log_level = settings.level.parse().unwrap_or(Level::INFO);
        let module_levels = settings
            .module_levels
            .iter()
            .filter_map(|(module, level)| Some((module.clone(), level.parse().ok()?)))
            .collect();
        Self {
            log_level,
            module_levels,
            json: settings.json,
            ..Self::default()
        }
    }

    /// `info,chatroom_broker=debug` style directive string.
    pub fn filter_directives(&self) -> String {
        directives(self.log_level, &self.module_levels)
    }
}

fn directives(level: Level, modules: &[(String, Level)]) -> String {
    let mut out = level.to_string().to_lowercase();
    for (module, level) in modules {
        out.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    out
}

/// Handle returned by [`init_telemetry`]. Keep it alive for the process.
pub struct TelemetryGuard {
    base_level: Level,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
    reload: reload::Handle<EnvFilter, Registry>,
    recent: Option<RecentLog>,
}

impl TelemetryGuard {
    /// Change the level for one module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let directives = {
            let mut levels = self.module_levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            directives(self.base_level, &levels)
        };
        let filter =
            EnvFilter::try_new(&directives).map_err(|e| TelemetryError::Filter(e.to_string()))?;
        self.reload
            .reload(filter)
            .map_err(|e| TelemetryError::Filter(e.to_string()))
    }

    /// Current per-module overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// Recent warn+ records, if the buffer is enabled.
    pub fn recent(&self) -> Option<&RecentLog> {
        self.recent.as_ref()
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.filter_directives())
            .map_err(|e| TelemetryError::Filter(e.to_string()))?,
    };
    let (filter_layer, reload) = reload::Layer::new(env_filter);

    let (json_layer, plain_layer) = if config.json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true);
        (Some(layer), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true)))
    };

    let recent = (config.recent_capacity > 0).then(|| RecentLog::new(config.recent_capacity));
    let recent_layer = recent.clone().map(RecentLogLayer::new);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(plain_layer)
        .with(recent_layer)
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)?;

    Ok(TelemetryGuard {
        base_level: config.log_level,
        module_levels: Arc::new(RwLock::new(config.module_levels)),
        reload,
        recent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("chatroom_broker".into(), Level::DEBUG)],
            ..TelemetryConfig::default()
        };
        assert_eq!(config.filter_directives(), "warn,chatroom_broker=debug");
    }

    #[test]
    fn from_settings_skips_bad_levels() {
        let mut module_levels = BTreeMap::new();
        module_levels.insert("chatroom_client".to_string(), "trace".to_string());
        module_levels.insert("noisy".to_string(), "loud".to_string());
        let settings = LoggingSettings {
            level: "debug".into(),
            json: true,
            module_levels,
        };

        let config = TelemetryConfig::from_settings(&settings);
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(config.json);
        assert_eq!(config.module_levels, vec![("chatroom_client".to_string(), Level::TRACE)]);
    }

    #[test]
    fn from_settings_defaults_unknown_level_to_info() {
        let settings = LoggingSettings {
            level: "verbose".into(),
            ..LoggingSettings::default()
        };
        assert_eq!(TelemetryConfig::from_settings(&settings).log_level, Level::INFO);
    }
}
