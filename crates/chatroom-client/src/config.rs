use std::time::Duration;

use chatroom_core::settings::ClientSettings;

/// Per-client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Path this client registers under.
    pub path: String,
    /// Logical broker name to resolve.
    pub broker_name: String,
    /// Deadline for broker acks.
    pub emit_timeout: Duration,
    /// Default deadline for RPC results.
    pub rpc_timeout: Duration,
    /// How long to wait for the broker to be found.
    pub discovery_timeout: Duration,
    /// Handlers that may run at once.
    pub rpc_workers: usize,
    /// Requests that may wait for a worker before the pump stalls.
    pub rpc_queue: usize,
}

impl ClientConfig {
    /// Defaults for `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self::from_settings(path, &ClientSettings::default())
    }

    /// Configuration for `path` from loaded settings.
    pub fn from_settings(path: impl Into<String>, settings: &ClientSettings) -> Self {
        Self {
            path: path.into(),
            broker_name: settings.broker_name.clone(),
            emit_timeout: settings.emit_timeout(),
            rpc_timeout: settings.rpc_timeout(),
            discovery_timeout: settings.discovery_timeout(),
            rpc_workers: settings.rpc_workers.max(1),
            rpc_queue: settings.rpc_queue.max(1),
        }
    }

    /// Resolve `name` instead of the configured broker.
    pub fn with_broker_name(mut self, name: impl Into<String>) -> Self {
        self.broker_name = name.into();
        self
    }

    /// Override the ack and reply timeouts.
    pub fn with_timeouts(mut self, emit: Duration, rpc: Duration) -> Self {
        self.emit_timeout = emit;
        self.rpc_timeout = rpc;
        self
    }

    /// Override the worker pool size.
    pub fn with_workers(mut self, workers: usize, queue: usize) -> Self {
        self.rpc_workers = workers.max(1);
        self.rpc_queue = queue.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::new("svc.a");
        assert_eq!(config.path, "svc.a");
        assert_eq!(config.broker_name, "chatroom");
        assert_eq!(config.emit_timeout, Duration::from_secs(60));
        assert_eq!((config.rpc_workers, config.rpc_queue), (2, 64));
    }

    #[test]
    fn builders_clamp_pool_sizes() {
        let config = ClientConfig::new("x").with_workers(0, 0);
        assert_eq!((config.rpc_workers, config.rpc_queue), (1, 1));
    }
}
