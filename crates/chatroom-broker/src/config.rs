//! Broker configuration.

use chatroom_core::settings::BrokerSettings;

/// Where the broker listens and how much it buffers.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Logical name announced to discovery.
    pub name: String,
    /// Interface to bind.
    pub host: String,
    /// Listen port. Zero picks an ephemeral port.
    pub port: u16,
    /// Outbound frames buffered per connection.
    pub max_send_queue: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_settings(&BrokerSettings::default())
    }
}

impl BrokerConfig {
    /// Configuration from loaded settings.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self {
            name: settings.name.clone(),
            host: settings.host.clone(),
            port: settings.port,
            max_send_queue: settings.max_send_queue.max(1),
        }
    }

    /// `host:port`, bracketing IPv6 hosts.
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
