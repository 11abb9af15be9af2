//! # chatroom-discovery
//!
//! Locating the broker by logical name.
//!
//! - [`ServiceInfo`]: what an announcement carries (full name, address, port, properties)
//! - [`ServiceDirectory`]: in-process directory with observer callbacks and waits
//! - [`Resolver`]: `resolve(name, timeout)`, implemented by the directory, by
//!   [`MdnsDiscovery`] on the local network and by [`StaticResolver`] for
//!   fixed addresses
//! - [`Announcer`]: where a broker publishes itself once listening

#![deny(unsafe_code)]

mod directory;
mod mdns;
mod resolver;

pub use directory::{ObserverId, ServiceDirectory, ServiceEvent};
pub use mdns::MdnsDiscovery;
pub use resolver::{Announcer, Resolver, StaticResolver};

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Service type every chatroom broker is announced under.
pub const SERVICE_TYPE: &str = "_http._tcp.local.";

/// Errors raised while announcing or resolving a service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    /// Nothing announced `name` before the deadline.
    #[error("service {name} not found within {timeout:?}")]
    Timeout {
        /// Full service name that was awaited.
        name: String,
        /// How long the caller waited.
        timeout: Duration,
    },
    /// An address that is not `ip` or `host:port`.
    #[error("invalid service address {0}")]
    InvalidAddress(String),
    /// The multicast DNS daemon failed.
    #[error("mdns: {0}")]
    Mdns(String),
}

impl From<DiscoveryError> for chatroom_core::BusError {
    fn from(e: DiscoveryError) -> Self {
        Self::Discovery(e.to_string())
    }
}

/// `broker` -> `_broker._http._tcp.local.`; full names pass through.
pub fn service_full_name(name: &str) -> String {
    if name.ends_with(SERVICE_TYPE) {
        return name.to_string();
    }
    if name.starts_with('_') {
        format!("{name}.{SERVICE_TYPE}")
    } else {
        format!("_{name}.{SERVICE_TYPE}")
    }
}

/// A resolved or announced service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Full service name, see [`service_full_name`].
    pub name: String,
    /// IP address or host name.
    pub address: String,
    /// Port the broker listens on.
    pub port: u16,
    /// TXT-style properties such as `version`.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ServiceInfo {
    /// Service `name` (normalised to a full name) at `address:port`.
    pub fn new(name: &str, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: service_full_name(name),
            address: address.into(),
            port,
            properties: BTreeMap::new(),
        }
    }

    /// Add a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.properties.insert(key.into(), value.into());
        self
    }

    /// Announced broker version.
    pub fn version(&self) -> Option<&str> {
        self.properties.get("version").map(String::as_str)
    }

    /// `address:port`, if the address is an IP.
    pub fn socket_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|_| DiscoveryError::InvalidAddress(self.address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// WebSocket endpoint of a broker at this address.
    pub fn ws_url(&self) -> String {
        match self.socket_addr() {
            Ok(addr) => format!("ws://{addr}/ws"),
            Err(_) => format!("ws://{}:{}/ws", self.address, self.port),
        }
    }
}

impl std::fmt::Display for ServiceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} {}", self.address, self.port, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_name_normalisation() {
        assert_eq!(service_full_name("chatroom"), "_chatroom._http._tcp.local.");
        assert_eq!(service_full_name("_chatroom"), "_chatroom._http._tcp.local.");
        assert_eq!(
            service_full_name("_chatroom._http._tcp.local."),
            "_chatroom._http._tcp.local."
        );
    }

    #[test]
    fn ws_url_for_v4_and_v6() {
        assert_eq!(ServiceInfo::new("c", "127.0.0.1", 5037).ws_url(), "ws://127.0.0.1:5037/ws");
        assert_eq!(ServiceInfo::new("c", "::1", 5037).ws_url(), "ws://[::1]:5037/ws");
        assert_eq!(ServiceInfo::new("c", "broker.lan", 80).ws_url(), "ws://broker.lan:80/ws");
    }

    #[test]
    fn version_property() {
        let info = ServiceInfo::new("c", "127.0.0.1", 1).with_property("version", "0.1.0");
        assert_eq!(info.version(), Some("0.1.0"));
        assert!(ServiceInfo::new("c", "127.0.0.1", 1).version().is_none());
    }

    #[test]
    fn invalid_address_rejected() {
        let err = ServiceInfo::new("c", "not an ip", 1).socket_addr().unwrap_err();
        assert_eq!(err, DiscoveryError::InvalidAddress("not an ip".into()));
    }
}
