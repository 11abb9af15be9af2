use std::time::Duration;

use async_trait::async_trait;

use crate::{service_full_name, DiscoveryError, ServiceDirectory, ServiceInfo};

/// Maps a logical broker name to its address, waiting up to `timeout`.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Address of the service announced as `name`.
    async fn resolve(&self, name: &str, timeout: Duration) -> Result<ServiceInfo, DiscoveryError>;
}

/// Where a broker publishes itself once listening.
pub trait Announcer: Send + Sync {
    /// Publish `info`, replacing an earlier announcement with the same name.
    fn announce(&self, info: &ServiceInfo) -> Result<(), DiscoveryError>;

    /// Withdraw the announcement for `name`. Idempotent.
    fn withdraw(&self, name: &str);
}

impl Announcer for ServiceDirectory {
    fn announce(&self, info: &ServiceInfo) -> Result<(), DiscoveryError> {
        ServiceDirectory::announce(self, info.clone());
        Ok(())
    }

    fn withdraw(&self, name: &str) {
        let _ = ServiceDirectory::withdraw(self, name);
    }
}

#[async_trait]
impl Resolver for ServiceDirectory {
    async fn resolve(&self, name: &str, timeout: Duration) -> Result<ServiceInfo, DiscoveryError> {
        self.wait(name, timeout).await
    }
}

/// Always resolves to one fixed address, whatever name is asked for.
#[derive(Clone, Debug)]
pub struct StaticResolver {
    address: String,
    port: u16,
}

impl StaticResolver {
    /// Resolver answering `address:port`.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Parse `host:port`.
    pub fn parse(target: &str) -> Result<Self, DiscoveryError> {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| DiscoveryError::InvalidAddress(target.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| DiscoveryError::InvalidAddress(target.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(host, port))
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, name: &str, _timeout: Duration) -> Result<ServiceInfo, DiscoveryError> {
        Ok(ServiceInfo {
            name: service_full_name(name),
            address: self.address.clone(),
            port: self.port,
            properties: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_ignores_name() {
        let resolver = StaticResolver::new("10.0.0.5", 6000);
        let info = resolver.resolve("anything", Duration::ZERO).await.unwrap();
        assert_eq!(info.ws_url(), "ws://10.0.0.5:6000/ws");
        assert_eq!(info.name, "_anything._http._tcp.local.");
    }

    #[test]
    fn static_resolver_parse() {
        let r = StaticResolver::parse("127.0.0.1:5037").unwrap();
        assert_eq!((r.address.as_str(), r.port), ("127.0.0.1", 5037));
        let r = StaticResolver::parse("[::1]:80").unwrap();
        assert_eq!(r.address, "::1");
        assert!(StaticResolver::parse("nohost").is_err());
        assert!(StaticResolver::parse("h:notaport").is_err());
    }

    #[tokio::test]
    async fn directory_resolves_announced_service() {
        let dir = ServiceDirectory::new();
        dir.announce(ServiceInfo::new("chatroom", "127.0.0.1", 5037));
        let resolver: &dyn Resolver = &dir;
        let info = resolver.resolve("chatroom", Duration::from_secs(1)).await.unwrap();
        assert_eq!(info.port, 5037);
    }

    #[test]
    fn directory_announcer_round_trip() {
        let dir = ServiceDirectory::new();
        let announcer: &dyn Announcer = &dir;
        announcer.announce(&ServiceInfo::new("chatroom", "127.0.0.1", 5037)).unwrap();
        assert_eq!(dir.get("chatroom").map(|s| s.port), Some(5037));
        announcer.withdraw("chatroom");
        announcer.withdraw("chatroom");
        assert!(dir.get("chatroom").is_none());
    }
}
