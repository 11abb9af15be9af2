//! Multicast DNS announcer and resolver.
//!
//! Browsing feeds a local [`ServiceDirectory`], so resolution, observers and
//! waits behave exactly as they do for in-process announcements.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent as MdnsEvent};
use tracing::{debug, info, warn};

use crate::{
    service_full_name, Announcer, DiscoveryError, Resolver, ServiceDirectory, ServiceInfo,
    SERVICE_TYPE,
};

/// Announces and browses `_http._tcp.local.` services on the local network.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    directory: ServiceDirectory,
    browsing: AtomicBool,
}

impl MdnsDiscovery {
    /// Start the mDNS daemon.
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(mdns_error)?;
        Ok(Self {
            daemon,
            directory: ServiceDirectory::new(),
            browsing: AtomicBool::new(false),
        })
    }

    /// Services seen on the network so far.
    pub fn directory(&self) -> &ServiceDirectory {
        &self.directory
    }

    /// Start browsing. Later calls are no-ops.
    pub fn browse(&self) -> Result<(), DiscoveryError> {
        if self.browsing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let events = match self.daemon.browse(SERVICE_TYPE) {
            Ok(events) => events,
            Err(e) => {
                self.browsing.store(false, Ordering::Release);
                return Err(mdns_error(e));
            }
        };
        let directory = self.directory.clone();
        let spawned = std::thread::Builder::new()
            .name("mdns-browse".into())
            .spawn(move || {
                while let Ok(event) = events.recv() {
                    match event {
                        MdnsEvent::ServiceResolved(resolved) => {
                            if let Some(info) = from_mdns(&resolved) {
                                directory.announce(info);
                            }
                        }
                        MdnsEvent::ServiceRemoved(_, fullname) => {
                            let _ = directory.withdraw(&fullname);
                        }
                        other => debug!(event = ?other, "mdns event"),
                    }
                }
                debug!("mdns browse ended");
            });
        if let Err(e) = spawned {
            self.browsing.store(false, Ordering::Release);
            return Err(DiscoveryError::Mdns(e.to_string()));
        }
        Ok(())
    }
}

impl Announcer for MdnsDiscovery {
    fn announce(&self, info: &ServiceInfo) -> Result<(), DiscoveryError> {
        let instance = instance_name(&info.name);
        let host = format!("{instance}.local.");
        let properties: HashMap<String, String> = info
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let record = mdns_sd::ServiceInfo::new(
            SERVICE_TYPE,
            instance,
            &host,
            info.address.as_str(),
            info.port,
            properties,
        )
        .map_err(mdns_error)?;
        self.daemon.register(record).map_err(mdns_error)?;
        info!(service = %info, "service announced over mdns");
        Ok(())
    }

    fn withdraw(&self, name: &str) {
        match self.daemon.unregister(&service_full_name(name)) {
            Ok(_) => info!(name, "mdns announcement withdrawn"),
            Err(e) => warn!(name, error = %e, "mdns withdraw failed"),
        }
    }
}

#[async_trait]
impl Resolver for MdnsDiscovery {
    async fn resolve(&self, name: &str, timeout: Duration) -> Result<ServiceInfo, DiscoveryError> {
        self.browse()?;
        self.directory.wait(name, timeout).await
    }
}

// Stopping the daemon ends the browse thread and withdraws what it announced.
impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mdns daemon shutdown failed");
        }
    }
}

/// `_chatroom._http._tcp.local.` -> `_chatroom`.
fn instance_name(full_name: &str) -> &str {
    full_name
        .strip_suffix(SERVICE_TYPE)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(full_name)
}

/// Prefers an IPv4 address when the record carries several.
fn from_mdns(resolved: &mdns_sd::ServiceInfo) -> Option<ServiceInfo> {
    let mut addresses: Vec<IpAddr> = resolved.get_addresses().iter().copied().collect();
    addresses.sort_by_key(|ip| (!ip.is_ipv4(), *ip));
    let address = addresses.first()?;
    let properties = resolved
        .get_properties()
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();
    Some(ServiceInfo {
        name: service_full_name(resolved.get_fullname()),
        address: address.to_string(),
        port: resolved.get_port(),
        properties,
    })
}

fn mdns_error(e: mdns_sd::Error) -> DiscoveryError {
    DiscoveryError::Mdns(e.to_string())
}
