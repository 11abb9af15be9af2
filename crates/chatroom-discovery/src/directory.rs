//! In-process service directory.
//!
//! Announcements replace any previous entry under the same full name.
//! Observers are called on every change, outside the directory's lock, so an
//! observer may query the directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatroom_core::waiter::{PendingMap, WaitError, Waiter};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{service_full_name, DiscoveryError, ServiceInfo};

/// A change seen by directory observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A service was announced or re-announced.
    Added(ServiceInfo),
    /// A service was withdrawn.
    Removed(ServiceInfo),
}

impl ServiceEvent {
    /// The service the event is about.
    pub fn service(&self) -> &ServiceInfo {
        match self {
            Self::Added(info) | Self::Removed(info) => info,
        }
    }
}

/// Handle for removing an observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

/// Services by full name. Clones share the same directory.
#[derive(Clone, Default)]
pub struct ServiceDirectory {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    services: Mutex<HashMap<String, ServiceInfo>>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
}

impl ServiceDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `info`, replacing any previous announcement with its name.
    pub fn announce(&self, info: ServiceInfo) {
        info!(service = %info, "service announced");
        let _ = self
            .inner
            .services
            .lock()
            .insert(info.name.clone(), info.clone());
        self.notify(&ServiceEvent::Added(info));
    }

    /// Remove the announcement for `name`. Returns the removed entry.
    pub fn withdraw(&self, name: &str) -> Option<ServiceInfo> {
        let removed = self.inner.services.lock().remove(&service_full_name(name))?;
        info!(service = %removed, "service withdrawn");
        self.notify(&ServiceEvent::Removed(removed.clone()));
        Some(removed)
    }

    /// Current announcement for `name`.
    pub fn get(&self, name: &str) -> Option<ServiceInfo> {
        self.inner
            .services
            .lock()
            .get(&service_full_name(name))
            .cloned()
    }

    /// Every announcement, sorted by name.
    pub fn list(&self) -> Vec<ServiceInfo> {
        let mut services: Vec<_> = self.inner.services.lock().values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// Register a callback invoked on every subsequent add or remove.
    pub fn observe(&self, observer: impl Fn(&ServiceEvent) + Send + Sync + 'static) -> ObserverId {
        let id = ObserverId(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));
        self.inner.observers.lock().push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer; `false` if it was already gone.
    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.inner.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    fn notify(&self, event: &ServiceEvent) {
        let observers: Vec<Observer> = self
            .inner
            .observers
            .lock()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            observer(event);
        }
    }

    /// Wait (as a task) until `name` is announced.
    pub async fn wait(&self, name: &str, timeout: Duration) -> Result<ServiceInfo, DiscoveryError> {
        let Some((waiter, observer)) = self.arm(name) else {
            return Err(timed_out(name, timeout));
        };
        let outcome = waiter.wait(timeout).await;
        self.finish(name, timeout, observer, outcome)
    }

    /// Wait (as a thread) until `name` is announced.
    pub fn wait_blocking(&self, name: &str, timeout: Duration) -> Result<ServiceInfo, DiscoveryError> {
        let Some((waiter, observer)) = self.arm(name) else {
            return Err(timed_out(name, timeout));
        };
        let outcome = waiter.wait_blocking(timeout);
        self.finish(name, timeout, observer, outcome)
    }

    // Observer first, then the existing-entry check, so an announcement
    // landing in between is not missed. A double completion is discarded.
    fn arm(&self, name: &str) -> Option<(Waiter<ServiceInfo>, ObserverId)> {
        let full_name = service_full_name(name);
        let slot = Arc::new(PendingMap::new());
        let waiter = slot.register(full_name.clone())?;

        debug!(service = %full_name, "waiting for service");
        let observed = Arc::clone(&slot);
        let wanted = full_name.clone();
        let observer = self.observe(move |event| {
            if let ServiceEvent::Added(info) = event {
                if info.name == wanted {
                    let _ = observed.complete(&wanted, info.clone());
                }
            }
        });

        if let Some(existing) = self.get(&full_name) {
            let _ = slot.complete(&full_name, existing);
        }
        Some((waiter, observer))
    }

    fn finish(
        &self,
        name: &str,
        timeout: Duration,
        observer: ObserverId,
        outcome: Result<ServiceInfo, WaitError>,
    ) -> Result<ServiceInfo, DiscoveryError> {
        let _ = self.unobserve(observer);
        outcome.map_err(|_| timed_out(name, timeout))
    }
}

fn timed_out(name: &str, timeout: Duration) -> DiscoveryError {
    DiscoveryError::Timeout {
        name: service_full_name(name),
        timeout,
    }
}
