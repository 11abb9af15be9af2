//! Live connections and their outbound queues.

use std::sync::atomic::{AtomicU64, Ordering};

use chatroom_core::{ConnectionId, Frame};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;

struct Outbound {
    tx: mpsc::Sender<Frame>,
    dropped: AtomicU64,
}

/// Every connected participant's send queue, keyed by connection id.
///
/// Sends never wait: a full queue drops the frame (at-most-once delivery).
pub struct ConnectionHub {
    connections: DashMap<ConnectionId, Outbound>,
    max_send_queue: usize,
}

impl ConnectionHub {
    /// Hub whose queues hold `max_send_queue` frames.
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Allocate a connection id and its outbound queue.
    pub fn open(&self) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let _ = self.connections.insert(
            id.clone(),
            Outbound {
                tx,
                dropped: AtomicU64::new(0),
            },
        );
        (id, rx)
    }

    /// Drop the queue; the connection's writer drains what is left and stops.
    pub fn close(&self, id: &ConnectionId) -> bool {
        self.connections.remove(id).is_some()
    }

    /// Queue `frame` for `id`. `false` if it was dropped or `id` is gone.
    pub fn send(&self, id: &ConnectionId, frame: Frame) -> bool {
        let Some(outbound) = self.connections.get(id) else {
            return false;
        };
        match outbound.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let _ = outbound.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(conn_id = %id, event = %frame.event, "send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Frames dropped for `id` because its queue was full.
    pub fn dropped(&self, id: &ConnectionId) -> u64 {
        self.connections
            .get(id)
            .map_or(0, |o| o.dropped.load(Ordering::Relaxed))
    }

    /// Whether `id` is still open.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Open connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn open_send_close() {
        let hub = ConnectionHub::new(8);
        let (id, mut rx) = hub.open();
        assert_eq!(hub.count(), 1);

        assert!(hub.send(&id, Frame::new("echo", json!(1))));
        assert_eq!(rx.recv().await.unwrap().event, "echo");

        assert!(hub.close(&id));
        assert!(!hub.send(&id, Frame::new("echo", json!(2))));
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.count(), 0);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let hub = ConnectionHub::new(1);
        let (id, _rx) = hub.open();
        assert!(hub.send(&id, Frame::new("a", json!(null))));
        assert!(!hub.send(&id, Frame::new("b", json!(null))));
        assert_eq!(hub.dropped(&id), 1);
    }

    #[test]
    fn send_to_unknown_connection() {
        let hub = ConnectionHub::new(1);
        assert!(!hub.send(&ConnectionId::new(), Frame::new("a", json!(null))));
    }

    #[test]
    fn closed_receiver_is_not_counted_as_drop() {
        let hub = ConnectionHub::new(4);
        let (id, rx) = hub.open();
        drop(rx);
        assert!(!hub.send(&id, Frame::new("a", json!(null))));
        assert_eq!(hub.dropped(&id), 0);
    }
}
