//! Inbound frame handling: registration, subscription and routing.
//!
//! Every envelope that carries a `_uid` is answered with an [`Ack`] whose
//! event name is that uid, so the sender's single-shot waiter fires whatever
//! the envelope's kind.

use std::sync::Arc;

use chatroom_core::{
    Ack, BusPath, ConnectionId, CorrelationId, Delivery, Envelope, EventKind, Frame,
    BROADCAST_TARGET,
};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::hub::ConnectionHub;
use crate::registry::{Index, PathRegistry};

/// Why an envelope was not accepted; becomes the ack's `error`.
type Rejection = String;

/// Applies each inbound frame to the registry and forwards routed kinds.
pub struct MessageRouter {
    registry: PathRegistry,
    hub: Arc<ConnectionHub>,
}

impl MessageRouter {
    /// Router with an empty registry sending through `hub`.
    pub fn new(hub: Arc<ConnectionHub>) -> Self {
        Self {
            registry: PathRegistry::new(),
            hub,
        }
    }

    /// Paths and rooms.
    pub fn registry(&self) -> &PathRegistry {
        &self.registry
    }

    /// Outbound queues.
    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// Handle one frame received from `conn`.
    #[instrument(skip_all, fields(conn_id = %conn, event = %frame.event))]
    pub fn handle(&self, conn: &ConnectionId, frame: Frame) {
        let kind = frame.kind();
        // Read before decoding so a malformed envelope can still be answered.
        let raw_uid = frame
            .data
            .get("_uid")
            .and_then(Value::as_str)
            .map(CorrelationId::from_raw);
        let envelope = match serde_json::from_value::<Envelope>(frame.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "malformed envelope");
                self.answer(conn, raw_uid.as_ref(), Err(format!("Malformed envelope: {e}")));
                return;
            }
        };
        let uid = envelope.uid.as_ref();

        match kind {
            Some(EventKind::Register) => {
                self.answer(conn, uid, self.register(conn, envelope.path));
            }
            Some(EventKind::Unregister) => {
                let _ = self.registry.unregister(conn);
                self.answer(conn, uid, Ok(()));
            }
            Some(EventKind::Subscribe) => {
                self.answer(conn, uid, self.subscribe(conn, envelope.path));
            }
            Some(kind) => self.route(conn, kind, uid, envelope.path, envelope.payload),
            None => {
                warn!(event = %frame.event, "unknown event");
                self.answer(conn, uid, Err(format!("Unknown event '{}'", frame.event)));
            }
        }
    }

    /// Clean up after `conn` went away. Runs before the connection task ends.
    pub fn disconnect(&self, conn: &ConnectionId) {
        let path = self.registry.disconnect(conn);
        let _ = self.hub.close(conn);
        debug!(conn_id = %conn, path = ?path.as_ref().map(BusPath::as_str), "connection cleaned up");
    }

    fn answer(&self, conn: &ConnectionId, uid: Option<&CorrelationId>, outcome: Result<(), Rejection>) {
        let Some(uid) = uid else {
            if let Err(reason) = outcome {
                debug!(reason = %reason, "envelope without _uid rejected, no ack possible");
            }
            return;
        };
        let ack = match outcome {
            Ok(()) => Ack::ok(),
            Err(reason) => {
                debug!(uid = %uid, reason = %reason, "rejecting envelope");
                Ack::rejected(reason)
            }
        };
        match Frame::with_body(uid.as_str(), &ack) {
            Ok(frame) => {
                let _ = self.hub.send(conn, frame);
            }
            Err(e) => warn!(error = %e, "failed to encode ack"),
        }
    }

    fn register(&self, conn: &ConnectionId, path: Option<String>) -> Result<(), Rejection> {
        let path = parse_path(path, "register")?;
        let _ = self.registry.register(conn, path);
        Ok(())
    }

    fn subscribe(&self, conn: &ConnectionId, path: Option<String>) -> Result<(), Rejection> {
        let path = parse_path(path, "subscribe")?;
        self.registry.subscribe(conn, path.broadcast_room());
        debug!(conn_id = %conn, path = %path, "subscribed");
        Ok(())
    }

    // Target resolution and delivery happen under the registry lock so a
    // route never interleaves with a registration change for the same path.
    // The sender's ack is queued before any delivery.
    fn route(
        &self,
        conn: &ConnectionId,
        kind: EventKind,
        uid: Option<&CorrelationId>,
        target: Option<String>,
        payload: Value,
    ) {
        let index = self.registry.index();
        let (frame, recipients) = match self.recipients(&index, conn, kind, target, payload) {
            Ok(routed) => routed,
            Err(reason) => {
                drop(index);
                self.answer(conn, uid, Err(reason));
                return;
            }
        };
        self.answer(conn, uid, Ok(()));

        let mut delivered = 0usize;
        for recipient in &recipients {
            if self.hub.send(recipient, frame.clone()) {
                delivered += 1;
            }
        }
        drop(index);
        debug!(kind = %kind, recipients = recipients.len(), delivered, "routed");
    }

    fn recipients(
        &self,
        index: &Index,
        conn: &ConnectionId,
        kind: EventKind,
        target: Option<String>,
        payload: Value,
    ) -> Result<(Frame, Vec<ConnectionId>), Rejection> {
        let source = index
            .path_of(conn)
            .ok_or_else(|| "Sender has not registered a path".to_string())?;

        let target = match kind {
            EventKind::Publish => BROADCAST_TARGET.to_string(),
            _ => target.ok_or_else(|| format!("The 'path' should be in the {kind} data"))?,
        };

        let frame = Frame::with_body(
            kind.as_str(),
            &Delivery {
                path: source.as_str().to_string(),
                payload,
            },
        )
        .map_err(|e| e.to_string())?;

        if target == BROADCAST_TARGET {
            let members = self
                .registry
                .members(&source.broadcast_room())
                .into_iter()
                .filter(|m| m != conn)
                .collect();
            return Ok((frame, members));
        }

        let Some(target_conn) = index.lookup(&target) else {
            return Err(format!("Path '{target}' is not registered"));
        };
        Ok((frame, vec![target_conn.clone()]))
    }
}

fn parse_path(path: Option<String>, kind: &str) -> Result<BusPath, Rejection> {
    let path = path.ok_or_else(|| format!("The 'path' should be in the {kind} data"))?;
    BusPath::parse(path)
}
