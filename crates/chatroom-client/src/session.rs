//! Background machinery behind a connected client: the outbound writer, the
//! inbound pump and the RPC worker pool.

use std::sync::Arc;
use std::time::Duration;

use chatroom_core::{BusError, Delivery, EchoBody, EventKind, Frame, RpcCall, RpcReply, Transport, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::correlation::CorrelationEngine;
use crate::methods::MethodTable;
use crate::pool::{reject_malformed, Job, WorkerPool};
use crate::subscriptions::SubscriptionTable;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct Session {
    pub(crate) engine: Arc<CorrelationEngine>,
    pub(crate) methods: Arc<MethodTable>,
    pub(crate) subscriptions: Arc<SubscriptionTable>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Session {
    /// Spawn the writer, pump and workers on the current runtime.
    pub(crate) fn start(transport: Arc<dyn Transport>, config: &ClientConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(CorrelationEngine::new(
            outbound_tx,
            config.emit_timeout,
            config.rpc_timeout,
        ));
        let methods = Arc::new(MethodTable::new());
        let subscriptions = Arc::new(SubscriptionTable::new());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let pool = WorkerPool::start(
            config.rpc_workers,
            config.rpc_queue,
            Arc::clone(&methods),
            Arc::clone(&engine),
            &tracker,
        );
        let inbound = Inbound {
            engine: Arc::clone(&engine),
            subscriptions: Arc::clone(&subscriptions),
            pool,
        };
        let _ = tracker.spawn(write_loop(Arc::clone(&transport), outbound_rx, cancel.clone()));
        let _ = tracker.spawn(pump(Arc::clone(&transport), inbound, cancel.clone()));

        Self {
            engine,
            methods,
            subscriptions,
            transport,
            cancel,
            tracker,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel pending waiters, stop the background tasks and close the link.
    pub(crate) async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let cancelled = self.engine.cancel_all();
        self.cancel.cancel();
        self.transport.close().await;
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("client tasks still running after shutdown grace period");
        }
        debug!(cancelled, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn write_loop(
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = transport.send(frame).await {
            warn!(error = %e, "write to broker failed");
            break;
        }
    }
}

/// Read frames until the link ends. Waiters left pending by a lost link run
/// out their own timeouts.
async fn pump(transport: Arc<dyn Transport>, inbound: Inbound, cancel: CancellationToken) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = transport.recv() => received,
        };
        match received {
            Ok(Some(frame)) => inbound.dispatch(frame).await,
            Ok(None) => break,
            Err(TransportError::Codec(e)) => warn!(error = %e, "undecodable frame from broker"),
            Err(e) => {
                warn!(error = %e, "read from broker failed");
                break;
            }
        }
    }
    info!("connection to broker lost");
}

struct Inbound {
    engine: Arc<CorrelationEngine>,
    subscriptions: Arc<SubscriptionTable>,
    pool: WorkerPool,
}

impl Inbound {
    async fn dispatch(&self, frame: Frame) {
        let Frame { event, data } = frame;
        match EventKind::parse(&event) {
            Some(EventKind::RpcRequest) => self.on_rpc_request(data).await,
            Some(EventKind::RpcResponse) => self.on_rpc_response(data),
            Some(EventKind::Publish) => self.on_publish(data),
            Some(EventKind::Echo) => self.on_echo(data),
            Some(kind) => warn!(event = kind.as_str(), "unexpected event from broker"),
            // Anything else is an ack named by its `_uid`.
            None => {
                let _ = self.engine.complete_ack(&event, data);
            }
        }
    }

    async fn on_rpc_request(&self, data: serde_json::Value) {
        let Some(delivery) = delivery(EventKind::RpcRequest, data) else {
            return;
        };
        let call: RpcCall = match serde_json::from_value(delivery.payload.clone()) {
            Ok(call) => call,
            Err(e) => {
                warn!(source = %delivery.path, error = %BusError::from(e), "malformed rpc_request");
                if let Some(reply) = reject_malformed(&delivery.payload) {
                    self.pool.reply(delivery.path, reply);
                }
                return;
            }
        };
        let job = Job {
            source: delivery.path,
            call,
        };
        if !self.pool.submit(job).await {
            warn!("rpc workers stopped, request dropped");
        }
    }

    fn on_rpc_response(&self, data: serde_json::Value) {
        let Some(delivery) = delivery(EventKind::RpcResponse, data) else {
            return;
        };
        match serde_json::from_value::<RpcReply>(delivery.payload) {
            Ok(reply) => {
                let _ = self.engine.complete_reply(reply);
            }
            Err(e) => warn!(source = %delivery.path, error = %BusError::from(e), "malformed rpc_response"),
        }
    }

    fn on_publish(&self, data: serde_json::Value) {
        let Some(delivery) = delivery(EventKind::Publish, data) else {
            return;
        };
        if !self.subscriptions.dispatch(&delivery.path, &delivery.payload) {
            warn!(source = %delivery.path, "publish from a path with no subscription");
        }
    }

    fn on_echo(&self, data: serde_json::Value) {
        let Some(delivery) = delivery(EventKind::Echo, data) else {
            return;
        };
        match serde_json::from_value::<EchoBody>(delivery.payload) {
            Ok(body) => {
                let _ = self.engine.complete_echo(body);
            }
            Err(e) => warn!(source = %delivery.path, error = %BusError::from(e), "malformed echo"),
        }
    }
}

fn delivery(kind: EventKind, data: serde_json::Value) -> Option<Delivery> {
    match serde_json::from_value(data) {
        Ok(delivery) => Some(delivery),
        Err(e) => {
            warn!(event = kind.as_str(), error = %e, "malformed delivery");
            None
        }
    }
}
