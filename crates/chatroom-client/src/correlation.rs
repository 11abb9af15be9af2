//! Two-level correlation: transport acks keyed by `_uid`, RPC replies keyed
//! by request id, echoes keyed by echo id.
//!
//! Every waiter is registered before its frame leaves, so a reply can never
//! arrive ahead of the slot it completes.

use std::time::Duration;

use chatroom_core::{
    Ack, BusError, CorrelationId, EchoBody, EchoId, Envelope, EventKind, Frame, PendingMap,
    RequestId, Result, RpcCall, RpcReply, TransportError, WaitError, Waiter,
};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound frames plus the waiters for their acks, replies and echoes.
pub struct CorrelationEngine {
    outbound: mpsc::UnboundedSender<Frame>,
    acks: PendingMap<Ack>,
    replies: PendingMap<RpcReply>,
    echoes: PendingMap<Value>,
    emit_timeout: Duration,
    rpc_timeout: Duration,
}

impl CorrelationEngine {
    /// Engine writing frames to `outbound`.
    pub fn new(
        outbound: mpsc::UnboundedSender<Frame>,
        emit_timeout: Duration,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            outbound,
            acks: PendingMap::new(),
            replies: PendingMap::new(),
            echoes: PendingMap::new(),
            emit_timeout,
            rpc_timeout,
        }
    }

    /// Default ack timeout.
    pub fn emit_timeout(&self) -> Duration {
        self.emit_timeout
    }

    /// Default reply timeout.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Send `envelope` under a fresh `_uid` and wait for the broker's ack.
    pub async fn emit(&self, kind: EventKind, envelope: Envelope, timeout: Duration) -> Result<Ack> {
        let waiter = self.dispatch(kind, envelope)?;
        settle_ack(waiter.wait(timeout).await, timeout)
    }

    /// Blocking twin of [`emit`](Self::emit). Must not run on a runtime thread.
    pub fn emit_blocking(&self, kind: EventKind, envelope: Envelope, timeout: Duration) -> Result<Ack> {
        let waiter = self.dispatch(kind, envelope)?;
        settle_ack(waiter.wait_blocking(timeout), timeout)
    }

    fn dispatch(&self, kind: EventKind, envelope: Envelope) -> Result<Waiter<Ack>> {
        let uid = CorrelationId::new();
        let waiter = self
            .acks
            .register(uid.as_str())
            .ok_or_else(|| BusError::RegistryInconsistency(uid.to_string()))?;
        let frame = Frame::with_body(kind.as_str(), &envelope.with_uid(uid))?;
        debug!(event = kind.as_str(), uid = waiter.key(), "emit");
        self.send(frame)?;
        Ok(waiter)
    }

    fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| BusError::Transport(TransportError::Closed))
    }

    /// Register the reply slot, then emit the request. The returned handle
    /// waits for the result; dropping it abandons the call.
    pub async fn send_rpc_request(
        &self,
        target: &str,
        method: &str,
        parameters: Map<String, Value>,
    ) -> Result<PendingRpc> {
        let (pending, envelope) = self.stage_rpc(target, method, parameters)?;
        self.emit(EventKind::RpcRequest, envelope, self.emit_timeout).await?;
        Ok(pending)
    }

    /// Blocking twin of [`send_rpc_request`](Self::send_rpc_request).
    pub fn send_rpc_request_blocking(
        &self,
        target: &str,
        method: &str,
        parameters: Map<String, Value>,
    ) -> Result<PendingRpc> {
        let (pending, envelope) = self.stage_rpc(target, method, parameters)?;
        self.emit_blocking(EventKind::RpcRequest, envelope, self.emit_timeout)?;
        Ok(pending)
    }

    fn stage_rpc(
        &self,
        target: &str,
        method: &str,
        parameters: Map<String, Value>,
    ) -> Result<(PendingRpc, Envelope)> {
        let id = RequestId::new();
        let waiter = self
            .replies
            .register(id.as_str())
            .ok_or_else(|| BusError::RegistryInconsistency(id.to_string()))?;
        let call = RpcCall {
            id: id.clone(),
            method: method.to_owned(),
            parameters,
        };
        let envelope = Envelope::to(target, serde_json::to_value(&call)?);
        let pending = PendingRpc {
            id,
            method: method.to_owned(),
            waiter,
            timeout: self.rpc_timeout,
        };
        Ok((pending, envelope))
    }

    /// Round-trip `message` through the broker to `own_path`.
    pub async fn echo(&self, own_path: &str, message: Value, timeout: Duration) -> Result<Value> {
        let (waiter, envelope) = self.stage_echo(own_path, message)?;
        self.emit(EventKind::Echo, envelope, self.emit_timeout).await?;
        settle(waiter.wait(timeout).await, timeout)
    }

    /// Blocking twin of [`echo`](Self::echo).
    pub fn echo_blocking(&self, own_path: &str, message: Value, timeout: Duration) -> Result<Value> {
        let (waiter, envelope) = self.stage_echo(own_path, message)?;
        self.emit_blocking(EventKind::Echo, envelope, self.emit_timeout)?;
        settle(waiter.wait_blocking(timeout), timeout)
    }

    fn stage_echo(&self, own_path: &str, message: Value) -> Result<(Waiter<Value>, Envelope)> {
        let id = EchoId::new();
        let waiter = self
            .echoes
            .register(id.as_str())
            .ok_or_else(|| BusError::RegistryInconsistency(id.to_string()))?;
        let body = EchoBody { id, message };
        Ok((waiter, Envelope::to(own_path, serde_json::to_value(&body)?)))
    }

    /// Deliver an ack that arrived under event name `uid`.
    pub fn complete_ack(&self, uid: &str, data: Value) -> bool {
        let ack = match serde_json::from_value::<Ack>(data) {
            Ok(ack) => ack,
            Err(e) => Ack::rejected(format!("malformed ack: {e}")),
        };
        self.acks.complete(uid, ack) || unmatched(uid, "ack")
    }

    /// Deliver an `rpc_response`; `false` if nobody waits for it.
    pub fn complete_reply(&self, reply: RpcReply) -> bool {
        let id = reply.id.clone();
        self.replies.complete(id.as_str(), reply) || unmatched(id.as_str(), "rpc_response")
    }

    /// Deliver an echo; `false` if nobody waits for it.
    pub fn complete_echo(&self, body: EchoBody) -> bool {
        self.echoes.complete(body.id.as_str(), body.message) || unmatched(body.id.as_str(), "echo")
    }

    /// Wake every outstanding waiter with [`BusError::Cancelled`].
    pub fn cancel_all(&self) -> usize {
        self.acks.cancel_all() + self.replies.cancel_all() + self.echoes.cancel_all()
    }

    /// Acks still awaited.
    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    /// RPC replies still awaited.
    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    /// Echoes still awaited.
    pub fn pending_echoes(&self) -> usize {
        self.echoes.len()
    }
}

fn unmatched(id: &str, what: &'static str) -> bool {
    let err = BusError::RegistryInconsistency(id.to_owned());
    warn!(kind = what, error = %err, "dropping unmatched reply");
    false
}

fn settle<T>(outcome: std::result::Result<T, WaitError>, timeout: Duration) -> Result<T> {
    outcome.map_err(|e| match e {
        WaitError::Timeout => BusError::Timeout(timeout),
        WaitError::Cancelled => BusError::Cancelled,
    })
}

fn settle_ack(outcome: std::result::Result<Ack, WaitError>, timeout: Duration) -> Result<Ack> {
    let ack = settle(outcome, timeout)?;
    if ack.success {
        Ok(ack)
    } else {
        Err(BusError::EmitRejected(ack.reason()))
    }
}

fn settle_reply(outcome: std::result::Result<RpcReply, WaitError>, timeout: Duration) -> Result<Value> {
    let reply = settle(outcome, timeout)?;
    match reply.error {
        Some(body) => Err(BusError::from_remote(body)),
        None => Ok(reply.result),
    }
}

/// An RPC whose request the broker has accepted.
pub struct PendingRpc {
    id: RequestId,
    method: String,
    waiter: Waiter<RpcReply>,
    timeout: Duration,
}

impl PendingRpc {
    /// Id of the call.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Method that was called.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait up to the configured RPC timeout.
    pub async fn wait(self) -> Result<Value> {
        let timeout = self.timeout;
        self.wait_for(timeout).await
    }

    /// Wait up to `timeout`.
    pub async fn wait_for(self, timeout: Duration) -> Result<Value> {
        settle_reply(self.waiter.wait(timeout).await, timeout)
    }

    /// Park the thread up to the configured RPC timeout.
    pub fn wait_blocking(self) -> Result<Value> {
        let timeout = self.timeout;
        self.wait_blocking_for(timeout)
    }

    /// Park the thread up to `timeout`.
    pub fn wait_blocking_for(self, timeout: Duration) -> Result<Value> {
        settle_reply(self.waiter.wait_blocking(timeout), timeout)
    }
}

impl std::fmt::Debug for PendingRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRpc")
            .field("id", &self.id)
            .field("method", &self.method)
            .finish()
    }
}
