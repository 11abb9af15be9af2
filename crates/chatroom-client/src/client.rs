use std::sync::Arc;
use std::time::Duration;

use chatroom_core::{Ack, BusError, BusPath, Envelope, EventKind, Result, Transport};
use chatroom_discovery::Resolver;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::correlation::PendingRpc;
use crate::methods::{HandlerError, MethodHandler, Params};
use crate::session::Session;
use crate::transport::WsTransport;

/// Asynchronous bus client bound to one path.
///
/// Every operation waits for the broker's ack; RPCs additionally wait for the
/// target's reply. Method handlers registered here run on the blocking pool,
/// so they may call into a [`BlockingClient`](crate::BlockingClient).
pub struct Client {
    path: BusPath,
    config: ClientConfig,
    session: Session,
}

impl Client {
    /// Resolve the broker, open a WebSocket and register `config.path`.
    pub async fn connect(config: ClientConfig, resolver: &dyn Resolver) -> Result<Self> {
        let service = resolver
            .resolve(&config.broker_name, config.discovery_timeout)
            .await?;
        info!(broker = %service, "resolved broker");
        let transport = WsTransport::connect(&service.ws_url()).await?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Register `config.path` over an already open link.
    pub async fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let path = parse_path(&config.path)?;
        let session = Session::start(transport, &config);
        let registered = session
            .engine
            .emit(EventKind::Register, Envelope::naming(path.as_str()), config.emit_timeout)
            .await;
        if let Err(e) = registered {
            session.shutdown().await;
            return Err(e);
        }
        info!(path = %path, "registered");
        Ok(Self { path, config, session })
    }

    /// The path this client registered.
    pub fn path(&self) -> &BusPath {
        &self.path
    }

    /// Settings the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Expose `name` to RPC callers. A later registration replaces it.
    pub fn register_method<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Params) -> std::result::Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.session.methods.register(name, handler);
    }

    /// Register a handler type implementing [`MethodHandler`] directly.
    pub fn register_handler(&self, name: impl Into<String>, handler: impl MethodHandler) {
        self.session.methods.register_handler(name, handler);
    }

    /// Stop serving `name`.
    pub fn unregister_method(&self, name: &str) -> bool {
        self.session.methods.unregister(name)
    }

    /// Send a raw envelope and wait for its ack.
    pub async fn emit(&self, kind: EventKind, envelope: Envelope, timeout: Duration) -> Result<Ack> {
        self.session.engine.emit(kind, envelope, timeout).await
    }

    /// Send an RPC request. Resolves once the broker accepts it; the handle
    /// then waits for the reply.
    pub async fn send_rpc_request(&self, target: &str, method: &str, params: Value) -> Result<PendingRpc> {
        let parameters = into_parameters(params)?;
        self.session
            .engine
            .send_rpc_request(target, method, parameters)
            .await
    }

    /// Call `method` on `target` and wait for its result.
    pub async fn call(&self, target: &str, method: &str, params: Value) -> Result<Value> {
        self.send_rpc_request(target, method, params).await?.wait().await
    }

    /// [`Client::call`] with its own reply timeout.
    pub async fn call_with_timeout(
        &self,
        target: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.send_rpc_request(target, method, params)
            .await?
            .wait_for(timeout)
            .await
    }

    /// Broadcast `payload` to every subscriber of this client's path.
    pub async fn publish(&self, payload: Value) -> Result<()> {
        self.emit(EventKind::Publish, Envelope::broadcast(payload), self.config.emit_timeout)
            .await
            .map(drop)
    }

    /// Join `source`'s broadcast room. The callback is recorded only after the
    /// broker accepts, and replaces any earlier one for the same path.
    pub async fn subscribe<F>(&self, source: &str, callback: F) -> Result<()>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.emit(EventKind::Subscribe, Envelope::naming(source), self.config.emit_timeout)
            .await?;
        let _ = self.session.subscriptions.insert(source, Arc::new(callback));
        debug!(source, "subscribed");
        Ok(())
    }

    /// Stop invoking the callback for `source`. Broadcasts that still arrive
    /// are logged and dropped.
    pub fn unsubscribe(&self, source: &str) -> bool {
        self.session.subscriptions.remove(source)
    }

    /// Round-trip `message` through the broker back to this client.
    pub async fn echo(&self, message: Value) -> Result<Value> {
        self.session
            .engine
            .echo(self.path.as_str(), message, self.config.rpc_timeout)
            .await
    }

    /// Release this client's path without closing the connection.
    pub async fn unregister(&self) -> Result<()> {
        self.emit(EventKind::Unregister, Envelope::default(), self.config.emit_timeout)
            .await
            .map(drop)
    }

    /// Fail every pending waiter with [`BusError::Cancelled`], stop the
    /// background tasks and close the connection. Idempotent.
    pub async fn disconnect(&self) {
        self.session.shutdown().await;
        info!(path = %self.path, "disconnected");
    }

    /// Whether the link is gone.
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Outstanding acks, RPC replies and echoes.
    pub fn pending(&self) -> (usize, usize, usize) {
        let engine = &self.session.engine;
        (engine.pending_acks(), engine.pending_replies(), engine.pending_echoes())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("path", &self.path).finish()
    }
}

pub(crate) fn parse_path(raw: &str) -> Result<BusPath> {
    BusPath::parse(raw).map_err(|e| BusError::Protocol(format!("invalid path '{raw}': {e}")))
}

/// RPC parameters travel as a JSON object; `null` means none.
pub(crate) fn into_parameters(params: Value) -> Result<Map<String, Value>> {
    match params {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(BusError::InvalidParams(format!(
            "parameters must be a JSON object, got {other}"
        ))),
    }
}
