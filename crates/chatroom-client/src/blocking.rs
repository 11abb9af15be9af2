//! Thread-blocking client for callers outside an async runtime.
//!
//! I/O runs on a private single-worker runtime. Calls park the calling
//! thread on a condition variable until the matching reply lands, so they
//! must not be made from inside a Tokio runtime thread. RPC handlers run on
//! the blocking pool and may use another `BlockingClient` freely.

use std::sync::Arc;
use std::time::Duration;

use chatroom_core::{Ack, BusError, BusPath, Envelope, EventKind, Result, Transport, TransportError};
use chatroom_discovery::Resolver;
use serde_json::Value;
use tokio::runtime::Runtime;
use tracing::info;

use crate::client::{into_parameters, parse_path};
use crate::config::ClientConfig;
use crate::correlation::PendingRpc;
use crate::methods::{HandlerError, MethodHandler, Params};
use crate::session::Session;
use crate::transport::WsTransport;

/// Bus client for synchronous code.
///
/// Owns a small runtime for its link; every call parks the calling thread.
/// Safe to use from inside an RPC handler of another client.
pub struct BlockingClient {
    path: BusPath,
    config: ClientConfig,
    session: Session,
    runtime: Option<Runtime>,
}

impl BlockingClient {
    /// Resolve the broker, open a WebSocket and register `config.path`.
    pub fn connect(config: ClientConfig, resolver: &dyn Resolver) -> Result<Self> {
        let runtime = io_runtime()?;
        let transport = runtime.block_on(async {
            let service = resolver
                .resolve(&config.broker_name, config.discovery_timeout)
                .await?;
            info!(broker = %service, "resolved broker");
            WsTransport::connect(&service.ws_url())
                .await
                .map_err(BusError::from)
        })?;
        Self::start(config, Arc::new(transport), runtime)
    }

    /// Register over an already open link. Background tasks for the link run
    /// on this client's own runtime.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::start(config, transport, io_runtime()?)
    }

    fn start(config: ClientConfig, transport: Arc<dyn Transport>, runtime: Runtime) -> Result<Self> {
        let path = parse_path(&config.path)?;
        let session = {
            let _entered = runtime.enter();
            Session::start(transport, &config)
        };
        let mut client = Self {
            path,
            config,
            session,
            runtime: Some(runtime),
        };
        let registered = client.session.engine.emit_blocking(
            EventKind::Register,
            Envelope::naming(client.path.as_str()),
            client.config.emit_timeout,
        );
        if let Err(e) = registered {
            client.shutdown();
            return Err(e);
        }
        info!(path = %client.path, "registered");
        Ok(client)
    }

    /// The path this client registered.
    pub fn path(&self) -> &BusPath {
        &self.path
    }

    /// Settings the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Serve `name` with a closure.
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

    /// Send a raw envelope and wait for the broker's ack.
    pub fn emit(&self, kind: EventKind, envelope: Envelope, timeout: Duration) -> Result<Ack> {
        self.session.engine.emit_blocking(kind, envelope, timeout)
    }

    /// Returns once the broker accepts the request; wait on the handle with
    /// [`PendingRpc::wait_blocking`].
    pub fn send_rpc_request(&self, target: &str, method: &str, params: Value) -> Result<PendingRpc> {
        let parameters = into_parameters(params)?;
        self.session
            .engine
            .send_rpc_request_blocking(target, method, parameters)
    }

    /// Call `method` on `target` and wait for its result.
    pub fn call(&self, target: &str, method: &str, params: Value) -> Result<Value> {
        self.send_rpc_request(target, method, params)?.wait_blocking()
    }

    /// [`BlockingClient::call`] with its own reply timeout.
    pub fn call_with_timeout(
        &self,
        target: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.send_rpc_request(target, method, params)?
            .wait_blocking_for(timeout)
    }

    /// Broadcast `payload` to this path's subscribers.
    pub fn publish(&self, payload: Value) -> Result<()> {
        self.emit(EventKind::Publish, Envelope::broadcast(payload), self.config.emit_timeout)
            .map(drop)
    }

    /// Callbacks run on the I/O thread and should return quickly.
    pub fn subscribe<F>(&self, source: &str, callback: F) -> Result<()>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.emit(EventKind::Subscribe, Envelope::naming(source), self.config.emit_timeout)?;
        let _ = self.session.subscriptions.insert(source, Arc::new(callback));
        Ok(())
    }

    /// Stop invoking the callback for `source`.
    pub fn unsubscribe(&self, source: &str) -> bool {
        self.session.subscriptions.remove(source)
    }

    /// Round-trip `message` through the broker.
    pub fn echo(&self, message: Value) -> Result<Value> {
        self.session
            .engine
            .echo_blocking(self.path.as_str(), message, self.config.rpc_timeout)
    }

    /// Release this client's path without closing the link.
    pub fn unregister(&self) -> Result<()> {
        self.emit(EventKind::Unregister, Envelope::default(), self.config.emit_timeout)
            .map(drop)
    }

    /// Cancel pending waiters, close the link and stop the runtime.
    pub fn disconnect(mut self) {
        self.shutdown();
        info!(path = %self.path, "disconnected");
    }

    fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.block_on(self.session.shutdown());
            runtime.shutdown_background();
        }
    }
}

impl Drop for BlockingClient {
    fn drop(&mut self) {
        // Dropping may happen inside an async context, where blocking on the
        // runtime is not allowed.
        let _ = self.session.engine.cancel_all();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn io_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("chatroom-io")
        .enable_all()
        .build()
        .map_err(|e| BusError::Transport(TransportError::Io(e.to_string())))
}
