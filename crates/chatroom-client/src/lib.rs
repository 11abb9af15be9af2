//! # chatroom-client
//!
//! A participant on the bus: registers a path with the broker, calls and
//! serves RPC methods, publishes to and subscribes from broadcast rooms.
//!
//! - **Correlation**: `_uid` acks and request-id replies over shared completion slots
//! - **Methods**: handler table and a bounded worker pool on the blocking threads
//! - **Subscriptions**: source path to callback
//! - **Front ends**: async [`Client`] and thread-parking [`BlockingClient`]

#![deny(unsafe_code)]

/// Thread-parking client.
pub mod blocking;
/// Async client.
pub mod client;
/// Client configuration.
pub mod config;
/// Acks, replies and echoes.
pub mod correlation;
/// RPC handlers.
pub mod methods;
mod pool;
mod session;
/// Publish callbacks.
pub mod subscriptions;
/// WebSocket transport.
pub mod transport;

pub use blocking::BlockingClient;
pub use client::Client;
pub use config::ClientConfig;
pub use correlation::{CorrelationEngine, PendingRpc};
pub use methods::{HandlerError, MethodHandler, MethodTable, Params};
pub use subscriptions::SubscriptionTable;
pub use transport::WsTransport;
