//! # chatroom-broker
//!
//! The central broker of the chatroom bus.
//!
//! - **Path registry**: `path -> connection`, last writer wins, plus broadcast rooms
//! - **Connection hub**: bounded per-connection outbound queues
//! - **Router**: acks every envelope under its `_uid`, forwards routed kinds
//! - **Server**: axum `/ws` and `/health`, in-memory connections, graceful shutdown

#![deny(unsafe_code)]

/// Broker configuration.
pub mod config;
mod connection;
/// Connection queues.
pub mod hub;
/// Paths and rooms.
pub mod registry;
/// Frame handling.
pub mod router;
/// HTTP and WebSocket front end.
pub mod server;
/// Graceful shutdown.
pub mod shutdown;

pub use config::BrokerConfig;
pub use hub::ConnectionHub;
pub use registry::{PathRegistry, Registered};
pub use router::MessageRouter;
pub use server::{Broker, BrokerError, BrokerHandle, HealthResponse};
pub use shutdown::ShutdownCoordinator;
