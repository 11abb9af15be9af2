//! # chatroom-core
//!
//! Shared vocabulary for the chatroom bus: everything both the broker and the
//! clients need to agree on.
//!
//! - **Wire types**: `Frame`, `Envelope`, `EventKind`, `Ack`, RPC call/reply bodies
//! - **Branded IDs**: `CorrelationId`, `RequestId`, `EchoId`, `ConnectionId`
//! - **Paths**: `BusPath` and broadcast-room naming
//! - **Waiters**: single-assignment completion slots and the pending map built on them
//! - **Transport**: the byte-free, frame-oriented `Transport` trait and an in-memory duplex
//! - **Errors**: `BusError` taxonomy
//! - **Settings**: layered configuration (defaults, JSON file, environment)

#![deny(unsafe_code)]

/// Error taxonomy.
pub mod errors;
/// Branded ids.
pub mod ids;
/// Paths and rooms.
pub mod path;
/// Layered settings.
pub mod settings;
/// Frame transports.
pub mod transport;
/// Single-shot waiters.
pub mod waiter;
/// Wire format.
pub mod wire;

pub use errors::{BusError, Result};
pub use ids::{ConnectionId, CorrelationId, EchoId, RequestId};
pub use path::{BusPath, RoomName, BROADCAST_TARGET};
pub use transport::{ChannelTransport, Transport, TransportError};
pub use waiter::{PendingMap, WaitError, Waiter};
pub use wire::{Ack, Delivery, EchoBody, Envelope, EventKind, Frame, RpcCall, RpcErrorBody, RpcReply};
