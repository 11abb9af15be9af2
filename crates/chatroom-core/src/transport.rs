//! # Transport Abstraction
//!
//! A minimal async interface for moving named-event frames over one link.
//!
//! - **Frame-Oriented**: the transport carries [`Frame`]s and knows nothing about
//!   correlation, rooms, or RPC.
//! - **At-most-once**: a failed send is reported, never retried here.
//! - **Ordered per link**: frames arrive in the order they were sent.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::wire::Frame;

/// Errors that occur at the link layer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The link was closed locally.
    #[error("transport closed")]
    Closed,
    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
    /// Generic I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Result of a transport operation.
pub type Result<T> = std::result::Result<T, TransportError>;

/// One bidirectional link carrying frames.
///
/// Object-safe so it can be shared as `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queue a frame for the peer.
    async fn send(&self, frame: Frame) -> Result<()>;

    /// Next frame from the peer; `Ok(None)` once the peer has gone away.
    async fn recv(&self) -> Result<Option<Frame>>;

    /// Close the link. Idempotent.
    async fn close(&self);
}

/// A duplex channel transport over tokio mpsc channels.
///
/// Frames sent on one end appear on the other end's `recv` and vice versa.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Frame>>>,
}

impl ChannelTransport {
    /// One end built from raw channel halves.
    pub fn new(tx: mpsc::UnboundedSender<Frame>, rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Two transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: Frame) -> Result<()> {
        let guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(TransportError::Closed);
        };
        tx.send(frame)
            .map_err(|_| TransportError::ConnectionLost("channel closed".into()))
    }

    async fn recv(&self) -> Result<Option<Frame>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) {
        // Dropping the sender ends the peer's receive stream.
        let _ = self.tx.lock().await.take();
    }
}
