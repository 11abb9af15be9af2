//! The per-connection loop shared by WebSocket and in-memory links.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use chatroom_core::{Frame, Transport, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::MessageRouter;

/// How long the writer may keep flushing after the reader has stopped.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Read frames from `transport` and hand them to the router, one at a time,
/// until the peer leaves or `cancel` fires. Outbound frames queued in the hub
/// are written by a companion task.
///
/// The router's cleanup for this connection completes before this returns.
pub(crate) async fn serve_connection(
    transport: Arc<dyn Transport>,
    router: Arc<MessageRouter>,
    cancel: CancellationToken,
) {
    let (conn_id, mut outbound) = router.hub().open();
    info!(conn_id = %conn_id, "connection opened");

    let writer_transport = Arc::clone(&transport);
    let writer_conn = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = writer_transport.send(frame).await {
                debug!(conn_id = %writer_conn, error = %e, "write failed");
                break;
            }
        }
    });

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport.recv() => received,
        };
        match received {
            Ok(Some(frame)) => router.handle(&conn_id, frame),
            Ok(None) => break,
            Err(TransportError::Codec(e)) => {
                warn!(conn_id = %conn_id, error = %e, "undecodable frame, dropping");
            }
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "read failed");
                break;
            }
        }
    }

    router.disconnect(&conn_id);

    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        abort.abort();
    }
    transport.close().await;
    info!(conn_id = %conn_id, "connection closed");
}

/// Server side of an upgraded WebSocket, one JSON frame per text message.
pub(crate) struct SocketTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
}

impl SocketTransport {
    pub(crate) fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let text = frame
            .encode()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    async fn recv(&self) -> Result<Option<Frame>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            let text = match stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Err(e)) => return Err(TransportError::ConnectionLost(e.to_string())),
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                Some(Ok(Message::Binary(bytes))) => String::from_utf8(bytes.to_vec())
                    .map_err(|e| TransportError::Codec(e.to_string()))?,
                Some(Ok(_)) => continue,
            };
            return Frame::decode(&text)
                .map(Some)
                .map_err(|e| TransportError::Codec(e.to_string()));
        }
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}
