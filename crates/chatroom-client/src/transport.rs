//! Client side of the broker's WebSocket endpoint.

use async_trait::async_trait;
use chatroom_core::{Frame, Transport, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Transport`] over a tungstenite WebSocket, one JSON frame per text message.
pub struct WsTransport {
    sink: Mutex<SplitSink<Socket, Message>>,
    stream: Mutex<SplitStream<Socket>>,
}

impl WsTransport {
    /// Open a WebSocket to `url`.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Io(format!("{url}: {e}")))?;
        debug!(url, "websocket connected");
        let (sink, stream) = socket.split();
        Ok(Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
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
