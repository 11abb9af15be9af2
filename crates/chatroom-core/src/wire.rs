//! Wire format shared by broker and clients.
//!
//! Every message on a link is a [`Frame`]: a named event plus a JSON body.
//! Clients send [`Envelope`]s, the broker forwards [`Delivery`]s and answers
//! every envelope with an [`Ack`] whose event name is the envelope's `_uid`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::ids::{CorrelationId, EchoId, RequestId};
use crate::path::BROADCAST_TARGET;

/// RPC target has no handler for the method.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Parameters missing or of the wrong type.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Handler returned an error or panicked.
pub const HANDLER_FAULT: &str = "HANDLER_FAULT";

/// The event kinds a client may send to the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Claim a path.
    Register,
    /// Release the sender's path.
    Unregister,
    /// Call a method on another path.
    RpcRequest,
    /// Answer an earlier `rpc_request`.
    RpcResponse,
    /// Broadcast to the sender's room.
    Publish,
    /// Join another path's broadcast room.
    Subscribe,
    /// Round trip through the broker.
    Echo,
}

impl EventKind {
    /// Every kind, in wire order.
    pub const ALL: [EventKind; 7] = [
        Self::Register,
        Self::Unregister,
        Self::RpcRequest,
        Self::RpcResponse,
        Self::Publish,
        Self::Subscribe,
        Self::Echo,
    ];

    /// Event name on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Unregister => "unregister",
            Self::RpcRequest => "rpc_request",
            Self::RpcResponse => "rpc_response",
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
            Self::Echo => "echo",
        }
    }

    /// Kind named `name`, if any.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Kinds the broker forwards to another connection or room.
    pub fn is_routed(self) -> bool {
        matches!(self, Self::RpcRequest | Self::RpcResponse | Self::Publish | Self::Echo)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown event kind: {s}"))
    }
}

/// A named event with a JSON body, the unit the transport moves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Event name: a kind, or a `_uid` for acks.
    pub event: String,
    /// JSON body.
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    /// Frame with an already-built body.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Build a frame from any serializable body.
    pub fn with_body<T: Serialize>(event: impl Into<String>, body: &T) -> serde_json::Result<Self> {
        Ok(Self::new(event, serde_json::to_value(body)?))
    }

    /// Text form sent over the socket.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse the text form.
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// The event kind, if the event name is one.
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.event)
    }
}

/// Client to broker body: `{ "_uid", "path", "payload" }`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id the ack is sent under.
    #[serde(rename = "_uid", default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<CorrelationId>,
    /// Target path, or the path to register or subscribe to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Opaque body forwarded to the target.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    /// Envelope addressed to `path`.
    pub fn to(path: impl Into<String>, payload: Value) -> Self {
        Self {
            uid: None,
            path: Some(path.into()),
            payload,
        }
    }

    /// Envelope addressed to the sender's own broadcast room.
    pub fn broadcast(payload: Value) -> Self {
        Self::to(BROADCAST_TARGET, payload)
    }

    /// Envelope that only names a path (register / subscribe).
    pub fn naming(path: impl Into<String>) -> Self {
        Self::to(path, Value::Null)
    }

    /// Ask for an ack under `uid`.
    pub fn with_uid(mut self, uid: CorrelationId) -> Self {
        self.uid = Some(uid);
        self
    }
}

/// Broker to target body: the routed payload tagged with its source path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Path of the sender.
    pub path: String,
    /// The sender's payload, untouched.
    #[serde(default)]
    pub payload: Value,
}

/// Broker to sender acknowledgment, sent under the envelope's `_uid`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// Whether the envelope was accepted.
    pub success: bool,
    /// Rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    // Older brokers report failures under `message`.
    /// Rejection reason from older brokers.
    #[serde(default, skip_serializing)]
    pub message: Option<String>,
}

impl Ack {
    /// Accepted.
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// Refused for `error`.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            message: None,
        }
    }

    /// Broker-supplied reason for a rejection.
    pub fn reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "rejected by broker".into())
    }
}

/// `rpc_request` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    /// Id echoed back in the reply.
    pub id: RequestId,
    /// Handler name on the target.
    pub method: String,
    /// Named arguments.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Structured error carried in an `rpc_response`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// One of the error codes in this module.
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}

impl RpcErrorBody {
    /// Error with `code` and `message`.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// No handler named `method`.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }
}

/// `rpc_response` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    /// Id of the call this answers.
    pub id: RequestId,
    /// Handler result, null on failure.
    #[serde(default)]
    pub result: Value,
    /// Set when the call failed.
    #[serde(default, deserialize_with = "deserialize_error")]
    pub error: Option<RpcErrorBody>,
}

impl RpcReply {
    /// Successful reply to `id`.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    /// Failed reply to `id`.
    pub fn failure(id: RequestId, error: RpcErrorBody) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(error),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorField {
    Body(RpcErrorBody),
    Text(String),
}

// Peers that predate structured errors send a bare string.
fn deserialize_error<'de, D>(deserializer: D) -> Result<Option<RpcErrorBody>, D::Error>
where
    D: Deserializer<'de>,
{
    let field: Option<ErrorField> = Option::deserialize(deserializer)?;
    Ok(field.map(|f| match f {
        ErrorField::Body(body) => body,
        ErrorField::Text(message) => RpcErrorBody::new(HANDLER_FAULT, message),
    }))
}

/// `echo` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EchoBody {
    /// Id the echo is matched on.
    pub id: EchoId,
    /// Payload returned unchanged.
    #[serde(default)]
    pub message: Value,
}
