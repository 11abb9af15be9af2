use std::time::Duration;

use crate::transport::TransportError;
use crate::wire::{RpcErrorBody, HANDLER_FAULT, INVALID_PARAMS, METHOD_NOT_FOUND};

/// Errors surfaced to the caller of a bus operation.
///
/// Nothing here is fatal to the process; the worst case is a reported error
/// to the caller that issued the operation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BusError {
    // Retryable
    /// No ack or reply arrived in time.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// The link to the broker failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    // Reported by the broker or the RPC target
    /// The broker refused the envelope; carries its reason.
    #[error("rejected by broker: {0}")]
    EmitRejected(String),
    /// The RPC target has no handler for the method.
    #[error("{0}")]
    MethodNotFound(String),
    /// The remote handler failed or panicked.
    #[error("handler fault: {0}")]
    HandlerFault(String),
    /// The remote handler rejected the parameters.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    // Local
    /// A completion named an id nothing was waiting for.
    #[error("no pending entry for id {0}")]
    RegistryInconsistency(String),
    /// A frame or payload did not decode.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The broker could not be located.
    #[error("discovery failed: {0}")]
    Discovery(String),
    /// The client shut down while the operation was pending.
    #[error("cancelled")]
    Cancelled,
}

impl BusError {
    /// Whether repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::EmitRejected(_) => "emit_rejected",
            Self::MethodNotFound(_) => "method_not_found",
            Self::HandlerFault(_) => "handler_fault",
            Self::InvalidParams(_) => "invalid_params",
            Self::RegistryInconsistency(_) => "registry_inconsistency",
            Self::Protocol(_) => "protocol",
            Self::Discovery(_) => "discovery",
            Self::Cancelled => "cancelled",
        }
    }

    /// Map the error carried by an `rpc_response` to the caller-facing kind.
    pub fn from_remote(body: RpcErrorBody) -> Self {
        match body.code.as_str() {
            METHOD_NOT_FOUND => Self::MethodNotFound(body.message),
            INVALID_PARAMS => Self::InvalidParams(body.message),
            HANDLER_FAULT => Self::HandlerFault(body.message),
            other => Self::HandlerFault(format!("{other}: {}", body.message)),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Result of a bus operation.
pub type Result<T> = std::result::Result<T, BusError>;
