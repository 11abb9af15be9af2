//! RPC method table and handler plumbing.

use std::collections::HashMap;
use std::sync::Arc;

use chatroom_core::wire::{HANDLER_FAULT, INVALID_PARAMS};
use chatroom_core::RpcErrorBody;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Error a handler reports back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Parameters missing or of the wrong type.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// The handler itself failed.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Handler failure with `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Wire error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::Failed(_) => HANDLER_FAULT,
        }
    }

    /// Error body sent in the `rpc_response`.
    pub fn to_body(&self) -> RpcErrorBody {
        let message = match self {
            Self::InvalidParams(m) | Self::Failed(m) => m.clone(),
        };
        RpcErrorBody::new(self.code(), message)
    }
}

/// Keyword-style access to an RPC call's parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Params(Map<String, Value>);

impl Params {
    /// Wrap a call's parameter object.
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Required parameter, deserialized into `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, HandlerError> {
        let value = self
            .0
            .get(name)
            .ok_or_else(|| HandlerError::InvalidParams(format!("missing parameter '{name}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| HandlerError::InvalidParams(format!("parameter '{name}': {e}")))
    }

    /// Optional parameter; absent and `null` both read as `None`.
    pub fn optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(name).map(Some),
        }
    }

    /// Required string parameter, borrowed.
    pub fn require_str(&self, name: &str) -> Result<&str, HandlerError> {
        match self.0.get(name) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(HandlerError::InvalidParams(format!(
                "parameter '{name}' must be a string"
            ))),
            None => Err(HandlerError::InvalidParams(format!("missing parameter '{name}'"))),
        }
    }

    /// Parameter as raw JSON.
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// All parameters.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Whether the call carried no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A synchronous RPC method. Runs on the blocking thread pool.
pub trait MethodHandler: Send + Sync + 'static {
    /// Handle one call.
    fn call(&self, params: &Params) -> Result<Value, HandlerError>;
}

impl<F> MethodHandler for F
where
    F: Fn(&Params) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    fn call(&self, params: &Params) -> Result<Value, HandlerError> {
        self(params)
    }
}

/// Method name to handler. Registering a name again replaces its handler.
#[derive(Default)]
pub struct MethodTable {
    handlers: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
}

impl MethodTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure under `name`.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Params) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register_handler(name, handler);
    }

    /// Register any [`MethodHandler`] under `name`.
    pub fn register_handler(&self, name: impl Into<String>, handler: impl MethodHandler) {
        let _ = self.handlers.write().insert(name.into(), Arc::new(handler));
    }

    /// Remove `name`; `false` if it was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    /// Handler for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.read().get(name).cloned()
    }

    /// Whether `name` has a handler.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Sorted method names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}
