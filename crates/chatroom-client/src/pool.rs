//! Bounded worker pool for incoming RPC requests.
//!
//! Handlers run on the blocking thread pool, at most `workers` at a time.
//! When the queue is full, [`WorkerPool::submit`] waits, which stalls the
//! pump until a worker frees up. Replies are emitted from detached tasks so a
//! worker never waits on the broker's ack.

use std::any::Any;
use std::sync::Arc;

use chatroom_core::wire::HANDLER_FAULT;
use chatroom_core::{Envelope, EventKind, RequestId, RpcCall, RpcErrorBody, RpcReply};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::correlation::CorrelationEngine;
use crate::methods::{MethodTable, Params};

/// An accepted request and the path that sent it.
#[derive(Debug)]
pub(crate) struct Job {
    pub source: String,
    pub call: RpcCall,
}

pub(crate) struct WorkerPool {
    tx: mpsc::Sender<Job>,
    engine: Arc<CorrelationEngine>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub(crate) fn start(
        workers: usize,
        queue: usize,
        methods: Arc<MethodTable>,
        engine: Arc<CorrelationEngine>,
        tracker: &TaskTracker,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers.max(1) {
            let _ = tracker.spawn(worker_loop(
                worker,
                Arc::clone(&rx),
                Arc::clone(&methods),
                Arc::clone(&engine),
                tracker.clone(),
            ));
        }
        Self {
            tx,
            engine,
            tracker: tracker.clone(),
        }
    }

    /// Queue a job, waiting for room. `false` once the workers are gone.
    pub(crate) async fn submit(&self, job: Job) -> bool {
        self.tx.send(job).await.is_ok()
    }

    /// Send `reply` to `source` without going through a worker.
    pub(crate) fn reply(&self, source: String, reply: RpcReply) {
        respond(&self.tracker, Arc::clone(&self.engine), source, reply);
    }
}

/// Reply for an `rpc_request` payload that is not a valid call.
///
/// Only possible when the payload still names a string `id`; the error
/// names the method, or `None` when that is missing too.
pub(crate) fn reject_malformed(payload: &Value) -> Option<RpcReply> {
    let id = payload.get("id")?.as_str()?;
    let method = payload.get("method").and_then(Value::as_str).unwrap_or("None");
    Some(RpcReply::failure(
        RequestId::from_raw(id),
        RpcErrorBody::method_not_found(method),
    ))
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    methods: Arc<MethodTable>,
    engine: Arc<CorrelationEngine>,
    tracker: TaskTracker,
) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(Job { source, call }) = job else {
            break;
        };
        debug!(worker, method = %call.method, source = %source, "handling rpc_request");
        let reply = execute(&methods, call).await;
        respond(&tracker, Arc::clone(&engine), source, reply);
    }
    debug!(worker, "rpc worker stopped");
}

/// Run the handler for `call` and build its reply.
pub(crate) async fn execute(methods: &MethodTable, call: RpcCall) -> RpcReply {
    let RpcCall { id, method, parameters } = call;
    let Some(handler) = methods.get(&method) else {
        warn!(method = %method, "no handler registered");
        return RpcReply::failure(id, RpcErrorBody::method_not_found(&method));
    };
    let params = Params::new(parameters);
    match tokio::task::spawn_blocking(move || handler.call(&params)).await {
        Ok(Ok(result)) => RpcReply::success(id, result),
        Ok(Err(e)) => {
            warn!(method = %method, error = %e, "handler returned an error");
            RpcReply::failure(id, e.to_body())
        }
        Err(join) => {
            let message = if join.is_panic() {
                panic_message(join.into_panic())
            } else {
                "handler cancelled".to_owned()
            };
            error!(method = %method, panic = %message, "handler panicked");
            RpcReply::failure(id, RpcErrorBody::new(HANDLER_FAULT, message))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

fn respond(tracker: &TaskTracker, engine: Arc<CorrelationEngine>, source: String, reply: RpcReply) {
    let _ = tracker.spawn(async move {
        let payload = match serde_json::to_value(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode rpc_response");
                return;
            }
        };
        let timeout = engine.emit_timeout();
        if let Err(e) = engine
            .emit(EventKind::RpcResponse, Envelope::to(source.as_str(), payload), timeout)
            .await
        {
            warn!(target_path = %source, id = %reply.id, error = %e, "rpc_response not delivered");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::HandlerError;
    use chatroom_core::wire::{INVALID_PARAMS, METHOD_NOT_FOUND};
    use serde_json::json;

    fn call(method: &str, params: Value) -> RpcCall {
        let Value::Object(parameters) = params else {
            panic!("params must be an object");
        };
        RpcCall {
            id: RequestId::new(),
            method: method.into(),
            parameters,
        }
    }

    fn table() -> MethodTable {
        let table = MethodTable::new();
        table.register("add", |p: &Params| {
            let a: i64 = p.get("a")?;
            let b: i64 = p.get("b")?;
            Ok(json!(a + b))
        });
        table.register("fail", |_: &Params| Err(HandlerError::failed("nope")));
        table.register("panic", |_: &Params| -> Result<Value, HandlerError> {
            panic!("boom")
        });
        table
    }

    #[tokio::test]
    async fn successful_call() {
        let reply = execute(&table(), call("add", json!({"a": 2, "b": 3}))).await;
        assert_eq!(reply.result, json!(5));
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn unknown_method() {
        let reply = execute(&table(), call("missing", json!({}))).await;
        assert_eq!(reply.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_params() {
        let reply = execute(&table(), call("add", json!({"a": 1}))).await;
        assert_eq!(reply.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn handler_error_and_panic_are_faults() {
        let failed = execute(&table(), call("fail", json!({}))).await;
        assert_eq!(failed.error.unwrap(), RpcErrorBody::new(HANDLER_FAULT, "nope"));

        let panicked = execute(&table(), call("panic", json!({}))).await;
        let err = panicked.error.unwrap();
        assert_eq!(err.code, HANDLER_FAULT);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn malformed_call_with_id_is_answered() {
        let reply = reject_malformed(&json!({"id": "r1", "method": "add", "parameters": "x"})).unwrap();
        assert_eq!(reply.id, RequestId::from_raw("r1"));
        let err = reply.error.unwrap();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert_eq!(err.message, "Method not found: add");

        let reply = reject_malformed(&json!({"id": "r2"})).unwrap();
        assert_eq!(reply.error.unwrap().message, "Method not found: None");
    }

    #[test]
    fn malformed_call_without_id_is_ignored() {
        assert!(reject_malformed(&json!({"method": "add"})).is_none());
        assert!(reject_malformed(&json!({"id": 7, "method": "add"})).is_none());
        assert!(reject_malformed(&json!("junk")).is_none());
    }

    #[tokio::test]
    async fn pool_replies_to_source() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = Arc::new(CorrelationEngine::new(
            tx,
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(5),
        ));
        let tracker = TaskTracker::new();
        let pool = WorkerPool::start(2, 4, Arc::new(table()), Arc::clone(&engine), &tracker);
        let job = Job {
            source: "svc.caller".into(),
            call: call("add", json!({"a": 1, "b": 1})),
        };
        let id = job.call.id.clone();
        assert!(pool.submit(job).await);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "rpc_response");
        assert_eq!(frame.data["path"], "svc.caller");
        let reply: RpcReply = serde_json::from_value(frame.data["payload"].clone()).unwrap();
        assert_eq!(reply.id, id);
        assert_eq!(reply.result, json!(2));

        drop(pool);
        let _ = engine.cancel_all();
        tracker.close();
        tracker.wait().await;
    }
}
