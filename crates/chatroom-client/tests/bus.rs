//! Clients talking through an in-process broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatroom_broker::{Broker, BrokerConfig};
use chatroom_client::{Client, ClientConfig, HandlerError, Params};
use chatroom_core::wire::METHOD_NOT_FOUND;
use chatroom_core::{Ack, BusError, CorrelationId, Envelope, EventKind, Frame, Transport};
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn config(path: &str) -> ClientConfig {
    ClientConfig::new(path).with_timeouts(Duration::from_secs(5), Duration::from_secs(5))
}

async fn client(broker: &Broker, path: &str) -> Client {
    Client::with_transport(config(path), Arc::new(broker.connect_in_memory()))
        .await
        .unwrap()
}

fn broker() -> Broker {
    Broker::new(BrokerConfig::default())
}

async fn next_frame(transport: &dyn Transport) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), transport.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
}

async fn raw_emit(transport: &dyn Transport, kind: EventKind, envelope: Envelope) -> Ack {
    let uid = CorrelationId::new();
    let frame = Frame::with_body(kind.as_str(), &envelope.with_uid(uid.clone())).unwrap();
    transport.send(frame).await.unwrap();
    let ack = next_frame(transport).await;
    assert_eq!(ack.event, uid.as_str());
    serde_json::from_value(ack.data).unwrap()
}

fn echo_handler(params: &Params) -> Result<Value, HandlerError> {
    Ok(params.raw("message").cloned().unwrap_or(Value::Null))
}

#[tokio::test]
async fn echo_returns_the_message() {
    let broker = broker();
    let a = client(&broker, "svc.a").await;
    assert_eq!(a.echo(json!("hello")).await.unwrap(), json!("hello"));
    assert_eq!(
        a.echo(json!({"nested": [1, 2, 3]})).await.unwrap(),
        json!({"nested": [1, 2, 3]})
    );
    assert_eq!(a.pending(), (0, 0, 0));
}

#[tokio::test]
async fn rpc_round_trip() {
    let broker = broker();
    let server = client(&broker, "svc.math").await;
    server.register_method("add", |p: &Params| {
        let a: i64 = p.get("a")?;
        let b: i64 = p.get("b")?;
        Ok(json!(a + b))
    });
    let caller = client(&broker, "svc.caller").await;

    let sum = caller.call("svc.math", "add", json!({"a": 2, "b": 3})).await.unwrap();
    assert_eq!(sum, json!(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_concurrent_calls_keep_their_answers() {
    let broker = broker();
    let mut targets = Vec::new();
    for t in 0..10 {
        let target = client(&broker, &format!("svc.t{t}")).await;
        target.register_method("echo", echo_handler);
        targets.push(target);
    }
    let caller = client(&broker, "svc.caller").await;

    let calls = (0..100).map(|i| {
        let caller = &caller;
        async move {
            let target = format!("svc.t{}", i % 10);
            caller
                .call(&target, "echo", json!({"message": format!("msg-{i}")}))
                .await
        }
    });
    let results = join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(format!("msg-{i}")));
    }
    assert_eq!(caller.pending(), (0, 0, 0));
}

#[tokio::test]
async fn missing_method_is_reported_not_timed_out() {
    let broker = broker();
    let _server = client(&broker, "svc.b").await;
    let caller = client(&broker, "svc.a").await;

    let started = tokio::time::Instant::now();
    let err = caller.call("svc.b", "nope", json!({})).await.unwrap_err();
    assert!(matches!(&err, BusError::MethodNotFound(m) if m.contains("nope")), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn unknown_target_is_rejected_by_broker() {
    let broker = broker();
    let caller = client(&broker, "svc.a").await;
    let err = caller.call("svc.ghost", "m", json!({})).await.unwrap_err();
    match err {
        BusError::EmitRejected(reason) => assert!(reason.contains("svc.ghost"), "{reason}"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(caller.pending(), (0, 0, 0));
}

#[tokio::test]
async fn handler_failures_reach_the_caller() {
    let broker = broker();
    let server = client(&broker, "svc.b").await;
    server.register_method("boom", |_: &Params| -> Result<Value, HandlerError> {
        panic!("exploded")
    });
    server.register_method("refuse", |_: &Params| Err(HandlerError::failed("not today")));
    server.register_method("typed", |p: &Params| Ok(json!(p.get::<u32>("n")? * 2)));
    let caller = client(&broker, "svc.a").await;

    let err = caller.call("svc.b", "boom", json!({})).await.unwrap_err();
    assert!(matches!(&err, BusError::HandlerFault(m) if m.contains("exploded")), "{err:?}");

    let err = caller.call("svc.b", "refuse", json!({})).await.unwrap_err();
    assert!(matches!(&err, BusError::HandlerFault(m) if m == "not today"), "{err:?}");

    let err = caller.call("svc.b", "typed", json!({"n": "x"})).await.unwrap_err();
    assert!(matches!(err, BusError::InvalidParams(_)));

    // The server keeps serving after a panic.
    assert_eq!(caller.call("svc.b", "typed", json!({"n": 4})).await.unwrap(), json!(8));
}

#[tokio::test]
async fn publish_reaches_subscribers_in_order() {
    let broker = broker();
    let publisher = client(&broker, "svc.pub").await;
    let subscriber = client(&broker, "svc.sub").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber
        .subscribe("svc.pub", move |payload: &Value| {
            let _ = tx.send(payload.clone());
        })
        .await
        .unwrap();

    publisher.publish(json!({"n": 1})).await.unwrap();
    publisher.publish(json!({"n": 2})).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(first, Some(json!({"n": 1})));
    assert_eq!(second, Some(json!({"n": 2})));
}

#[tokio::test]
async fn publisher_does_not_hear_itself() {
    let broker = broker();
    let publisher = client(&broker, "svc.pub").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    publisher
        .subscribe("svc.pub", move |payload: &Value| {
            let _ = tx.send(payload.clone());
        })
        .await
        .unwrap();
    publisher.publish(json!("self")).await.unwrap();
    // The echo is a round trip through the same connection, so anything the
    // broker routed back would have arrived before it.
    assert_eq!(publisher.echo(json!("sync")).await.unwrap(), json!("sync"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn departed_subscriber_does_not_disturb_publishing() {
    let broker = broker();
    let publisher = client(&broker, "svc.a").await;
    let leaving = client(&broker, "svc.b").await;
    let staying = client(&broker, "svc.c").await;

    let heard = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&heard);
    leaving
        .subscribe("svc.a", move |_: &Value| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    staying
        .subscribe("svc.a", move |payload: &Value| {
            let _ = tx.send(payload.clone());
        })
        .await
        .unwrap();

    leaving.disconnect().await;
    for _ in 0..50 {
        if broker.router().hub().count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(broker.router().hub().count(), 2);

    publisher.publish(json!("after")).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(got, Some(json!("after")));
    assert_eq!(heard.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn superseded_client_loses_its_path() {
    let broker = broker();
    let first = client(&broker, "svc.shared").await;
    let _second = client(&broker, "svc.shared").await;
    let listener = client(&broker, "svc.listener").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    listener
        .subscribe("svc.shared", move |payload: &Value| {
            let _ = tx.send(payload.clone());
        })
        .await
        .unwrap();

    let err = first.publish(json!("stale")).await.unwrap_err();
    match err {
        BusError::EmitRejected(reason) => assert!(reason.contains("not registered"), "{reason}"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(listener.echo(json!("sync")).await.unwrap(), json!("sync"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn malformed_rpc_request_gets_method_not_found() {
    let broker = broker();
    let server = client(&broker, "svc.math").await;
    server.register_method("add", |_: &Params| Ok(json!(0)));

    let raw = broker.connect_in_memory();
    assert!(raw_emit(&raw, EventKind::Register, Envelope::naming("svc.raw")).await.success);
    let request = json!({"id": "r-bad", "method": "add", "parameters": "not an object"});
    let ack = raw_emit(&raw, EventKind::RpcRequest, Envelope::to("svc.math", request)).await;
    assert!(ack.success);

    let response = next_frame(&raw).await;
    assert_eq!(response.event, "rpc_response");
    assert_eq!(response.data["path"], "svc.math");
    assert_eq!(response.data["payload"]["id"], "r-bad");
    assert_eq!(response.data["payload"]["error"]["code"], METHOD_NOT_FOUND);
    assert_eq!(response.data["payload"]["error"]["message"], "Method not found: add");

    // The server keeps serving well-formed calls.
    let caller = client(&broker, "svc.caller").await;
    assert_eq!(caller.call("svc.math", "add", json!({})).await.unwrap(), json!(0));
}

#[tokio::test]
async fn last_registration_wins() {
    let broker = broker();
    let first = client(&broker, "svc.shared").await;
    first.register_method("who", |_: &Params| Ok(json!("first")));
    let second = client(&broker, "svc.shared").await;
    second.register_method("who", |_: &Params| Ok(json!("second")));
    let caller = client(&broker, "svc.caller").await;

    assert_eq!(caller.call("svc.shared", "who", json!({})).await.unwrap(), json!("second"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_call_forgets_its_waiter() {
    let broker = broker();
    let server = client(&broker, "svc.slow").await;
    server.register_method("slow", |_: &Params| {
        std::thread::sleep(Duration::from_millis(300));
        Ok(json!("late"))
    });
    server.register_method("fast", |_: &Params| Ok(json!("fast")));
    let caller = client(&broker, "svc.caller").await;

    let err = caller
        .call_with_timeout("svc.slow", "slow", json!({}), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Timeout(_)));
    assert_eq!(caller.pending().1, 0);

    // The late reply is dropped and the client stays usable.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(caller.call("svc.slow", "fast", json!({})).await.unwrap(), json!("fast"));
    assert_eq!(caller.pending(), (0, 0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_cancels_in_flight_calls() {
    let broker = broker();
    let server = client(&broker, "svc.slow").await;
    server.register_method("slow", |_: &Params| {
        std::thread::sleep(Duration::from_millis(500));
        Ok(Value::Null)
    });
    let caller = Arc::new(client(&broker, "svc.caller").await);

    let pending = caller.send_rpc_request("svc.slow", "slow", json!({})).await.unwrap();
    let waiting = tokio::spawn(pending.wait());
    caller.disconnect().await;

    assert!(matches!(waiting.await.unwrap(), Err(BusError::Cancelled)));
    assert!(caller.is_closed());
    assert!(caller.echo(json!(1)).await.is_err());
}

#[tokio::test]
async fn unregister_releases_the_path() {
    let broker = broker();
    let server = client(&broker, "svc.b").await;
    server.register_method("ping", |_: &Params| Ok(json!("pong")));
    let caller = client(&broker, "svc.a").await;
    assert_eq!(caller.call("svc.b", "ping", json!({})).await.unwrap(), json!("pong"));

    server.unregister().await.unwrap();
    let err = caller.call("svc.b", "ping", json!({})).await.unwrap_err();
    assert!(matches!(err, BusError::EmitRejected(_)));
}

#[tokio::test]
async fn disconnect_releases_the_path() {
    let broker = broker();
    let server = client(&broker, "svc.b").await;
    let caller = client(&broker, "svc.a").await;
    server.disconnect().await;

    // The broker notices the closed link asynchronously.
    let mut last = None;
    for _ in 0..50 {
        match caller
            .call_with_timeout("svc.b", "ping", json!({}), Duration::from_millis(100))
            .await
        {
            Err(BusError::EmitRejected(reason)) => {
                last = Some(reason);
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    assert!(last.unwrap().contains("svc.b"));
}

#[tokio::test]
async fn reserved_path_is_refused_locally() {
    let broker = broker();
    let result = Client::with_transport(config("broadcast"), Arc::new(broker.connect_in_memory())).await;
    assert!(matches!(result, Err(BusError::Protocol(_))));
}
