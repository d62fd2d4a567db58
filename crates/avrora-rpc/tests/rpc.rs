//! End-to-end sessions over in-memory transports.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

use avrora_codec::{read_framed, write_framed};
use avrora_rpc::{
    memory_pair, EmitterOptions, ListenerOptions, Protocol, ProtocolOptions, RpcError,
    SessionEvent, StatefulEmitter, StatefulListener, Value,
};
use avrora_schema::{cursor, Cursor};
use avrora_wire::{CallMetadata, HandshakeMatch, HandshakeRequest, HandshakeResponse};

const EMPTY: &str = r#"{"protocol":"Empty"}"#;

const MATH: &str = r#"{
    "protocol": "Math",
    "messages": {
        "negate": {"request": [{"name": "n", "type": "int"}], "response": "long"}
    }
}"#;

const MATH_CLIENT: &str = r#"{
    "protocol": "MathClient",
    "messages": {
        "negate": {"request": [{"name": "n", "type": "int"}], "response": "long"}
    }
}"#;

const DELAY: &str = r#"{
    "protocol": "Delay",
    "messages": {
        "wait": {
            "request": [{"name": "ms", "type": "float"}, {"name": "id", "type": "string"}],
            "response": "string"
        }
    }
}"#;

fn protocol(doc: &str) -> Protocol {
    Protocol::parse(doc, ProtocolOptions::default()).unwrap()
}

fn pair(client: &Protocol, server: &Protocol) -> (StatefulEmitter, StatefulListener) {
    let (a, b) = memory_pair();
    (
        client.create_emitter(a, EmitterOptions::default()),
        server.create_listener(b, ListenerOptions::default()),
    )
}

async fn next_event(events: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event stream closed")
}

fn negate_request(n: Value) -> Value {
    Value::record(vec![("n", n)])
}

fn delay_server() -> Protocol {
    let server = protocol(DELAY);
    server
        .on("wait", |req, _info| async move {
            let ms = req.field("ms").and_then(Value::as_f32).unwrap_or(0.0);
            let id = req
                .field("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if ms < 0.0 {
                return Err(Value::String("delay must be non-negative".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            Ok(Value::String(id))
        })
        .unwrap();
    server
}

#[tokio::test]
async fn handshake_both_then_clean_destroy() {
    let p = protocol(EMPTY);
    let (emitter, _listener) = pair(&p, &p);
    let mut events = emitter.take_events().unwrap();

    emitter.ready().await.unwrap();
    match next_event(&mut events).await {
        SessionEvent::Handshake { request, response } => {
            let request = request.unwrap();
            assert_eq!(request.client_hash, p.fingerprint().bytes());
            assert_eq!(request.server_hash, p.fingerprint().bytes());
            assert!(request.client_protocol.is_none());
            assert_eq!(response.match_, HandshakeMatch::Both);
            assert!(response.server_hash.is_none());
            assert!(response.server_protocol.is_none());
        }
        other => panic!("expected handshake, got {other:?}"),
    }

    emitter.destroy(false).await.unwrap();
    match next_event(&mut events).await {
        SessionEvent::EndOfTransmission { pending } => assert_eq!(pending, 0),
        other => panic!("expected end of transmission, got {other:?}"),
    }
    assert!(events.try_recv().is_err(), "no events may follow EOT");
}

#[tokio::test]
async fn negate_round_trip() {
    let p = protocol(MATH);
    let server = p.subprotocol();
    server
        .on("negate", |req, _info| async move {
            let n = req.field("n").and_then(Value::as_i32).expect("int argument");
            Ok(Value::Long(-i64::from(n)))
        })
        .unwrap();
    let (emitter, _listener) = pair(&p, &server);

    assert_eq!(
        emitter.emit("negate", negate_request(Value::Int(20))).await.unwrap(),
        Value::Long(-20)
    );

    // A request that does not match the declared field type fails before
    // touching the wire.
    let err = emitter
        .emit("negate", negate_request(Value::String("hi".to_string())))
        .await
        .unwrap_err();
    assert!(err.to_string().contains(r#"invalid "int""#), "{err}");
}

#[tokio::test]
async fn unknown_emit_fails_synchronously() {
    let p = protocol(MATH);
    let (emitter, _listener) = pair(&p, &p);
    let err = emitter.emit("mystery", Value::Record(vec![])).await.unwrap_err();
    assert!(matches!(err, RpcError::UnknownMessage(name) if name == "mystery"));
}

#[tokio::test]
async fn unhandled_message_is_reported_by_the_listener() {
    let p = protocol(MATH);
    let (emitter, _listener) = pair(&p, &p);
    let err = emitter
        .emit("negate", negate_request(Value::Int(1)))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, RpcError::Remote(m) if m == "unhandled message: negate"),
        "{err}"
    );
}

#[tokio::test]
async fn responses_complete_in_arrival_order() {
    let p = protocol(DELAY);
    let server = delay_server();
    let (emitter, _listener) = pair(&p, &server);
    let emitter = Arc::new(emitter);

    let log: Arc<Mutex<Vec<(&str, Result<Value, RpcError>)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut ids = Vec::new();
    let mut joins = Vec::new();
    for (ms, id) in [(300.0f32, "a"), (20.0, "b"), (-100.0, "c")] {
        let call = emitter
            .start_call(
                "wait",
                Value::record(vec![
                    ("ms", Value::Float(ms)),
                    ("id", Value::String(id.to_string())),
                ]),
            )
            .await
            .unwrap();
        ids.push(call.id());
        let log = Arc::clone(&log);
        joins.push(tokio::spawn(async move {
            let result = call.await;
            log.lock().push((id, result));
        }));
    }
    assert_eq!(ids, vec![1, 2, 3], "correlation ids are assigned in order");

    for join in joins {
        join.await.unwrap();
    }
    let log = log.lock();
    assert_eq!(log.len(), 3);
    // The negative delay fails immediately, the short delay resolves next,
    // the long delay last.
    assert_eq!(log[0].0, "c");
    assert!(
        matches!(&log[0].1, Err(RpcError::Remote(m)) if m.contains("non-negative")),
        "{:?}",
        log[0].1
    );
    assert_eq!(log[1].0, "b");
    assert_eq!(log[1].1.as_ref().unwrap().as_str(), Some("b"));
    assert_eq!(log[2].0, "a");
    assert_eq!(log[2].1.as_ref().unwrap().as_str(), Some("a"));
}

#[tokio::test]
async fn unknown_message_gets_string_branch_error() {
    let heartbeat = protocol(
        r#"{"protocol":"Heartbeat","messages":{"beat":{"request":[],"response":"int"}}}"#,
    );
    let (mut client, server_side) = memory_pair();
    let _listener = heartbeat.create_listener(server_side, ListenerOptions::default());

    // Handshake as a client running the listener's own protocol.
    let fp = heartbeat.fingerprint().bytes();
    let hs = HandshakeRequest {
        client_hash: fp,
        client_protocol: None,
        server_hash: fp,
        meta: Vec::new(),
    };
    let mut buf = Vec::new();
    hs.encode(&mut buf);
    write_framed(&mut client, &buf, 2048).await.unwrap();
    let reply = read_framed(&mut client).await.unwrap().unwrap();
    let mut cur = Cursor::new(&reply);
    let response = HandshakeResponse::decode(&mut cur).unwrap();
    assert_eq!(response.match_, HandshakeMatch::Both);

    // Call a message the listener does not declare.
    let mut call = Vec::new();
    CallMetadata::new(1).encode(&mut call);
    cursor::write_string(&mut call, "id");
    write_framed(&mut client, &call, 2048).await.unwrap();

    let reply = read_framed(&mut client).await.unwrap().unwrap();
    let mut cur = Cursor::new(&reply);
    let meta = CallMetadata::decode(&mut cur).unwrap();
    assert_eq!(meta.id, 1);
    assert!(cur.read_boolean().unwrap(), "tag 1: error");
    assert_eq!(cur.read_long().unwrap(), 0, "branch 0: string");
    assert_eq!(cur.read_string().unwrap(), "unknown message: id");
    assert!(cur.is_empty());
}

#[tokio::test]
async fn one_way_mismatch_fails_the_handshake() {
    let client_p = protocol(
        r#"{"protocol":"Heartbeat","messages":{"beat":{"request":[],"response":"null"}}}"#,
    );
    let server_p = protocol(
        r#"{"protocol":"Heartbeat","messages":{"beat":{"request":[],"response":"null","one-way":true}}}"#,
    );
    let (emitter, _listener) = pair(&client_p, &server_p);

    let err = emitter.emit("beat", Value::Record(vec![])).await.unwrap_err();
    assert!(matches!(err, RpcError::Handshake(_)), "{err}");
    assert!(err.to_string().contains("one-way"), "{err}");
}

#[tokio::test]
async fn handshake_client_match_after_retry() {
    let client_p = protocol(MATH_CLIENT);
    let server_p = protocol(MATH);
    server_p
        .on("negate", |req, _info| async move {
            let n = req.field("n").and_then(Value::as_i32).unwrap();
            Ok(Value::Long(-i64::from(n)))
        })
        .unwrap();
    let (emitter, _listener) = pair(&client_p, &server_p);
    let mut events = emitter.take_events().unwrap();

    assert_eq!(
        emitter.emit("negate", negate_request(Value::Int(4))).await.unwrap(),
        Value::Long(-4)
    );
    match next_event(&mut events).await {
        SessionEvent::Handshake { request, response } => {
            // Second round: the client protocol text was included.
            assert!(request.unwrap().client_protocol.is_some());
            assert_eq!(response.match_, HandshakeMatch::Client);
            assert_eq!(response.server_hash, Some(server_p.fingerprint().bytes()));
        }
        other => panic!("expected handshake, got {other:?}"),
    }
}

#[tokio::test]
async fn destroy_no_wait_interrupts_pending() {
    let p = protocol(DELAY);
    let server = delay_server();
    let (emitter, _listener) = pair(&p, &server);
    let mut events = emitter.take_events().unwrap();

    let wait = |ms: f32, id: &str| {
        Value::record(vec![
            ("ms", Value::Float(ms)),
            ("id", Value::String(id.to_string())),
        ])
    };
    let slow_a = emitter.start_call("wait", wait(60_000.0, "a")).await.unwrap();
    let quick = emitter.start_call("wait", wait(10.0, "b")).await.unwrap();
    let slow_c = emitter.start_call("wait", wait(60_000.0, "c")).await.unwrap();

    assert_eq!(quick.await.unwrap().as_str(), Some("b"));

    emitter.destroy(true).await.unwrap();
    assert!(matches!(slow_a.await, Err(RpcError::Interrupted)));
    assert!(matches!(slow_c.await, Err(RpcError::Interrupted)));

    match next_event(&mut events).await {
        SessionEvent::Handshake { .. } => {}
        other => panic!("expected handshake first, got {other:?}"),
    }
    match next_event(&mut events).await {
        SessionEvent::EndOfTransmission { pending } => assert_eq!(pending, 2),
        other => panic!("expected end of transmission, got {other:?}"),
    }
    assert!(events.try_recv().is_err(), "no events may follow EOT");
}

#[tokio::test]
async fn emits_after_destroy_are_rejected() {
    let p = protocol(MATH);
    let (emitter, _listener) = pair(&p, &p);
    emitter.destroy(false).await.unwrap();
    let err = emitter
        .emit("negate", negate_request(Value::Int(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Destroyed));
}

#[tokio::test]
async fn invalid_handshake_gets_none_response() {
    let p = protocol(EMPTY);
    let (mut client, server_side) = memory_pair();
    let listener = p.create_listener(server_side, ListenerOptions::default());
    let mut events = listener.take_events().unwrap();

    write_framed(&mut client, &[0xFF, 0x00, 0x01], 2048).await.unwrap();
    let reply = read_framed(&mut client).await.unwrap().unwrap();
    let mut cur = Cursor::new(&reply);
    let response = HandshakeResponse::decode(&mut cur).unwrap();
    assert_eq!(response.match_, HandshakeMatch::None);
    assert!(response.server_hash.is_none());

    match next_event(&mut events).await {
        SessionEvent::Handshake { request, .. } => assert!(request.is_none()),
        other => panic!("expected handshake event, got {other:?}"),
    }
}

#[tokio::test]
async fn listener_drains_outstanding_handlers_on_destroy() {
    let p = protocol(DELAY);
    let server = delay_server();
    let (emitter, listener) = pair(&p, &server);
    let mut events = listener.take_events().unwrap();

    let call = emitter
        .start_call(
            "wait",
            Value::record(vec![
                ("ms", Value::Float(50.0)),
                ("id", Value::String("x".to_string())),
            ]),
        )
        .await
        .unwrap();

    // Let the listener pick the request up before destroying it.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(listener.outstanding(), 1);
    listener.destroy(false).await.unwrap();

    assert_eq!(call.await.unwrap().as_str(), Some("x"));
    loop {
        match next_event(&mut events).await {
            SessionEvent::EndOfTransmission { pending } => {
                assert_eq!(pending, 0);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn stateless_emitter_round_trip() {
    let client_p = protocol(MATH_CLIENT);
    let server_p = protocol(MATH);
    server_p
        .on("negate", |req, _info| async move {
            let n = req.field("n").and_then(Value::as_i32).unwrap();
            Ok(Value::Long(-i64::from(n)))
        })
        .unwrap();

    let server_for_factory = server_p.clone();
    let factory = move || {
        let server = server_for_factory.clone();
        async move {
            let (local, remote) = memory_pair();
            let listener = server.create_stateless_listener(remote, ListenerOptions::default());
            tokio::spawn(listener.run());
            Ok::<_, std::io::Error>(local)
        }
    };
    let emitter = client_p.create_stateless_emitter(factory, EmitterOptions::default());
    let mut events = emitter.take_events().unwrap();

    // First call pays the NONE round and retries with the protocol text.
    assert_eq!(
        emitter.emit("negate", negate_request(Value::Int(21))).await.unwrap(),
        Value::Long(-21)
    );
    // The second call reuses the negotiated server fingerprint.
    assert_eq!(
        emitter.emit("negate", negate_request(Value::Int(2))).await.unwrap(),
        Value::Long(-2)
    );

    emitter.destroy(false).await.unwrap();
    let mut saw_eot = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::EndOfTransmission { pending } => {
                assert_eq!(pending, 0);
                assert!(!saw_eot, "EOT fired twice");
                saw_eot = true;
            }
            SessionEvent::Handshake { .. } | SessionEvent::Error(_) => {
                assert!(!saw_eot, "no events may follow EOT");
            }
        }
    }
    assert!(saw_eot);
}

#[tokio::test]
async fn stateless_destroy_interrupts_in_flight_calls() {
    let client_p = protocol(DELAY);
    // A factory whose channels never answer.
    let factory = move || async move {
        let (local, remote) = memory_pair();
        tokio::spawn(async move {
            // Hold the peer open without replying.
            let _keep = remote;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        Ok::<_, std::io::Error>(local)
    };
    let emitter = Arc::new(client_p.create_stateless_emitter(factory, EmitterOptions::default()));

    let in_flight = {
        let emitter = Arc::clone(&emitter);
        tokio::spawn(async move {
            emitter
                .emit(
                    "wait",
                    Value::record(vec![
                        ("ms", Value::Float(1.0)),
                        ("id", Value::String("x".to_string())),
                    ]),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    emitter.destroy(true).await.unwrap();
    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(RpcError::Interrupted)), "{result:?}");
}

#[tokio::test]
async fn correlation_ids_are_unique_and_increasing() {
    let p = protocol(MATH);
    let server = p.subprotocol();
    server
        .on("negate", |req, _info| async move {
            Ok(Value::Long(-i64::from(
                req.field("n").and_then(Value::as_i32).unwrap(),
            )))
        })
        .unwrap();
    let (emitter, _listener) = pair(&p, &server);

    let mut last = 0;
    for n in 0..10 {
        let call = emitter.start_call("negate", negate_request(Value::Int(n))).await.unwrap();
        assert!(call.id() > last, "ids must increase");
        last = call.id();
        call.await.unwrap();
    }
}

#[tokio::test]
async fn transport_end_interrupts_the_emitter() {
    let p = protocol(DELAY);
    let server = delay_server();
    let (a, b) = memory_pair();
    let emitter = p.create_emitter(a, EmitterOptions::default());
    let listener = server.create_listener(b, ListenerOptions::default());
    let mut events = emitter.take_events().unwrap();

    let call = emitter
        .start_call(
            "wait",
            Value::record(vec![
                ("ms", Value::Float(60_000.0)),
                ("id", Value::String("a".to_string())),
            ]),
        )
        .await
        .unwrap();

    // The server side goes away mid-call.
    listener.destroy(true).await.unwrap();
    drop(listener);

    assert!(matches!(call.await, Err(RpcError::Interrupted)));
    loop {
        match next_event(&mut events).await {
            SessionEvent::EndOfTransmission { pending } => {
                assert_eq!(pending, 1);
                break;
            }
            _ => continue,
        }
    }
}
