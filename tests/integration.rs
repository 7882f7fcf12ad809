//! Integration tests for korv.
//!
//! These run a real server session against real clients, over in-memory
//! duplex channels and over TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use korv::codec::{Codec, CodecConfig, Format};
use korv::protocol::{build_frame, FrameBuffer};
use korv::transport::{Endpoint, Listener};
use korv::{
    BlockingClient, Client, ClientBuilder, KorvError, MessageId, Reply, Request, Response, Server,
    SessionState, Status, Verb,
};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Run `server` on its own runtime thread and attach a blocking client to it.
fn blocking_pair(server: Server) -> (BlockingClient, thread::JoinHandle<()>) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);

    let server_thread = thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime
            .block_on(server.serve_connection(server_end))
            .unwrap();
    });

    let client = ClientBuilder::new().attach_blocking(client_end).unwrap();
    (client, server_thread)
}

fn hello_server() -> Server {
    Server::builder()
        .route(Verb::Get, "/hello", |_| Ok(Reply::ok(json!({"msg": "Hello World!"}))))
        .build()
}

/// Write raw requests to a server session and collect every response it
/// sends before closing.
async fn exchange_raw(server: Server, messages: &[Value]) -> Vec<Response> {
    let codec = Codec::default();
    let (mut client_end, server_end) = tokio::io::duplex(64 * 1024);
    let session = tokio::spawn(async move { server.serve_connection(server_end).await });

    for message in messages {
        let payload = codec.encode(message).unwrap();
        client_end.write_all(&build_frame(&payload).unwrap()).await.unwrap();
    }
    client_end.shutdown().await.unwrap();

    let responses = read_responses(&mut client_end, &codec).await;
    session.await.unwrap().unwrap();
    responses
}

async fn read_responses(stream: &mut DuplexStream, codec: &Codec) -> Vec<Response> {
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await.unwrap();

    let mut frames = FrameBuffer::new();
    frames
        .push(&bytes)
        .unwrap()
        .iter()
        .map(|payload| codec.decode(payload).unwrap())
        .collect()
}

// ==================== Blocking client scenarios ====================

#[test]
fn test_blocking_hello_world() {
    let (client, server_thread) = blocking_pair(hello_server());

    let response = client.call(Verb::Get, "/hello", None).unwrap();
    assert_eq!(response.code, Status::OK);
    assert_eq!(response.body, Some(json!({"msg": "Hello World!"})));
    assert_eq!(response.request_id, MessageId::Number(1));

    client.close();
    server_thread.join().unwrap();
}

#[test]
fn test_store_without_body_is_rejected_before_dispatch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let server = Server::builder()
        .route(Verb::Store, "/item", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Reply::status(200))
        })
        .build();
    let (client, server_thread) = blocking_pair(server);

    let response = client.call(Verb::Store, "/item", None).unwrap();
    assert_eq!(response.code, Status::BAD_REQUEST);
    assert_eq!(response.message(), Some("Missing 'body'"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    client.close();
    server_thread.join().unwrap();
}

#[test]
fn test_delete_unregistered_resource_is_404() {
    let (client, server_thread) = blocking_pair(hello_server());

    let response = client.delete("/missing").unwrap();
    assert_eq!(response.code, Status::NOT_FOUND);

    client.close();
    server_thread.join().unwrap();
}

#[test]
fn test_handler_error_is_500_with_message() {
    let server = Server::builder()
        .route(Verb::Update, "/broken", |_| Err(anyhow!("database unavailable")))
        .diagnostics(false)
        .build();
    let (client, server_thread) = blocking_pair(server);

    let response = client.update("/broken", json!({"x": 1})).unwrap();
    assert_eq!(response.code, Status::INTERNAL_ERROR);
    assert_eq!(response.message(), Some("database unavailable"));
    assert!(response.body.unwrap().get("traceback").is_none());

    client.close();
    server_thread.join().unwrap();
}

#[test]
fn test_diagnostics_add_traceback_to_500() {
    let server = Server::builder()
        .route(Verb::Get, "/broken", |_| {
            Err(anyhow!("disk full").context("writing snapshot"))
        })
        .diagnostics(true)
        .build();
    let (client, server_thread) = blocking_pair(server);

    let response = client.get("/broken").unwrap();
    let body = response.body.unwrap();
    assert_eq!(body["message"], "writing snapshot");
    assert!(body["traceback"].as_str().unwrap().contains("disk full"));

    client.close();
    server_thread.join().unwrap();
}

#[test]
fn test_concurrent_blocking_calls_resolve_out_of_order() {
    let server = Server::builder()
        .route(Verb::Get, "/slow", |_| {
            thread::sleep(Duration::from_millis(150));
            Ok(Reply::ok(json!({"msg": "slow"})))
        })
        .route(Verb::Get, "/fast", |_| Ok(Reply::ok(json!({"msg": "fast"}))))
        .build();
    let (client, server_thread) = blocking_pair(server);
    let finished = Arc::new(parking_lot::Mutex::new(Vec::new()));

    thread::scope(|scope| {
        let slow = scope.spawn(|| {
            let response = client.get("/slow").unwrap();
            finished.lock().push("slow");
            response
        });
        let fast = scope.spawn(|| {
            thread::sleep(Duration::from_millis(30));
            let response = client.get("/fast").unwrap();
            finished.lock().push("fast");
            response
        });

        assert_eq!(slow.join().unwrap().body, Some(json!({"msg": "slow"})));
        assert_eq!(fast.join().unwrap().body, Some(json!({"msg": "fast"})));
    });

    assert_eq!(*finished.lock(), vec!["fast", "slow"]);
    assert_eq!(client.pending(), 0);

    client.close();
    server_thread.join().unwrap();
}

#[test]
fn test_blocking_callback_mode() {
    let (client, server_thread) = blocking_pair(hello_server());
    let (tx, rx) = std::sync::mpsc::channel();

    let id = client
        .call_with(Verb::Get, "/hello", None, move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();

    let response = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(response.request_id, id);
    assert_eq!(response.code, Status::OK);

    client.close();
    server_thread.join().unwrap();
}

#[test]
fn test_blocking_call_times_out() {
    let server = Server::builder()
        .route(Verb::Get, "/stuck", |_| {
            thread::sleep(Duration::from_millis(300));
            Ok(Reply::status(200))
        })
        .build();
    let (client, server_thread) = blocking_pair(server);

    let err = client
        .call_timeout(Verb::Get, "/stuck", None, Some(Duration::from_millis(30)))
        .unwrap_err();
    assert!(matches!(err, KorvError::Timeout(_)));
    assert_eq!(client.pending(), 0);

    client.close();
    server_thread.join().unwrap();
}

// ==================== Raw session behaviour ====================

#[tokio::test]
async fn test_missing_resource_yields_exactly_one_400() {
    let responses = exchange_raw(
        hello_server(),
        &[json!({"id": 9, "verb": "GET", "body": null})],
    )
    .await;

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].code, Status::BAD_REQUEST);
    assert_eq!(responses[0].request_id, MessageId::Number(9));
    assert_eq!(responses[0].message(), Some("Missing 'resource'"));
}

#[tokio::test]
async fn test_unknown_verb_and_missing_id() {
    let responses = exchange_raw(
        hello_server(),
        &[
            json!({"id": "a", "verb": "PATCH", "resource": "/hello"}),
            json!({"verb": "GET", "resource": "/hello"}),
        ],
    )
    .await;

    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].request_id, MessageId::Text("a".into()));
    assert_eq!(responses[0].message(), Some("Unknown verb 'PATCH'"));
    assert_eq!(responses[1].request_id, MessageId::UNKNOWN);
    assert_eq!(responses[1].message(), Some("Missing 'id'"));
}

#[tokio::test]
async fn test_failing_handler_does_not_stop_the_next() {
    let server = Server::builder()
        .route(Verb::Get, "/multi", |_| Err(anyhow!("first one fails")))
        .route(Verb::Get, "/multi", |_| Ok(Reply::ok(json!({"msg": "second"}))))
        .build();

    let responses = exchange_raw(
        server,
        &[json!({"id": 1, "verb": "GET", "resource": "/multi", "body": null})],
    )
    .await;

    assert_eq!(responses.len(), 2);
    assert!(responses.iter().all(|r| r.request_id == MessageId::Number(1)));
    assert_eq!(responses[0].code, Status::INTERNAL_ERROR);
    assert_eq!(responses[1].code, Status::OK);
    assert_ne!(responses[0].id, responses[1].id);
}

#[tokio::test]
async fn test_undecodable_frame_is_dropped() {
    let codec = Codec::default();
    let (mut client_end, server_end) = tokio::io::duplex(64 * 1024);
    let server = hello_server();
    let session = tokio::spawn(async move { server.serve_connection(server_end).await });

    client_end.write_all(&build_frame(b"\x00\x01garbage").unwrap()).await.unwrap();
    let request = Request::new(MessageId::Number(4), Verb::Get, "/hello", None);
    let payload = codec.encode(&request).unwrap();
    client_end.write_all(&build_frame(&payload).unwrap()).await.unwrap();
    client_end.shutdown().await.unwrap();

    let responses = read_responses(&mut client_end, &codec).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].request_id, MessageId::Number(4));
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_negative_and_fractional_ids_are_echoed() {
    let responses = exchange_raw(
        hello_server(),
        &[
            json!({"id": 1.5, "verb": "GET", "resource": "/hello"}),
            json!({"id": -3, "verb": "GET", "resource": "/hello"}),
        ],
    )
    .await;

    assert_eq!(responses.len(), 2);
    let echoed: Vec<Value> = responses
        .iter()
        .map(|r| serde_json::to_value(&r.request_id).unwrap())
        .collect();
    assert!(echoed.contains(&json!(1.5)), "{echoed:?}");
    assert!(echoed.contains(&json!(-3)), "{echoed:?}");
    assert!(responses.iter().all(|r| r.code == Status::OK));
}

#[tokio::test]
async fn test_zero_handler_limit_still_serves_requests() {
    let server = Server::builder()
        .max_concurrent_handlers(0)
        .route(Verb::Get, "/hello", |_| Ok(Reply::ok(json!({"msg": "Hello World!"}))))
        .build();

    let responses = tokio::time::timeout(
        Duration::from_secs(5),
        exchange_raw(
            server,
            &[
                json!({"id": 1, "verb": "GET", "resource": "/hello"}),
                json!({"id": 2, "verb": "GET", "resource": "/hello"}),
            ],
        ),
    )
    .await
    .expect("session stalled");

    assert_eq!(responses.len(), 2);
    assert!(responses.iter().all(|r| r.code == Status::OK));
}

#[tokio::test]
async fn test_frame_expanding_past_limit_is_dropped() {
    let codec = Codec::default();
    let server = Server::builder()
        .codec(CodecConfig {
            max_decompressed_size: 4096,
            ..CodecConfig::default()
        })
        .route(Verb::Store, "/blob", |_| Ok(Reply::status(200)))
        .route(Verb::Get, "/hello", |_| Ok(Reply::ok(json!({"msg": "Hello World!"}))))
        .build();
    let (mut client_end, server_end) = tokio::io::duplex(64 * 1024);
    let session = tokio::spawn(async move { server.serve_connection(server_end).await });

    let oversized = Request::new(
        MessageId::Number(1),
        Verb::Store,
        "/blob",
        Some(json!({"data": "z".repeat(1024 * 1024)})),
    );
    let payload = codec.encode(&oversized).unwrap();
    assert!(payload.len() < 4096);
    client_end.write_all(&build_frame(&payload).unwrap()).await.unwrap();

    let request = Request::new(MessageId::Number(2), Verb::Get, "/hello", None);
    let payload = codec.encode(&request).unwrap();
    client_end.write_all(&build_frame(&payload).unwrap()).await.unwrap();
    client_end.shutdown().await.unwrap();

    let responses = read_responses(&mut client_end, &codec).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].request_id, MessageId::Number(2));
    session.await.unwrap().unwrap();
}

// ==================== Async client ====================

#[tokio::test]
async fn test_async_client_msgpack_without_compression() {
    let codec = CodecConfig {
        format: Format::MsgPack,
        compression_level: None,
        ..CodecConfig::default()
    };
    let server = Server::builder()
        .codec(codec)
        .route_typed(Verb::Store, "/items", |item: Value, _| {
            Ok(Reply::ok(json!({"stored": item["name"]})))
        })
        .build();

    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let session = tokio::spawn({
        let server = server.clone();
        async move { server.serve_connection(server_end).await }
    });
    let client = Client::builder().codec(codec).attach(client_end);

    let response = client.store("/items", json!({"name": "widget"})).await.unwrap();
    assert_eq!(response.code, Status::OK);
    assert_eq!(response.body, Some(json!({"stored": "widget"})));

    client.close().await;
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_routes_registered_after_start_are_served() {
    let server = Server::builder().build();
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let session = tokio::spawn({
        let server = server.clone();
        async move { server.serve_connection(server_end).await }
    });
    let client = Client::builder().attach(client_end);

    assert_eq!(client.get("/late").await.unwrap().code, Status::NOT_FOUND);

    server
        .router()
        .register(Verb::Get, "/late", |_| Ok(Reply::ok(json!({"msg": "here"}))));
    assert_eq!(client.get("/late").await.unwrap().code, Status::OK);

    client.close().await;
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_many_concurrent_async_requests() {
    let server = Server::builder()
        .route(Verb::Get, "/echo", |request: &Request| {
            Ok(Reply::ok(json!({"id": request.id.to_string()})))
        })
        .build();
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let session = tokio::spawn({
        let server = server.clone();
        async move { server.serve_connection(server_end).await }
    });
    let client = Arc::new(Client::builder().attach(client_end));

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.get("/echo").await.unwrap() }));
    }
    for task in tasks {
        let response = task.await.unwrap();
        assert_eq!(
            response.body,
            Some(json!({"id": response.request_id.to_string()}))
        );
    }
    assert_eq!(client.pending(), 0);

    client.close().await;
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_client_close_ends_session() {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let server = hello_server();
    let session = tokio::spawn(async move { server.serve_connection(server_end).await });
    let client = Client::builder().attach(client_end);

    assert_eq!(client.get("/hello").await.unwrap().code, Status::OK);
    client.close().await;
    session.await.unwrap().unwrap();

    // The server closed its side in turn.
    for _ in 0..100 {
        if client.state() == SessionState::Closed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(client.state(), SessionState::Closed);
}

// ==================== TCP ====================

#[tokio::test]
async fn test_tcp_end_to_end() {
    let listener = Listener::bind(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();
    let endpoint = listener.local_endpoint().unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = hello_server();
    let serving = tokio::spawn(async move {
        server
            .serve_with_shutdown(listener, async {
                let _ = stop_rx.await;
            })
            .await
    });

    let client = Client::builder().connect(&endpoint).await.unwrap();
    let response = client.get("/hello").await.unwrap();
    assert_eq!(response.body, Some(json!({"msg": "Hello World!"})));

    let second = Client::builder().connect(&endpoint).await.unwrap();
    assert_eq!(second.get("/nothing").await.unwrap().code, Status::NOT_FOUND);

    stop_tx.send(()).unwrap();
    serving.await.unwrap().unwrap();
}
