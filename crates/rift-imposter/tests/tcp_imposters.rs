//! Integration tests for tcp imposters over real sockets.
//!
//! Each test runs its own `ImposterManager` on OS-assigned ports.

use base64::Engine;
use rift_imposter::config::EngineConfig;
use rift_imposter::imposter::{ImposterConfig, ImposterManager};
use rift_imposter::ledger::Outcome;
use rift_imposter::message::Request;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn manager() -> ImposterManager {
    ImposterManager::new(EngineConfig {
        allow_injection: true,
        host: "127.0.0.1".to_string(),
        proxy_timeout_ms: 200,
        shutdown_grace_ms: 100,
        ..Default::default()
    })
    .unwrap()
}

async fn create(manager: &ImposterManager, declaration: serde_json::Value) -> u16 {
    let config: ImposterConfig = serde_json::from_value(declaration).unwrap();
    manager.create_imposter(config).await.unwrap()
}

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

/// Read until `expected` bytes arrived or the peer closed.
async fn read_exact_or_eof(stream: &mut TcpStream, expected: usize) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while received.len() < expected {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("reply timed out")
            .unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    received
}

#[tokio::test]
async fn test_length_prefixed_message_spans_many_reads() {
    let manager = manager();
    let port = create(
        &manager,
        json!({
            "protocol": "tcp",
            "mode": "binary",
            "endOfRequestResolver": {
                "inject": "|bytes| bytes.len() >= 4 && bytes.len() >= 4 + bytes.parse_le_int(0, 4)"
            },
            "stubs": [{"responses": [{"is": {"data": "T0s="}}]}]
        }),
    )
    .await;

    let body = vec![b'x'; 100_000];
    let mut message = (body.len() as u32).to_le_bytes().to_vec();
    message.extend_from_slice(&body);

    let mut stream = connect(port).await;
    for chunk in message.chunks(7_000) {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
    }
    assert_eq!(read_exact_or_eof(&mut stream, 2).await, b"OK");

    let requests = manager.requests(port).unwrap();
    assert_eq!(requests.len(), 1);
    let Request::Tcp(request) = &requests[0].request else {
        panic!("expected tcp request");
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&request.data)
        .unwrap();
    assert_eq!(decoded.len(), 100_004);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_delimited_messages_reply_in_order() {
    let manager = manager();
    let port = create(
        &manager,
        json!({
            "protocol": "tcp",
            "framing": {"type": "delimiter", "delimiter": "\n"},
            "stubs": [
                {"predicates": [{"equals": {"data": "slow"}}],
                 "responses": [{"is": {"data": "1"}, "_behaviors": {"wait": 150}}]},
                {"predicates": [{"equals": {"data": "fast"}}],
                 "responses": [{"is": {"data": "2"}}]}
            ]
        }),
    )
    .await;

    let mut stream = connect(port).await;
    stream.write_all(b"slow\nfast\n").await.unwrap();
    assert_eq!(read_exact_or_eof(&mut stream, 2).await, b"12");
    manager.shutdown().await;
}

#[tokio::test]
async fn test_connection_framing_and_inject_suffix() {
    let manager = manager();
    let port = create(
        &manager,
        json!({
            "protocol": "tcp",
            "framing": {"type": "connection"},
            "stubs": [{"responses": [{"inject": "|request| #{ data: request.data + \" INJECTED\" }"}]}]
        }),
    )
    .await;

    let mut stream = connect(port).await;
    stream.write_all(b"part one, ").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(b"part two").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, "part one, part two INJECTED");
    manager.shutdown().await;
}

#[tokio::test]
async fn test_async_inject_calls_another_service() {
    let manager = manager();
    let origin = create(
        &manager,
        json!({"protocol": "tcp", "stubs": [{"responses": [{"is": {"data": "origin reply"}}]}]}),
    )
    .await;
    let script = format!(
        "|request, state, logger, callback| {{ \
            let reply = tcp_request(\"127.0.0.1:{origin}\", request.data); \
            callback.call(#{{ data: \"via \" + reply }}); \
        }}"
    );
    let port = create(
        &manager,
        json!({"protocol": "tcp", "stubs": [{"responses": [{"inject": script}]}]}),
    )
    .await;

    let mut stream = connect(port).await;
    stream.write_all(b"hello").await.unwrap();
    let expected = b"via origin reply";
    assert_eq!(read_exact_or_eof(&mut stream, expected.len()).await, expected);
    assert_eq!(manager.requests(origin).unwrap().len(), 1);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_resolver_does_not_block_other_connections() {
    let manager = manager();
    let port = create(
        &manager,
        json!({
            "protocol": "tcp",
            "endOfRequestResolver": {
                "inject": "|bytes| { if bytes[0] == 65 { sleep(1500); } true }"
            },
            "stubs": [{"responses": [{"is": {"data": "ok"}}]}]
        }),
    )
    .await;

    let mut stalled = Vec::new();
    for _ in 0..2 {
        let mut stream = connect(port).await;
        stream.write_all(b"A").await.unwrap();
        stalled.push(stream);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let mut stream = connect(port).await;
    stream.write_all(b"B").await.unwrap();
    assert_eq!(read_exact_or_eof(&mut stream, 2).await, b"ok");
    assert!(started.elapsed() < Duration::from_millis(500));

    for mut stream in stalled {
        assert_eq!(read_exact_or_eof(&mut stream, 2).await, b"ok");
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn test_proxy_timeout_closes_client_connection() {
    // accepts connections and never answers
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_port = silent.local_addr().unwrap().port();
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let manager = manager();
    let port = create(
        &manager,
        json!({
            "protocol": "tcp",
            "stubs": [{"responses": [{"proxy": {"to": format!("tcp://127.0.0.1:{silent_port}")}}]}]
        }),
    )
    .await;

    let mut stream = connect(port).await;
    stream.write_all(b"hello").await.unwrap();
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "client connection left open after proxy timeout");
    assert!(rest.is_empty());

    let requests = manager.requests(port).unwrap();
    assert_eq!(requests[0].outcome, Outcome::Timeout { after_ms: 200 });
    manager.shutdown().await;
    holder.abort();
}

#[tokio::test]
async fn test_reset_fault_drops_connection() {
    let manager = manager();
    let port = create(
        &manager,
        json!({"protocol": "tcp", "stubs": [{"responses": [{"fault": "CONNECTION_RESET_BY_PEER"}]}]}),
    )
    .await;

    let mut stream = connect(port).await;
    stream.write_all(b"anything").await.unwrap();
    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("connection was not closed");
    assert!(matches!(result, Err(_) | Ok(0)));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_delete_abandons_stuck_injection() {
    let manager = manager();
    let port = create(
        &manager,
        json!({
            "protocol": "tcp",
            "stubs": [{"responses": [{"inject": "|request| { sleep(20000); #{ data: \"late\" } }"}]}]
        }),
    )
    .await;

    let mut stream = connect(port).await;
    stream.write_all(b"x").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let description = manager.delete_imposter(port).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(description["numberOfRequests"], 1);

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "client connection left open");
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_ledger_records_outcomes() {
    let manager = manager();
    let port = create(
        &manager,
        json!({
            "protocol": "tcp",
            "stubs": [{"predicates": [{"startsWith": {"data": "known"}}], "responses": [{"is": {"data": "yes"}}]}]
        }),
    )
    .await;

    let mut stream = connect(port).await;
    stream.write_all(b"known thing").await.unwrap();
    assert_eq!(read_exact_or_eof(&mut stream, 3).await, b"yes");
    drop(stream);

    let mut stream = connect(port).await;
    stream.write_all(b"unknown").await.unwrap();
    stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let requests = manager.requests(port).unwrap();
    assert_eq!(requests.len(), 2);
    assert!(matches!(requests[0].outcome, Outcome::Response { .. }));
    assert_eq!(requests[0].stub_id, Some(0));
    assert!(matches!(requests[1].outcome, Outcome::Default { .. }));
    manager.shutdown().await;
}
