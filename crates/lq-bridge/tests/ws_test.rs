use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lq_bridge::devnet::DevnetSupervisor;
use lq_bridge::editor::{editor_dispatcher, Workspace};
use lq_bridge::handlers::builtin_dispatcher;
use lq_bridge::http_api::{api_router, AppState};
use lq_session::{PtyPool, SessionRegistry, ShellSpec, TerminalDispatcher};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct TestServer {
    addr: String,
    registry: SessionRegistry,
    _workspaces: tempfile::TempDir,
}

async fn start_test_server() -> TestServer {
    let workspaces = tempfile::tempdir().unwrap();
    let shell = ShellSpec::new("/bin/sh").env("PS1", "$ ");
    let registry = SessionRegistry::new(PtyPool::new(4), shell);
    let devnet = Arc::new(DevnetSupervisor::new("/bin/cat", vec![]));
    let state = AppState::new(
        builtin_dispatcher(TerminalDispatcher::new(registry.clone()), devnet),
        editor_dispatcher(Arc::new(Workspace::new(workspaces.path(), None))),
        Duration::from_millis(100),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, api_router(state)).await.unwrap();
    });

    TestServer {
        addr,
        registry,
        _workspaces: workspaces,
    }
}

async fn connect(server: &TestServer) -> Socket {
    let (socket, _) = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .expect("websocket connect");
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

/// Next JSON text frame, skipping heartbeats.
async fn next_json(socket: &mut Socket) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(text.as_str()).unwrap(),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

async fn wait_for(socket: &mut Socket, mut pred: impl FnMut(&Value) -> bool) -> Vec<Value> {
    let mut seen = Vec::new();
    loop {
        let frame = next_json(socket).await;
        let hit = pred(&frame);
        seen.push(frame);
        if hit {
            return seen;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ping_reply_carries_request_id() {
    let server = start_test_server().await;
    let mut socket = connect(&server).await;

    send(&mut socket, json!({"type": "ping", "data": null, "id": 7})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "pong", "data": "ok", "id": 7})
    );

    send(&mut socket, json!({"type": "ping", "id": "abc"})).await;
    assert_eq!(next_json(&mut socket).await["id"], "abc");

    send(&mut socket, json!({"type": "ping", "id": -7})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "pong", "data": "ok", "id": -7})
    );

    send(&mut socket, json!({"type": "ping", "id": 1.5})).await;
    assert_eq!(next_json(&mut socket).await["id"], json!(1.5));
}

#[tokio::test]
async fn invalid_json_gets_bare_error_and_socket_survives() {
    let server = start_test_server().await;
    let mut socket = connect(&server).await;

    socket.send(Message::Text("not json".into())).await.unwrap();
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "error", "data": "Invalid JSON"})
    );

    send(&mut socket, json!({"type": "ping", "id": 1})).await;
    assert_eq!(next_json(&mut socket).await["type"], "pong");
}

#[tokio::test]
async fn unknown_type_error_carries_id() {
    let server = start_test_server().await;
    let mut socket = connect(&server).await;

    send(&mut socket, json!({"type": "teleport", "data": {}, "id": 3})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "error", "data": "Unknown type: teleport", "id": 3})
    );
}

#[tokio::test]
async fn terminal_output_streams_with_request_id() {
    let server = start_test_server().await;
    let mut socket = connect(&server).await;

    send(
        &mut socket,
        json!({
            "type": "terminal",
            "data": {"cmd": "sh", "args": ["-lc", "echo $((19+23))"], "id": "term-a"},
            "id": "req-1"
        }),
    )
    .await;

    let frames = wait_for(&mut socket, |f| {
        f["type"] == "terminal.stdout" && f["data"].as_str().is_some_and(|s| s.contains("42"))
    })
    .await;
    assert_eq!(
        frames[0],
        json!({"type": "terminal.started", "data": {"id": "term-a"}, "id": "req-1"})
    );
    assert!(frames.iter().all(|f| f["id"] == "req-1"));
    assert!(server.registry.contains("term-a"));

    send(
        &mut socket,
        json!({
            "type": "terminal",
            "data": {"cmd": "sh", "args": ["-lc", "__terminate__"], "id": "term-a"},
            "id": "req-2"
        }),
    )
    .await;
    let frames = wait_for(&mut socket, |f| f["type"] == "terminal.terminated").await;
    assert_eq!(frames.last().unwrap()["id"], "req-2");
    assert!(!server.registry.contains("term-a"));
}

#[tokio::test]
async fn devnet_lifecycle_over_socket() {
    let server = start_test_server().await;
    let mut socket = connect(&server).await;

    send(&mut socket, json!({"type": "start-devnet", "id": "dev"})).await;
    let started = next_json(&mut socket).await;
    assert_eq!(started["type"], "log");
    assert!(started["data"].as_str().unwrap().starts_with("devnet started"));

    send(&mut socket, json!({"type": "stdin", "data": "hello node\n"})).await;
    let echoed = wait_for(&mut socket, |f| f["type"] == "stdout").await;
    assert_eq!(echoed.last().unwrap()["data"], "hello node\n");
    assert_eq!(echoed.last().unwrap()["id"], "dev");

    send(&mut socket, json!({"type": "stop-devnet", "id": "halt"})).await;
    let frames = wait_for(&mut socket, |f| f["type"] == "exit").await;
    assert!(frames
        .iter()
        .any(|f| *f == json!({"type": "success", "data": "devnet stopped", "id": "halt"})));
    assert_eq!(frames.last().unwrap()["id"], "dev");
}

#[tokio::test]
async fn sessions_survive_socket_close() {
    let server = start_test_server().await;
    let mut socket = connect(&server).await;

    send(
        &mut socket,
        json!({
            "type": "terminal",
            "data": {"cmd": "sh", "args": ["-lc", "true"], "id": "keep"},
            "id": 1
        }),
    )
    .await;
    wait_for(&mut socket, |f| f["type"] == "terminal.started").await;
    socket.close(None).await.unwrap();
    drop(socket);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.registry.contains("keep"));
    server.registry.kill_all();
}
