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

async fn start_editor_server(root: &std::path::Path, template: Option<&std::path::Path>) -> Socket {
    let registry = SessionRegistry::new(PtyPool::new(1), ShellSpec::new("/bin/sh"));
    let state = AppState::new(
        builtin_dispatcher(
            TerminalDispatcher::new(registry),
            Arc::new(DevnetSupervisor::new("/bin/cat", vec![])),
        ),
        editor_dispatcher(Arc::new(Workspace::new(root, template.map(Into::into)))),
        Duration::from_millis(100),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api_router(state)).await.unwrap();
    });

    let (socket, _) = connect_async(format!("ws://{addr}/editor")).await.unwrap();
    socket
}

async fn call(socket: &mut Socket, kind: &str, data: Value) -> Value {
    socket
        .send(Message::Text(
            json!({"type": kind, "data": data, "id": kind}).to_string().into(),
        ))
        .await
        .unwrap();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(frame["id"], kind);
                return frame;
            }
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn create_read_and_list() {
    let dir = tempfile::tempdir().unwrap();
    let mut socket = start_editor_server(dir.path(), None).await;

    let created = call(
        &mut socket,
        "file:create",
        json!({"namespace": "demo", "path": "src/lib.rs", "content": "fn main() {}"}),
    )
    .await;
    assert_eq!(created["type"], "file:create:ok");

    let read = call(
        &mut socket,
        "file:read",
        json!({"namespace": "demo", "path": "src/lib.rs"}),
    )
    .await;
    assert_eq!(read["type"], "file:read:ok");
    assert_eq!(read["data"]["content"], "fn main() {}");

    call(&mut socket, "folder:create", json!({"namespace": "demo", "path": "assets"})).await;
    let tree = call(&mut socket, "tree:get", json!({"namespace": "demo"})).await;
    assert_eq!(tree["type"], "tree:get:ok");
    assert_eq!(
        tree["data"]["tree"],
        json!([
            {"id": "assets", "name": "assets", "type": "folder", "children": []},
            {"id": "src", "name": "src", "type": "folder", "children": [
                {"id": "src/lib.rs", "name": "lib.rs", "type": "file"}
            ]}
        ])
    );
}

#[tokio::test]
async fn escaping_paths_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let mut socket = start_editor_server(dir.path(), None).await;

    let reply = call(
        &mut socket,
        "file:write",
        json!({"namespace": "demo", "path": "../../etc/passwd", "content": "x"}),
    )
    .await;
    assert_eq!(reply["type"], "file:write:error");
    assert_eq!(reply["data"]["message"], "Path escapes namespace root");
    assert_eq!(reply["data"]["path"], "../../etc/passwd");

    let reply = call(&mut socket, "tree:get", json!({"namespace": "../outside"})).await;
    assert_eq!(reply["type"], "tree:get:error");
}

#[tokio::test]
async fn rename_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let mut socket = start_editor_server(dir.path(), None).await;

    call(&mut socket, "file:create", json!({"namespace": "n", "path": "a.txt"})).await;
    let dup = call(&mut socket, "file:create", json!({"namespace": "n", "path": "a.txt"})).await;
    assert_eq!(dup["type"], "file:create:error");
    assert_eq!(dup["data"]["message"], "File already exists");

    let renamed = call(
        &mut socket,
        "file:rename",
        json!({"namespace": "n", "oldPath": "a.txt", "newPath": "docs/b.txt"}),
    )
    .await;
    assert_eq!(renamed["type"], "file:rename:ok");
    assert!(dir.path().join("n/docs/b.txt").is_file());
    assert!(!dir.path().join("n/a.txt").exists());

    let refused = call(&mut socket, "file:delete", json!({"namespace": "n", "path": "docs"})).await;
    assert_eq!(refused["type"], "file:delete:error");

    let removed = call(&mut socket, "folder:delete", json!({"namespace": "n", "path": "docs"})).await;
    assert_eq!(removed["type"], "folder:delete:ok");
    assert!(!dir.path().join("n/docs").exists());
}

#[tokio::test]
async fn new_namespace_is_seeded_from_template() {
    let template = tempfile::tempdir().unwrap();
    std::fs::write(template.path().join("README.md"), "# starter").unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut socket = start_editor_server(dir.path(), Some(template.path())).await;

    let tree = call(&mut socket, "tree:get", json!({"namespace": "fresh"})).await;
    assert_eq!(
        tree["data"]["tree"],
        json!([{"id": "README.md", "name": "README.md", "type": "file"}])
    );
    let read = call(&mut socket, "file:read", json!({"namespace": "fresh", "path": "README.md"})).await;
    assert_eq!(read["data"]["content"], "# starter");
}
