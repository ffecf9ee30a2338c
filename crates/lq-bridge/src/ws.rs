//! Persistent WebSocket transport.
//!
//! Many logical requests share one socket. Each text frame is a
//! `{type, data, id}` envelope; every event its handler emits, now or later,
//! is sent back as `{type, data, id}` with the same `id`. Requests from one
//! connection are dispatched in arrival order.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use lq_core::protocol::{Event, EventFrame, Request};
use lq_core::shutdown::ShutdownSignal;
use lq_core::sink::EventSink;
use lq_telemetry::tracing_setup::connection_span;
use tracing::{debug, info, Instrument};

use crate::dispatcher::Dispatcher;
use crate::http_api::AppState;

/// Ping frames keep half-open TCP connections from lingering.
const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = state.dispatcher.clone();
    ws.on_upgrade(move |socket| {
        serve_socket(socket, dispatcher, state.shutdown).instrument(connection_span("ws"))
    })
}

/// GET /editor
pub async fn editor_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let dispatcher = state.editor.clone();
    ws.on_upgrade(move |socket| {
        serve_socket(socket, dispatcher, state.shutdown).instrument(connection_span("editor"))
    })
}

async fn serve_socket(socket: WebSocket, dispatcher: Arc<Dispatcher>, shutdown: ShutdownSignal) {
    info!(dispatcher = dispatcher.name(), "websocket connected");
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, out_rx) = flume::unbounded::<EventFrame>();

    // Single writer: handler events and heartbeat pings.
    let writer = tokio::spawn(
        async move {
            let mut heartbeat = tokio::time::interval(WS_HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    frame = out_rx.recv_async() => {
                        let Ok(frame) = frame else { break };
                        if ws_tx.send(Message::Text(frame.to_json().into())).await.is_err() {
                            debug!("websocket send failed, closing writer");
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                            debug!("heartbeat ping failed, connection lost");
                            break;
                        }
                    }
                }
            }
            let _ = ws_tx.close().await;
        }
        .in_current_span(),
    );

    let reader = async {
        while let Some(message) = ws_rx.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.as_str().to_owned(),
                Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };

            match Request::parse(&text) {
                Ok(request) => {
                    let sink = EventSink::new(out_tx.clone(), request.id.clone());
                    dispatcher.dispatch(&request.kind, request.data, &sink).await;
                }
                Err(e) => {
                    debug!("rejecting frame: {e}");
                    let _ = out_tx.send(EventFrame::bare(Event::error(e.to_string())));
                }
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = shutdown.wait() => debug!("closing websocket for shutdown"),
    }
    writer.abort();
    info!(dispatcher = dispatcher.name(), "websocket disconnected");
}
