//! Persistent client connection.
//!
//! An [`RpcClient`] speaks text frames over a [`Link`]: a pair of flume
//! channels. [`RpcClient::connect`] bridges a WebSocket onto a link;
//! [`RpcClient::from_link`] accepts one built in-process.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use lq_core::protocol::{Request, RequestId};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::correlator::Correlator;
use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connected,
    Disconnected,
}

/// Text frames in both directions.
pub struct Link {
    pub outbound: flume::Sender<String>,
    pub inbound: flume::Receiver<String>,
}

impl Link {
    /// Two connected ends: what one sends the other receives.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();
        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

pub struct RpcClient {
    outbound: flume::Sender<String>,
    correlator: Arc<Correlator>,
    state: Arc<watch::Sender<TransportState>>,
    messages: flume::Receiver<Value>,
    tasks: Vec<JoinHandle<()>>,
}

impl RpcClient {
    /// Open a WebSocket to `url` and start routing its frames.
    pub async fn connect(url: &str, correlator: Correlator) -> Result<Self> {
        info!(%url, "connecting");
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Connect(Box::new(e)))?;
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (ours, theirs) = Link::pair();

        let writer = tokio::spawn(async move {
            while let Ok(text) = theirs.inbound.recv_async().await {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    debug!("websocket send failed, closing writer");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });
        let outbound = theirs.outbound;
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if outbound.send(text).is_err() {
                    break;
                }
            }
        });

        let mut client = Self::from_link(ours, correlator);
        client.tasks.extend([writer, reader]);
        Ok(client)
    }

    /// Route frames over an existing link. The client is `Connected` until
    /// the inbound side closes.
    pub fn from_link(link: Link, correlator: Correlator) -> Self {
        let correlator = Arc::new(correlator);
        let state = Arc::new(watch::channel(TransportState::Connected).0);
        let (msg_tx, msg_rx) = flume::unbounded();

        let router = {
            let correlator = correlator.clone();
            let state = state.clone();
            let inbound = link.inbound;
            tokio::spawn(async move {
                while let Ok(text) = inbound.recv_async().await {
                    let frame: Value = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("dropping unparsable frame: {e}");
                            continue;
                        }
                    };
                    if let Some(unclaimed) = correlator.resolve_frame(frame) {
                        let _ = msg_tx.send(unclaimed);
                    }
                }
                state.send_replace(TransportState::Disconnected);
                info!("connection closed");
            })
        };

        Self {
            outbound: link.outbound,
            correlator,
            state,
            messages: msg_rx,
            tasks: vec![router],
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// JSON-RPC 2.0 call; resolves with `result` or rejects with `error`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.ensure_connected()?;
        let id = self.correlator.next_id();
        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        self.round_trip(id, method, frame.to_string()).await
    }

    /// `{type, data, id}` request; resolves with the first frame carrying
    /// the id (an `error` event rejects).
    pub async fn request(&self, kind: &str, data: Value) -> Result<Value> {
        self.ensure_connected()?;
        let id = self.correlator.next_id();
        let frame = Request::new(kind, data, Some(id.clone()));
        let text = serde_json::to_string(&frame)?;
        self.round_trip(id, kind, text).await
    }

    /// Fire and forget.
    pub fn send_frame(&self, frame: &Value) -> Result<()> {
        self.ensure_connected()?;
        self.outbound
            .send(frame.to_string())
            .map_err(|_| ClientError::NotConnected)
    }

    /// Frames no pending call claimed: pushes, subscriptions, late replies.
    pub fn messages(&self) -> flume::Receiver<Value> {
        self.messages.clone()
    }

    /// Close the connection and reject everything still pending.
    pub fn close(&mut self) {
        self.state.send_replace(TransportState::Disconnected);
        self.correlator.fail_all();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state() == TransportState::Connected {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    async fn round_trip(&self, id: RequestId, label: &str, text: String) -> Result<Value> {
        let call = self.correlator.register(id.clone(), Some(label));
        if self.outbound.send(text).is_err() {
            self.correlator.cancel(&id);
            self.state.send_replace(TransportState::Disconnected);
            return Err(ClientError::NotConnected);
        }
        debug!(%id, label, "request sent");
        call.wait().await
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("state", &self.state())
            .field("correlator", &self.correlator)
            .finish()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client() -> (RpcClient, Link) {
        let (ours, server) = Link::pair();
        (
            RpcClient::from_link(ours, Correlator::new(Duration::from_secs(2))),
            server,
        )
    }

    #[tokio::test]
    async fn call_uses_jsonrpc_framing() {
        let (client, server) = client();
        let call = tokio::spawn(async move {
            let result = client.call("eth_chainId", json!([])).await;
            (client, result)
        });

        let sent: Value = serde_json::from_str(&server.inbound.recv_async().await.unwrap()).unwrap();
        assert_eq!(sent["jsonrpc"], "2.0");
        assert_eq!(sent["method"], "eth_chainId");
        server
            .outbound
            .send(json!({"jsonrpc": "2.0", "id": sent["id"], "result": "0x539"}).to_string())
            .unwrap();

        let (_client, result) = call.await.unwrap();
        assert_eq!(result.unwrap(), json!("0x539"));
    }

    #[tokio::test]
    async fn unsolicited_frames_reach_messages() {
        let (client, server) = client();
        let messages = client.messages();
        server
            .outbound
            .send(r#"{"type":"terminal.stdout","data":"hi","id":"t1"}"#.into())
            .unwrap();
        server.outbound.send("garbage".into()).unwrap();
        server.outbound.send(r#"{"type":"log","data":"x"}"#.into()).unwrap();

        let first = messages.recv_async().await.unwrap();
        assert_eq!(first["data"], "hi");
        let second = messages.recv_async().await.unwrap();
        assert_eq!(second["type"], "log");
    }

    #[tokio::test]
    async fn sending_while_disconnected_fails_without_sending() {
        let (mut client, server) = client();
        client.close();
        assert_eq!(client.state(), TransportState::Disconnected);

        let err = client.request("ping", Value::Null).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert_eq!(err.to_string(), "not connected");
        assert!(client.send_frame(&json!({"type": "ping"})).is_err());
        assert!(server.inbound.try_recv().is_err());
        assert_eq!(client.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn remote_close_marks_disconnected() {
        let (client, server) = client();
        let mut state = client.subscribe_state();
        assert_eq!(client.state(), TransportState::Connected);
        drop(server);

        state
            .wait_for(|s| *s == TransportState::Disconnected)
            .await
            .unwrap();
        assert!(matches!(
            client.call("eth_blockNumber", json!([])).await,
            Err(ClientError::NotConnected)
        ));
    }
}
