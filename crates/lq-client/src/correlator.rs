//! Request/response correlation over a shared connection.
//!
//! Every outbound call gets a fresh id and a pending entry. The first inbound
//! frame carrying that id settles the entry and removes it; later duplicates
//! and frames for unknown ids are handed back to the caller as unsolicited
//! messages. An entry that sees no response within the timeout is rejected
//! and removed, so a late response for it is treated as unsolicited too.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ahash::AHashMap;
use lq_core::config::ClientConfig;
use lq_core::protocol::RequestId;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

type Reply = Result<Value>;

struct Pending {
    tx: oneshot::Sender<Reply>,
    method: Option<String>,
}

type PendingMap = Arc<Mutex<AHashMap<RequestId, Pending>>>;

pub struct Correlator {
    next_id: AtomicU64,
    prefix: Option<String>,
    timeout: Duration,
    pending: PendingMap,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            prefix: None,
            timeout,
            pending: Arc::new(Mutex::new(AHashMap::new())),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.request_timeout())
    }

    /// Issue text ids of the form `<prefix><n>` instead of bare numbers.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Allocate the next id. Ids increase monotonically for the lifetime of
    /// this correlator.
    pub fn next_id(&self) -> RequestId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        match &self.prefix {
            Some(prefix) => RequestId::Text(format!("{prefix}{n}")),
            None => RequestId::from(n),
        }
    }

    /// Track a call under `id`. The returned handle settles when a matching
    /// frame arrives or the timeout elapses.
    pub fn register(&self, id: RequestId, method: Option<&str>) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let previous = self.lock().insert(
            id.clone(),
            Pending {
                tx,
                method: method.map(str::to_owned),
            },
        );
        if previous.is_some() {
            warn!(%id, "replacing a pending request with a reused id");
        }
        PendingCall {
            id,
            method: method.map(str::to_owned),
            rx,
            timeout: self.timeout,
            pending: self.pending.clone(),
        }
    }

    /// Route one inbound frame. Returns the frame back when no pending call
    /// claims it.
    pub fn resolve_frame(&self, frame: Value) -> Option<Value> {
        let Some(id) = frame.get("id").and_then(RequestId::from_value) else {
            return Some(frame);
        };
        let Some(pending) = self.lock().remove(&id) else {
            return Some(frame);
        };
        debug!(%id, method = ?pending.method, "response matched");
        if pending.tx.send(classify(frame.clone())).is_err() {
            // The caller gave up between its timeout and removing the entry.
            debug!(%id, "caller already gone, passing response through");
            return Some(frame);
        }
        None
    }

    /// Drop a pending entry without settling it (the send never happened).
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Reject every outstanding call with [`ClientError::Closed`].
    pub fn fail_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (id, pending) in drained {
            debug!(%id, method = ?pending.method, "failing pending request");
            let _ = pending.tx.send(Err(ClientError::Closed));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, AHashMap<RequestId, Pending>> {
        lock_pending(&self.pending)
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, AHashMap<RequestId, Pending>> {
    pending.lock().unwrap_or_else(|e| {
        warn!("pending map lock was poisoned, recovering");
        e.into_inner()
    })
}

/// JSON-RPC `error` wins, then `result`, then an `error` event envelope.
/// Anything else resolves with the whole frame.
fn classify(mut frame: Value) -> Reply {
    if let Some(error) = frame.get_mut("error").filter(|e| !e.is_null()) {
        return Err(ClientError::Rejected(error.take()));
    }
    if let Some(result) = frame.get_mut("result") {
        return Ok(result.take());
    }
    if frame.get("type").and_then(Value::as_str) == Some("error") {
        let data = frame.get_mut("data").map(Value::take).unwrap_or(Value::Null);
        return Err(ClientError::Rejected(data));
    }
    Ok(frame)
}

/// An outstanding call.
pub struct PendingCall {
    id: RequestId,
    method: Option<String>,
    rx: oneshot::Receiver<Reply>,
    timeout: Duration,
    pending: PendingMap,
}

impl PendingCall {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response, the timeout, or the correlator giving up.
    pub async fn wait(self) -> Result<Value> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                lock_pending(&self.pending).remove(&self.id);
                debug!(id = %self.id, method = ?self.method, "request timed out");
                Err(ClientError::Timeout {
                    id: self.id,
                    method: self.method,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_increase_and_take_prefix() {
        let plain = Correlator::new(Duration::from_secs(1));
        assert_eq!(plain.next_id(), RequestId::from(1u64));
        assert_eq!(plain.next_id(), RequestId::from(2u64));

        let prefixed = Correlator::new(Duration::from_secs(1)).with_prefix("ly_");
        assert_eq!(prefixed.next_id(), RequestId::from("ly_1"));
        assert_eq!(prefixed.next_id(), RequestId::from("ly_2"));
    }

    #[tokio::test]
    async fn resolves_exactly_once() {
        let correlator = Correlator::new(Duration::from_secs(1));
        let id = correlator.next_id();
        let call = correlator.register(id.clone(), Some("eth_blockNumber"));

        let first = json!({"jsonrpc": "2.0", "id": 1, "result": "0x10"});
        let second = json!({"jsonrpc": "2.0", "id": 1, "result": "0x11"});
        assert!(correlator.resolve_frame(first).is_none());
        assert_eq!(correlator.resolve_frame(second.clone()), Some(second));

        assert_eq!(call.wait().await.unwrap(), json!("0x10"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_rejects_and_late_reply_passes_through() {
        let correlator = Correlator::new(Duration::from_millis(20));
        let id = correlator.next_id();
        let call = correlator.register(id, Some("slow"));

        let err = call.wait().await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout { ref method, .. } if method.as_deref() == Some("slow")));
        assert_eq!(err.to_string(), "request 1 timed out");
        assert_eq!(correlator.pending_count(), 0);

        let late = json!({"id": 1, "result": true});
        assert_eq!(correlator.resolve_frame(late.clone()), Some(late));
    }

    #[test]
    fn reply_for_abandoned_call_passes_through() {
        let correlator = Correlator::new(Duration::from_secs(1));
        let call = correlator.register(RequestId::from(5u64), Some("gone"));
        // Receiver dropped while the entry is still registered.
        drop(call);
        assert_eq!(correlator.pending_count(), 1);

        let reply = json!({"id": 5, "result": "late"});
        assert_eq!(correlator.resolve_frame(reply.clone()), Some(reply));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn classifies_responses() {
        let correlator = Correlator::new(Duration::from_secs(1));

        let rpc_err = correlator.register(RequestId::from(1u64), None);
        correlator.resolve_frame(json!({"id": 1, "error": {"code": -32601}}));
        assert!(matches!(rpc_err.wait().await, Err(ClientError::Rejected(e)) if e["code"] == -32601));

        let null_err = correlator.register(RequestId::from(2u64), None);
        correlator.resolve_frame(json!({"id": 2, "error": null, "result": 7}));
        assert_eq!(null_err.wait().await.unwrap(), json!(7));

        let event_err = correlator.register(RequestId::from("x"), None);
        correlator.resolve_frame(json!({"type": "error", "data": "Unknown type: nope", "id": "x"}));
        assert!(matches!(event_err.wait().await, Err(ClientError::Rejected(e)) if e == "Unknown type: nope"));

        let event = correlator.register(RequestId::from("y"), None);
        correlator.resolve_frame(json!({"type": "pong", "data": "ok", "id": "y"}));
        assert_eq!(
            event.wait().await.unwrap(),
            json!({"type": "pong", "data": "ok", "id": "y"})
        );
    }

    #[test]
    fn frames_without_known_id_are_unsolicited() {
        let correlator = Correlator::new(Duration::from_secs(1));
        let push = json!({"type": "terminal.stdout", "data": "hi"});
        assert_eq!(correlator.resolve_frame(push.clone()), Some(push));
        let stray = json!({"id": 99, "result": 1});
        assert_eq!(correlator.resolve_frame(stray.clone()), Some(stray));
    }

    #[tokio::test]
    async fn fail_all_rejects_outstanding_calls() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let a = correlator.register(correlator.next_id(), None);
        let b = correlator.register(correlator.next_id(), None);
        correlator.fail_all();
        assert!(matches!(a.wait().await, Err(ClientError::Closed)));
        assert!(matches!(b.wait().await, Err(ClientError::Closed)));
        assert_eq!(correlator.pending_count(), 0);
    }
}
