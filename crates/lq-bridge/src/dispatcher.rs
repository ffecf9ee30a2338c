use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use lq_core::protocol::Event;
use lq_core::sink::EventSink;
use lq_session::TerminalError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::devnet::DevnetError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A handler failure. The [`Dispatcher`] turns it into an `error` event, its
/// `Display` text is what the client sees.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error(transparent)]
    Devnet(#[from] DevnetError),

    #[error("{0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process one request, reporting zero or more events on `sink`.
    async fn handle(&self, data: Value, sink: &EventSink) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HandlerDescriptor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    /// Dispatch key, matched against the request `type`.
    pub name: String,
    pub description: String,
    pub path: String,
}

impl HandlerDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: format!("/{name}"),
            name,
            description: description.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Entry {
    descriptor: HandlerDescriptor,
    handler: Arc<dyn Handler>,
}

/// Routes a request `type` to its registered [`Handler`].
///
/// Nothing a handler does escapes `dispatch`: unknown types and handler
/// errors both become a single `error` event on the caller's sink.
pub struct Dispatcher {
    name: &'static str,
    entries: AHashMap<String, Entry>,
}

impl Dispatcher {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: AHashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a handler. A second registration under the same name replaces
    /// the first.
    pub fn register(&mut self, descriptor: HandlerDescriptor, handler: Arc<dyn Handler>) {
        let name = descriptor.name.clone();
        if self
            .entries
            .insert(name.clone(), Entry { descriptor, handler })
            .is_some()
        {
            warn!(dispatcher = self.name, %name, "handler replaced");
        }
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered handlers, sorted by name.
    pub fn list(&self) -> Vec<HandlerDescriptor> {
        let mut out: Vec<HandlerDescriptor> =
            self.entries.values().map(|e| e.descriptor.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn dispatch(&self, kind: &str, data: Value, sink: &EventSink) {
        let Some(entry) = self.entries.get(kind) else {
            debug!(dispatcher = self.name, kind, "unknown request type");
            sink.emit(Event::Error(DispatchError::UnknownType(kind.to_string()).to_string()));
            return;
        };

        debug!(dispatcher = self.name, kind, "dispatching");
        if let Err(e) = entry.handler.handle(data, sink).await {
            warn!(dispatcher = self.name, kind, "handler failed: {e}");
            sink.emit(Event::Error(e.to_string()));
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field(
                "handlers",
                &self.list().into_iter().map(|d| d.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
