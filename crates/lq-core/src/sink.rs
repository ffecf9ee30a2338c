//! Per-request event sink.
//!
//! Every dispatch is handed an [`EventSink`]. Handlers emit bare [`Event`]s;
//! the sink stamps each one with the originating request id before it reaches
//! the transport, so handlers never deal with correlation themselves.

use std::fmt;

use crate::protocol::{Event, EventFrame, RequestId};

#[derive(Clone)]
pub struct EventSink {
    tx: flume::Sender<EventFrame>,
    correlation: Option<RequestId>,
}

impl EventSink {
    pub fn new(tx: flume::Sender<EventFrame>, correlation: Option<RequestId>) -> Self {
        Self { tx, correlation }
    }

    /// Build a sink together with the receiving end of its channel.
    pub fn channel(correlation: Option<RequestId>) -> (Self, flume::Receiver<EventFrame>) {
        let (tx, rx) = flume::unbounded();
        (Self::new(tx, correlation), rx)
    }

    /// Send an event. Returns `false` once the transport has gone away.
    pub fn emit(&self, event: Event) -> bool {
        self.tx
            .send(EventFrame::new(event, self.correlation.clone()))
            .is_ok()
    }

    pub fn correlation(&self) -> Option<&RequestId> {
        self.correlation.as_ref()
    }

    /// Same channel, different request id.
    pub fn with_correlation(&self, correlation: Option<RequestId>) -> Self {
        Self {
            tx: self.tx.clone(),
            correlation,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("correlation", &self.correlation)
            .field("closed", &self.is_closed())
            .finish()
    }
}
