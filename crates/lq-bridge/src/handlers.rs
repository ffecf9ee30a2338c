//! Built-in handlers of the `/ws` and `/api/v1/dispatch` dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use lq_core::protocol::Event;
use lq_core::sink::EventSink;
use lq_session::TerminalDispatcher;
use serde_json::Value;
use tracing::debug;

use crate::devnet::DevnetSupervisor;
use crate::dispatcher::{Dispatcher, Handler, HandlerDescriptor, Result};

pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, _data: Value, sink: &EventSink) -> Result<()> {
        sink.emit(Event::Pong("ok".into()));
        Ok(())
    }
}

pub struct TerminalHandler {
    terminal: TerminalDispatcher,
}

impl TerminalHandler {
    pub fn new(terminal: TerminalDispatcher) -> Self {
        Self { terminal }
    }
}

#[async_trait]
impl Handler for TerminalHandler {
    async fn handle(&self, data: Value, sink: &EventSink) -> Result<()> {
        self.terminal.handle(&data, sink)?;
        Ok(())
    }
}

/// Raw input for the devnet process.
pub struct StdinHandler {
    devnet: Arc<DevnetSupervisor>,
}

#[async_trait]
impl Handler for StdinHandler {
    async fn handle(&self, data: Value, _sink: &EventSink) -> Result<()> {
        match data.as_str() {
            Some(input) => self.devnet.write_stdin(input),
            None => debug!("stdin payload is not a string, ignoring"),
        }
        Ok(())
    }
}

pub struct StartDevnetHandler {
    devnet: Arc<DevnetSupervisor>,
}

#[async_trait]
impl Handler for StartDevnetHandler {
    async fn handle(&self, _data: Value, sink: &EventSink) -> Result<()> {
        self.devnet.start(sink)?;
        Ok(())
    }
}

pub struct StopDevnetHandler {
    devnet: Arc<DevnetSupervisor>,
}

#[async_trait]
impl Handler for StopDevnetHandler {
    async fn handle(&self, _data: Value, sink: &EventSink) -> Result<()> {
        self.devnet.stop(sink)?;
        Ok(())
    }
}

/// The generic dispatcher: `ping`, `terminal`, `stdin`, `start-devnet`,
/// `stop-devnet`.
pub fn builtin_dispatcher(terminal: TerminalDispatcher, devnet: Arc<DevnetSupervisor>) -> Dispatcher {
    let mut dispatcher = Dispatcher::new("ws");
    dispatcher.register(
        HandlerDescriptor::new("ping", "Ping-pong liveness check"),
        Arc::new(PingHandler),
    );
    dispatcher.register(
        HandlerDescriptor::new("terminal", "Run input in an interactive terminal session"),
        Arc::new(TerminalHandler::new(terminal)),
    );
    dispatcher.register(
        HandlerDescriptor::new("stdin", "Write raw input to the devnet process"),
        Arc::new(StdinHandler {
            devnet: devnet.clone(),
        }),
    );
    dispatcher.register(
        HandlerDescriptor::new("start-devnet", "Start the local devnet node"),
        Arc::new(StartDevnetHandler {
            devnet: devnet.clone(),
        }),
    );
    dispatcher.register(
        HandlerDescriptor::new("stop-devnet", "Stop the local devnet node"),
        Arc::new(StopDevnetHandler { devnet }),
    );
    dispatcher
}
