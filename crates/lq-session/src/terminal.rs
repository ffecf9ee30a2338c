use lq_core::protocol::Event;
use lq_core::sink::EventSink;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pty::PtyError;
use crate::registry::SessionRegistry;
use crate::request::{RequestError, Signal, TerminalAction, TerminalCommand};

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// Drives the [`SessionRegistry`] from decoded terminal requests.
///
/// Each call returns as soon as the write or signal has been issued; output
/// and exit arrive later on the sink the session was created with.
#[derive(Debug, Clone)]
pub struct TerminalDispatcher {
    registry: SessionRegistry,
}

impl TerminalDispatcher {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Decode a raw `terminal` payload and run it.
    pub fn handle(&self, data: &Value, sink: &EventSink) -> Result<(), TerminalError> {
        match TerminalCommand::decode(data)? {
            Some(command) => self.dispatch(command, sink),
            None => {
                debug!("terminal request without command text, ignoring");
                Ok(())
            }
        }
    }

    pub fn dispatch(&self, command: TerminalCommand, sink: &EventSink) -> Result<(), TerminalError> {
        let TerminalCommand { session_id, action } = command;
        let (session, _created) = self.registry.get_or_create(&session_id, sink)?;
        let handle = session.handle();

        match action {
            TerminalAction::Signal(Signal::Terminate) => {
                if let Err(e) = handle.interrupt() {
                    debug!(%session_id, "interrupt before terminate failed: {e}");
                }
                if let Err(e) = handle.terminate() {
                    warn!(%session_id, "terminate failed: {e}");
                }
                sink.emit(Event::TerminalTerminated {
                    id: session_id.clone(),
                });
                self.registry.remove(&session_id);
                info!(%session_id, "terminal session terminated");
            }
            TerminalAction::Signal(Signal::Interrupt) => {
                handle.interrupt()?;
                sink.emit(Event::TerminalInterrupt { id: session_id });
            }
            TerminalAction::Write(text) => {
                handle.send_line(&text)?;
            }
        }
        Ok(())
    }
}
