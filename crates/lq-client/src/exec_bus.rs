//! In-process `exec_cmd` signalling.
//!
//! Any part of a UI can ask a terminal view to pre-fill (and optionally
//! submit) a line by publishing an [`ExecCommand`] addressed to its id.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecCommand {
    /// Terminal id the command is addressed to.
    pub id: String,
    pub cmd: String,
    #[serde(default)]
    pub submit: bool,
}

impl ExecCommand {
    pub fn new(id: impl Into<String>, cmd: impl Into<String>, submit: bool) -> Self {
        Self {
            id: id.into(),
            cmd: cmd.into(),
            submit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecBus {
    tx: broadcast::Sender<ExecCommand>,
}

impl ExecBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Deliver to every subscriber; returns how many received it.
    pub fn publish(&self, command: ExecCommand) -> usize {
        match self.tx.send(command) {
            Ok(n) => n,
            Err(broadcast::error::SendError(command)) => {
                debug!(id = %command.id, "exec_cmd with no listeners");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecCommand> {
        self.tx.subscribe()
    }
}

impl Default for ExecBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_the_command() {
        let bus = ExecBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let cmd = ExecCommand::new("devnet", "__interrupt__", true);
        assert_eq!(bus.publish(cmd.clone()), 2);
        assert_eq!(a.recv().await.unwrap(), cmd);
        assert_eq!(b.recv().await.unwrap(), cmd);
    }

    #[test]
    fn publishing_without_listeners_is_harmless() {
        assert_eq!(ExecBus::new().publish(ExecCommand::new("t", "ls", false)), 0);
    }

    #[test]
    fn submit_defaults_to_false() {
        let cmd: ExecCommand = serde_json::from_str(r#"{"id":"t","cmd":"ls"}"#).unwrap();
        assert!(!cmd.submit);
    }
}
