//! Decoding of `terminal` payloads.
//!
//! The wire shape is `{cmd, args, id}` where `cmd` is a fixed marker and the
//! text to run travels in `args[1]`. Control requests are recognised here,
//! once, and handed on as [`TerminalAction::Signal`] so nothing downstream
//! compares strings.

use lq_core::protocol::RequestId;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub const TERMINATE_SENTINEL: &str = "__terminate__";
pub const INTERRUPT_SENTINEL: &str = "__interrupt__";

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Missing cmd or id")]
    MissingCmdOrId,

    #[error("Invalid terminal request: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Interrupt,
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalAction {
    /// Literal text, written followed by a carriage return.
    Write(String),
    Signal(Signal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalCommand {
    pub session_id: String,
    pub action: TerminalAction,
}

#[derive(Debug, Default, Deserialize)]
struct TerminalPayload {
    #[serde(default)]
    cmd: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    signal: Option<Signal>,
}

impl TerminalCommand {
    pub fn write(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            action: TerminalAction::Write(text.into()),
        }
    }

    pub fn signal(session_id: impl Into<String>, signal: Signal) -> Self {
        Self {
            session_id: session_id.into(),
            action: TerminalAction::Signal(signal),
        }
    }

    /// Decode a `terminal` payload.
    ///
    /// `Ok(None)` means there is nothing to run (no `args[1]`, no `signal`);
    /// the request is accepted and ignored.
    pub fn decode(data: &Value) -> Result<Option<Self>, RequestError> {
        let payload = match data {
            Value::Object(_) => TerminalPayload::deserialize(data)?,
            _ => TerminalPayload::default(),
        };

        let has_cmd = payload.cmd.as_deref().is_some_and(|c| !c.is_empty());
        let session_id = payload
            .id
            .map(|id| id.to_string())
            .filter(|id| !id.is_empty());
        let session_id = match session_id {
            Some(id) if has_cmd => id,
            _ => return Err(RequestError::MissingCmdOrId),
        };

        if let Some(signal) = payload.signal {
            return Ok(Some(Self::signal(session_id, signal)));
        }

        let text = payload
            .args
            .unwrap_or_default()
            .into_iter()
            .nth(1)
            .filter(|t| !t.is_empty());
        let Some(text) = text else {
            return Ok(None);
        };

        let action = match text.as_str() {
            TERMINATE_SENTINEL => TerminalAction::Signal(Signal::Terminate),
            INTERRUPT_SENTINEL => TerminalAction::Signal(Signal::Interrupt),
            _ => TerminalAction::Write(text),
        };
        Ok(Some(Self { session_id, action }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literal_command_is_a_write() {
        let cmd = TerminalCommand::decode(&json!({
            "cmd": "sh", "args": ["-lc", "echo hi"], "id": "t1"
        }))
        .unwrap()
        .unwrap();
        assert_eq!(cmd, TerminalCommand::write("t1", "echo hi"));
    }

    #[test]
    fn sentinels_become_signals() {
        let term = TerminalCommand::decode(&json!({
            "cmd": "sh", "args": ["-lc", "__terminate__"], "id": "t1"
        }))
        .unwrap()
        .unwrap();
        assert_eq!(term.action, TerminalAction::Signal(Signal::Terminate));

        let int = TerminalCommand::decode(&json!({
            "cmd": "sh", "args": ["-lc", "__interrupt__"], "id": "t1"
        }))
        .unwrap()
        .unwrap();
        assert_eq!(int.action, TerminalAction::Signal(Signal::Interrupt));
    }

    #[test]
    fn explicit_signal_wins_over_args() {
        let cmd = TerminalCommand::decode(&json!({
            "cmd": "sh", "args": ["-lc", "ls"], "id": "t1", "signal": "interrupt"
        }))
        .unwrap()
        .unwrap();
        assert_eq!(cmd, TerminalCommand::signal("t1", Signal::Interrupt));
    }

    #[test]
    fn missing_cmd_or_id_is_rejected() {
        for data in [
            json!({"args": ["-lc", "ls"], "id": "t1"}),
            json!({"cmd": "sh", "args": ["-lc", "ls"]}),
            json!({"cmd": "", "id": "t1"}),
            json!({"cmd": "sh", "id": ""}),
            Value::Null,
        ] {
            let err = TerminalCommand::decode(&data).unwrap_err();
            assert_eq!(err.to_string(), "Missing cmd or id");
        }
    }

    #[test]
    fn absent_text_is_a_no_op() {
        assert!(TerminalCommand::decode(&json!({"cmd": "sh", "id": "t1"}))
            .unwrap()
            .is_none());
        assert!(TerminalCommand::decode(&json!({"cmd": "sh", "id": "t1", "args": ["-lc"]}))
            .unwrap()
            .is_none());
        assert!(TerminalCommand::decode(&json!({"cmd": "sh", "id": "t1", "args": ["-lc", ""]}))
            .unwrap()
            .is_none());
    }

    #[test]
    fn numeric_session_id_is_stringified() {
        let cmd = TerminalCommand::decode(&json!({"cmd": "sh", "args": ["-lc", "pwd"], "id": 7}))
            .unwrap()
            .unwrap();
        assert_eq!(cmd.session_id, "7");
    }

    #[test]
    fn malformed_args_are_reported() {
        let err = TerminalCommand::decode(&json!({"cmd": "sh", "id": "t1", "args": [1, 2]}))
            .unwrap_err();
        assert!(matches!(err, RequestError::Malformed(_)));
    }
}
