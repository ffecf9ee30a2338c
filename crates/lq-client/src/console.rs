//! Line-buffered terminal view state.
//!
//! A [`TerminalConsole`] turns keystrokes into terminal requests and turns
//! the frames addressed to its id back into text for the screen. Rendering
//! itself is left to the caller.

use serde_json::{json, Value};

use crate::exec_bus::ExecCommand;

const ENTER: &str = "\r";
const BACKSPACE: &str = "\u{7f}";
const ARROW_UP: &str = "\x1b[A";
const ARROW_DOWN: &str = "\x1b[B";

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[3J\x1b[H";
const CLEAR_LINE: &str = "\r\x1b[2K";

/// Result of one keystroke: text to echo and, on enter, a frame to send.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct KeyOutcome {
    pub echo: String,
    pub send: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct TerminalConsole {
    id: String,
    prompt: String,
    line: String,
    history: Vec<String>,
    history_index: usize,
}

impl TerminalConsole {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: "$ ".into(),
            line: String::new(),
            history: Vec::new(),
            history_index: 0,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// The line being edited.
    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn handle_key(&mut self, key: &str) -> KeyOutcome {
        match key {
            ENTER => self.enter(),
            BACKSPACE => {
                if self.line.pop().is_some() {
                    echo("\x08 \x08")
                } else {
                    KeyOutcome::default()
                }
            }
            ARROW_UP => {
                if self.history_index > 0 {
                    self.history_index -= 1;
                    self.line = self.history[self.history_index].clone();
                }
                echo(self.redraw())
            }
            ARROW_DOWN => {
                if self.history_index + 1 < self.history.len() {
                    self.history_index += 1;
                    self.line = self.history[self.history_index].clone();
                } else {
                    self.line.clear();
                }
                echo(self.redraw())
            }
            text => {
                self.line.push_str(text);
                echo(text)
            }
        }
    }

    /// Pre-fill the line from an `exec_cmd`, submitting it when asked.
    /// Commands addressed to another terminal return `None`.
    pub fn apply_exec(&mut self, command: &ExecCommand) -> Option<KeyOutcome> {
        if command.id != self.id {
            return None;
        }
        self.line = command.cmd.clone();
        let mut outcome = echo(self.redraw());
        if command.submit {
            let submitted = self.enter();
            outcome.echo.push_str(&submitted.echo);
            outcome.send = submitted.send;
        }
        Some(outcome)
    }

    /// Screen text for an inbound frame, or `None` when it belongs to
    /// another terminal or carries nothing to show.
    pub fn handle_frame(&self, frame: &Value) -> Option<String> {
        if frame.get("id").and_then(Value::as_str) != Some(self.id.as_str()) {
            return None;
        }
        match frame.get("type").and_then(Value::as_str)? {
            "stdout" | "stderr" | "terminal.stdout" | "terminal.stderr" => {
                let text = match frame.get("data") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                Some(text.replace('\n', "\r\n"))
            }
            "exit" | "terminal.exit" => {
                let code = frame
                    .get("data")
                    .and_then(|d| d.get("code"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                if code != 0 {
                    Some(format!("\r\n[process exited: {code}]\r\n{}", self.prompt))
                } else {
                    Some(self.prompt.clone())
                }
            }
            _ => None,
        }
    }

    /// The request a submitted line turns into.
    pub fn request_for(&self, line: &str) -> Value {
        json!({
            "id": self.id,
            "type": "terminal",
            "data": { "cmd": "sh", "args": ["-lc", line], "id": self.id },
        })
    }

    fn enter(&mut self) -> KeyOutcome {
        let command = std::mem::take(&mut self.line).trim().to_string();
        if command == "clear" {
            return echo(format!("{CLEAR_SCREEN}{}", self.prompt));
        }
        if command.is_empty() {
            return echo("\r\n");
        }
        let send = Some(self.request_for(&command));
        self.history.push(command);
        self.history_index = self.history.len();
        KeyOutcome {
            echo: "\r\n".into(),
            send,
        }
    }

    fn redraw(&self) -> String {
        format!("{CLEAR_LINE}{}{}", self.prompt, self.line)
    }
}

fn echo(text: impl Into<String>) -> KeyOutcome {
    KeyOutcome {
        echo: text.into(),
        send: None,
    }
}
