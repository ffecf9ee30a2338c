//! Wire protocol shared by the HTTP and WebSocket transports.
//!
//! Inbound frames are `{type, data, id}` envelopes ([`Request`]). Outbound
//! frames are [`EventFrame`]s: an [`Event`] plus the correlation id of the
//! request that produced it, serialized to the same `{type, data, id}` shape.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson(#[source] serde_json::Error),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// Client-chosen correlation id. Numbers (including negative and fractional
/// ones) and strings are both accepted and echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    Text(String),
}

impl RequestId {
    /// Extract an id from an arbitrary JSON value (`null` and other shapes
    /// yield `None`).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(RequestId::Number(n.clone())),
            Value::String(s) => Some(RequestId::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Text(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::Text(s)
    }
}

// ---------------------------------------------------------------------------
// Request envelope
// ---------------------------------------------------------------------------

/// Request kind used when a frame carries no usable `type`. It never matches
/// a registered handler, so the frame is answered with "Unknown type".
pub const MISSING_KIND: &str = "undefined";

/// One inbound `{type, data, id}` frame.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl Request {
    pub fn new(kind: impl Into<String>, data: Value, id: Option<RequestId>) -> Self {
        Self {
            kind: kind.into(),
            data,
            id,
        }
    }

    /// Parse a text frame. Only malformed JSON is an error; a well-formed
    /// frame of the wrong shape becomes a request of kind [`MISSING_KIND`].
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text)
            .map(Self::from_value)
            .map_err(ProtocolError::InvalidJson)
    }

    pub fn parse_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes)
            .map(Self::from_value)
            .map_err(ProtocolError::InvalidJson)
    }

    /// Build a request from any JSON value. Non-objects carry no type, data
    /// or id. An id that is neither a number nor a string is dropped.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            return Self::new(MISSING_KIND, Value::Null, None);
        };
        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            None | Some(Value::Null) => MISSING_KIND.to_string(),
            Some(other) => other.to_string(),
        };
        let data = fields.remove("data").unwrap_or(Value::Null);
        let id = fields.get("id").and_then(RequestId::from_value);
        Self { kind, data, id }
    }
}

impl<'de> Deserialize<'de> for Request {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_value)
    }
}

// ---------------------------------------------------------------------------
// EditorOp
// ---------------------------------------------------------------------------

/// Operations accepted on the `/editor` transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditorOp {
    TreeGet,
    FileRead,
    FileWrite,
    FileCreate,
    FileDelete,
    FileRename,
    FolderCreate,
    FolderDelete,
    FolderRename,
}

impl EditorOp {
    pub const ALL: [EditorOp; 9] = [
        EditorOp::TreeGet,
        EditorOp::FileRead,
        EditorOp::FileWrite,
        EditorOp::FileCreate,
        EditorOp::FileDelete,
        EditorOp::FileRename,
        EditorOp::FolderCreate,
        EditorOp::FolderDelete,
        EditorOp::FolderRename,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EditorOp::TreeGet => "tree:get",
            EditorOp::FileRead => "file:read",
            EditorOp::FileWrite => "file:write",
            EditorOp::FileCreate => "file:create",
            EditorOp::FileDelete => "file:delete",
            EditorOp::FileRename => "file:rename",
            EditorOp::FolderCreate => "folder:create",
            EditorOp::FolderDelete => "folder:delete",
            EditorOp::FolderRename => "folder:rename",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

impl fmt::Display for EditorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Everything a handler can report back to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Pong(String),
    Success(Value),
    Log(String),
    Error(String),
    /// Devnet process output.
    Stdout(String),
    Stderr(String),
    Exit { code: Option<i32> },
    TerminalStarted { id: String },
    TerminalStdout(String),
    TerminalStderr(String),
    TerminalExit { code: Option<i32> },
    TerminalTerminated { id: String },
    TerminalInterrupt { id: String },
    EditorOk { op: EditorOp, data: Value },
    EditorError { op: EditorOp, data: Value },
}

impl Event {
    pub fn error(message: impl Into<String>) -> Self {
        Event::Error(message.into())
    }

    /// The `type` field on the wire.
    pub fn event_type(&self) -> Cow<'static, str> {
        match self {
            Event::Pong(_) => Cow::Borrowed("pong"),
            Event::Success(_) => Cow::Borrowed("success"),
            Event::Log(_) => Cow::Borrowed("log"),
            Event::Error(_) => Cow::Borrowed("error"),
            Event::Stdout(_) => Cow::Borrowed("stdout"),
            Event::Stderr(_) => Cow::Borrowed("stderr"),
            Event::Exit { .. } => Cow::Borrowed("exit"),
            Event::TerminalStarted { .. } => Cow::Borrowed("terminal.started"),
            Event::TerminalStdout(_) => Cow::Borrowed("terminal.stdout"),
            Event::TerminalStderr(_) => Cow::Borrowed("terminal.stderr"),
            Event::TerminalExit { .. } => Cow::Borrowed("terminal.exit"),
            Event::TerminalTerminated { .. } => Cow::Borrowed("terminal.terminated"),
            Event::TerminalInterrupt { .. } => Cow::Borrowed("terminal.interrupt"),
            Event::EditorOk { op, .. } => Cow::Owned(format!("{}:ok", op.as_str())),
            Event::EditorError { op, .. } => Cow::Owned(format!("{}:error", op.as_str())),
        }
    }

    /// The `data` field on the wire.
    pub fn data(&self) -> Value {
        match self {
            Event::Pong(text)
            | Event::Log(text)
            | Event::Error(text)
            | Event::Stdout(text)
            | Event::Stderr(text)
            | Event::TerminalStdout(text)
            | Event::TerminalStderr(text) => Value::String(text.clone()),
            Event::Success(value) => value.clone(),
            Event::Exit { code } | Event::TerminalExit { code } => json!({ "code": code }),
            Event::TerminalStarted { id }
            | Event::TerminalTerminated { id }
            | Event::TerminalInterrupt { id } => json!({ "id": id }),
            Event::EditorOk { data, .. } | Event::EditorError { data, .. } => data.clone(),
        }
    }

    /// Rebuild an event from its wire `type` and `data`.
    pub fn from_wire(kind: &str, data: Value) -> Result<Self, ProtocolError> {
        let event = match kind {
            "pong" => Event::Pong(text_of(data)),
            "success" => Event::Success(data),
            "log" => Event::Log(text_of(data)),
            "error" => Event::Error(text_of(data)),
            "stdout" => Event::Stdout(text_of(data)),
            "stderr" => Event::Stderr(text_of(data)),
            "exit" => Event::Exit {
                code: code_of(&data),
            },
            "terminal.started" => Event::TerminalStarted { id: id_of(&data) },
            "terminal.stdout" => Event::TerminalStdout(text_of(data)),
            "terminal.stderr" => Event::TerminalStderr(text_of(data)),
            "terminal.exit" => Event::TerminalExit {
                code: code_of(&data),
            },
            "terminal.terminated" => Event::TerminalTerminated { id: id_of(&data) },
            "terminal.interrupt" => Event::TerminalInterrupt { id: id_of(&data) },
            other => {
                if let Some(op) = other.strip_suffix(":ok").and_then(EditorOp::parse) {
                    Event::EditorOk { op, data }
                } else if let Some(op) = other.strip_suffix(":error").and_then(EditorOp::parse) {
                    Event::EditorError { op, data }
                } else {
                    return Err(ProtocolError::UnknownEventType(other.to_string()));
                }
            }
        };
        Ok(event)
    }

    /// Whether a one-shot transport may answer immediately with this event.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Event::Exit { .. } | Event::TerminalExit { .. } | Event::Error(_)
        )
    }
}

fn text_of(data: Value) -> String {
    match data {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn code_of(data: &Value) -> Option<i32> {
    data.get("code")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok())
}

fn id_of(data: &Value) -> String {
    data.get("id")
        .and_then(RequestId::from_value)
        .map(|id| id.to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// EventFrame
// ---------------------------------------------------------------------------

/// An [`Event`] stamped with the correlation id of the request it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub event: Event,
    pub id: Option<RequestId>,
}

impl EventFrame {
    pub fn new(event: Event, id: Option<RequestId>) -> Self {
        Self { event, id }
    }

    /// A frame with no correlation id.
    pub fn bare(event: Event) -> Self {
        Self { event, id: None }
    }

    pub fn to_json(&self) -> String {
        // Serializing a Value-backed struct cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","data":"failed to serialize event"}"#.to_string()
        })
    }
}

#[derive(Serialize)]
struct WireFrameRef<'a> {
    #[serde(rename = "type")]
    kind: Cow<'static, str>,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a RequestId>,
}

#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    id: Option<RequestId>,
}

impl Serialize for EventFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireFrameRef {
            kind: self.event.event_type(),
            data: self.event.data(),
            id: self.id.as_ref(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EventFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireFrame::deserialize(deserializer)?;
        let event = Event::from_wire(&wire.kind, wire.data).map_err(serde::de::Error::custom)?;
        Ok(EventFrame { event, id: wire.id })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
