use lq_core::protocol::RequestId;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("request {id} timed out")]
    Timeout {
        id: RequestId,
        method: Option<String>,
    },

    #[error("request rejected: {0}")]
    Rejected(Value),

    #[error("connection closed before a response arrived")]
    Closed,

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket connect failed: {0}")]
    Connect(#[source] Box<tokio_tungstenite::tungstenite::Error>),
}

pub type Result<T> = std::result::Result<T, ClientError>;
