use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ptyhub_terminal::TerminalEvent;
use ptyhub_types::StatusUpdate;

/// Error codes carried by `error` and `session:error` frames
pub mod codes {
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const INVALID_TERMINAL: &str = "INVALID_TERMINAL";
    pub const NOT_RUNNING: &str = "NOT_RUNNING";
    pub const BAD_MESSAGE: &str = "BAD_MESSAGE";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    #[serde(rename = "terminal:input")]
    Input { data: String },
    /// Signed so that negative sizes reach validation instead of failing
    /// to parse
    #[serde(rename = "terminal:resize")]
    Resize { cols: i64, rows: i64 },
    #[serde(rename = "terminal:signal")]
    Signal { signal: String },
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    /// Output produced before the connection attached. Sent exactly once,
    /// before any other output.
    #[serde(rename = "terminal:scrollback")]
    Scrollback { data: Vec<String> },
    #[serde(rename = "terminal:output")]
    Output {
        data: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "session:status")]
    Status(StatusUpdate),
    /// A request from this connection failed
    #[serde(rename = "session:error")]
    SessionError { code: String, message: String },
    /// Protocol fault or rejected handshake
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn session_error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::SessionError {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<TerminalEvent> for ServerMessage {
    fn from(event: TerminalEvent) -> Self {
        match event {
            TerminalEvent::Scrollback(data) => ServerMessage::Scrollback { data },
            TerminalEvent::Output { data, timestamp } => ServerMessage::Output { data, timestamp },
            TerminalEvent::Status(update) => ServerMessage::Status(update),
        }
    }
}
