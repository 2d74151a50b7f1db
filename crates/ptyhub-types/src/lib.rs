//! Core types and structures for ptyhub
//!
//! This crate provides the vocabulary shared by the process manager, the HTTP
//! control API and the streaming protocol: terminal kinds, lifecycle states,
//! signals, start configuration and status snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Terminal width used when a start request does not name one
pub const DEFAULT_COLS: u16 = 80;

/// Terminal height used when a start request does not name one
pub const DEFAULT_ROWS: u16 = 24;

/// Longest accepted terminal kind name
pub const MAX_KIND_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid terminal kind '{0}': expected 1-32 characters of [a-z0-9_-]")]
    InvalidKind(String),
    #[error("unknown signal '{0}'. Valid signals: SIGINT, SIGTERM, SIGKILL, SIGHUP, SIGQUIT")]
    UnknownSignal(String),
}

// ============================================================================
// Terminal kinds
// ============================================================================

/// Tag naming which logical process runs under a session.
///
/// Kinds are open-ended: the built-in ones cover the primary assistant CLI,
/// the alternate assistant CLI and a plain shell, and deployments may
/// configure more. Whether a kind is exclusive is a property of its
/// configuration, not of the tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TerminalKind(String);

impl TerminalKind {
    pub const ASSISTANT: &'static str = "assistant";
    pub const ALTERNATE: &'static str = "alternate";
    pub const SHELL: &'static str = "shell";

    pub fn new(name: impl Into<String>) -> Result<Self, ParseError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_KIND_LEN
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(name))
        } else {
            Err(ParseError::InvalidKind(name))
        }
    }

    pub fn assistant() -> Self {
        Self(Self::ASSISTANT.to_string())
    }

    pub fn alternate() -> Self {
        Self(Self::ALTERNATE.to_string())
    }

    pub fn shell() -> Self {
        Self(Self::SHELL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TerminalKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TerminalKind {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TerminalKind> for String {
    fn from(kind: TerminalKind) -> Self {
        kind.0
    }
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Exited,
}

impl ProcessState {
    /// Live states count towards the one-process-per-pair rule
    pub fn is_live(self) -> bool {
        !matches!(self, ProcessState::Exited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Exited => "exited",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a process ended. `code` is `None` when the process was finalized
/// without the OS reporting a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

impl ExitInfo {
    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn unknown() -> Self {
        Self { code: None }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Signals a client may deliver to a running terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
    Hangup,
    Quit,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Hangup => "SIGHUP",
            Signal::Quit => "SIGQUIT",
        }
    }

    /// Whether delivering this signal is a request for the process to end.
    /// An interrupt only cancels the foreground job.
    pub fn requests_exit(self) -> bool {
        !matches!(self, Signal::Interrupt)
    }
}

impl FromStr for Signal {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "INT" => Ok(Signal::Interrupt),
            "TERM" => Ok(Signal::Terminate),
            "KILL" => Ok(Signal::Kill),
            "HUP" => Ok(Signal::Hangup),
            "QUIT" => Ok(Signal::Quit),
            _ => Err(ParseError::UnknownSignal(s.to_string())),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Requests and snapshots
// ============================================================================

/// Per-request launch configuration, merged with the kind's configured
/// arguments before the process is spawned
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartConfig {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// A lifecycle transition, as broadcast to every subscriber of a terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Set when the process ended without being asked to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time view of one managed terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalStatus {
    pub session_id: String,
    pub terminal: TerminalKind,
    pub running: bool,
    pub status: ProcessState,
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// User who asked for the process, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_by: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub subscribers: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}
