use ptyhub_types::TerminalKind;
use thiserror::Error;

/// Failures surfaced by the process manager
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("terminal '{kind}' is already running for session '{session_id}'")]
    AlreadyRunning {
        session_id: String,
        kind: TerminalKind,
    },
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TerminalError {
    /// Stable machine-readable code for HTTP bodies and error frames
    pub fn code(&self) -> &'static str {
        match self {
            TerminalError::Validation(_) => "VALIDATION_ERROR",
            TerminalError::NotFound(_) => "NOT_FOUND",
            TerminalError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            TerminalError::Spawn(_) => "SPAWN_FAILED",
            TerminalError::Io(_) => "IO_ERROR",
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        TerminalError::Validation(message.into())
    }

    pub(crate) fn not_running(session_id: &str, kind: &TerminalKind) -> Self {
        TerminalError::NotFound(format!(
            "no terminal '{}' is running for session '{}'",
            kind, session_id
        ))
    }
}

pub type Result<T, E = TerminalError> = std::result::Result<T, E>;
