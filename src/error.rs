use thiserror::Error;

use crate::session::SessionId;

/// Errors surfaced by the session orchestration core.
///
/// Per-session failures after a session is running are not returned from
/// here; they are recorded on the session as an `Errored` transition.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad creation parameters or configuration, rejected before any spawn
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Too many live sessions; terminate one first
    #[error("session limit reached ({limit} live sessions)")]
    CapacityExceeded { limit: usize },

    /// The OS refused to start the process
    #[error("failed to spawn `{command}` for session {id}: {source}")]
    Spawn {
        id: SessionId,
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The session's input queue stayed full past the send timeout
    #[error("input queue for session {0} is full")]
    Backpressure(SessionId),

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {0} is still running")]
    StillRunning(SessionId),

    #[error("session {0} is not running")]
    NotRunning(SessionId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    /// No scheduler available for the I/O pumps
    #[error("runtime unavailable: {0}")]
    Runtime(String),
}

impl CoreError {
    /// Whether the error leaves the orchestrator unable to continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Runtime(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
