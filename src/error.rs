//! Error taxonomy shared by every component of the orchestrator.

use std::time::Duration;

use crate::session::SessionId;

/// The single error hierarchy surfaced to callers of `hmon-core`.
///
/// Per-request errors (`SessionNotFound`, `CommandTimeout`, `Cancelled`) fail
/// only the caller; the session continues. `Protocol` and `ConnectionLost`
/// are fatal to the session that produced them.
#[derive(Debug, thiserror::Error)]
pub enum HmonError {
    #[error("session {0} not found or not ready")]
    SessionNotFound(SessionId),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("command {command} timed out after {duration:?}")]
    CommandTimeout { command: String, duration: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HmonResult<T> = Result<T, HmonError>;
