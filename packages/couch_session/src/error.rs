//! Error taxonomy for session operations.

use crate::types::DeviceId;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The operation needs an established session (or completed time sync).
    #[error("session not ready: {0}")]
    NotReady(&'static str),

    #[error("invalid target: {0} is not connected")]
    InvalidTarget(DeviceId),

    #[error("session closed")]
    SessionClosed,

    #[error("configuration error: {0}")]
    Configuration(String),

    /// The host sent something that violates the session model.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),
}

impl SessionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotReady(_) => "not_ready",
            Self::InvalidTarget(_) => "invalid_target",
            Self::SessionClosed => "session_closed",
            Self::Configuration(_) => "configuration",
            Self::Protocol(_) => "protocol",
            Self::Payload(_) => "payload",
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotReady(_) | Self::InvalidTarget(_))
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
