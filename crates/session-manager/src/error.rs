//! Session error types.

use thiserror::Error;

/// Errors surfaced by the session manager and its collaborators.
///
/// Messages never contain token values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Refresh failed but may succeed later (network, 5xx, 429, bad body).
    /// Retried with backoff; does not end the session.
    #[error("Token refresh failed temporarily: {0}")]
    RefreshTransientFailure(String),

    /// The refresh token can no longer be exchanged. Ends the session.
    #[error("Refresh token rejected: {0}")]
    RefreshTerminalFailure(String),

    /// Tokens handed to `login` are unusable (e.g. access token has no `exp`).
    #[error("Invalid token set: {0}")]
    InvalidTokenSet(String),

    /// The operation needs an authenticated session.
    #[error("No authenticated session")]
    NotAuthenticated,

    /// The shared session store failed.
    #[error("Session store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The manager was dropped while a subscriber was waiting.
    #[error("Session channel closed")]
    ChannelClosed,
}

impl SessionError {
    /// True for failures that end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionError::RefreshTerminalFailure(_))
    }
}
