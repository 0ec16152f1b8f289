//! Session state as stored, and as observed by subscribers.

use crate::error::SessionError;
use chrono::{DateTime, Utc};
use common::jwt::{peek_expiry, peek_payload};
use common::role::{ClaimMapping, Role};
use common::secret::{ExposeSecret, SecretString};
use serde_json::Value;
use std::fmt;

/// Tokens as issued by the identity provider.
///
/// `SecretString` keeps every value out of `Debug` output.
#[derive(Clone, Debug)]
pub struct TokenSet {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub id_token: Option<SecretString>,
}

impl TokenSet {
    /// Token set as issued at sign-in. `id_token` is `None` when the grant
    /// returned none.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        id_token: Option<String>,
    ) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            refresh_token: SecretString::from(refresh_token.into()),
            id_token: id_token.map(SecretString::from),
        }
    }

    /// Expiry (`exp`, Unix seconds) of the access token.
    ///
    /// The token is read, not verified: verification is the server's job,
    /// the client only needs to know when to refresh.
    ///
    /// # Errors
    ///
    /// `InvalidTokenSet` if the access token is not a JWT with a numeric
    /// `exp`.
    pub fn access_expiry(&self) -> Result<i64, SessionError> {
        peek_expiry(self.access_token.expose_secret())
            .map_err(|_| SessionError::InvalidTokenSet("access token has no readable expiry".into()))
    }
}

/// Session status.
///
/// `Authenticating` and `Refreshing` only ever exist in one context's
/// snapshot; the shared store holds `Unauthenticated`, `Authenticated` or
/// `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    Expired,
}

/// One generation of the shared session.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Strictly increasing across every committed change.
    pub generation: u64,
    pub status: SessionStatus,
    pub tokens: Option<TokenSet>,
    /// Access token `exp` (Unix seconds).
    pub access_expires_at: Option<i64>,
}

/// Who the session belongs to, read from the identity (or access) token.
///
/// This is a display hint for the client. It is not verified; servers
/// authorize with their own validated principal.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub role: Role,
    pub email: Option<String>,
}

impl Identity {
    /// Read the identity from a token's payload.
    ///
    /// Returns `None` when the payload cannot be read or has no subject.
    pub fn from_token(token: &str, mapping: &ClaimMapping) -> Option<Self> {
        let payload = peek_payload(token).ok()?;
        let subject = payload
            .get("sub")
            .and_then(Value::as_str)
            .filter(|sub| !sub.is_empty())?
            .to_string();
        let email = payload
            .get("email")
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(Self {
            subject,
            role: mapping.resolve(&payload),
            email,
        })
    }

    fn from_tokens(tokens: &TokenSet, mapping: &ClaimMapping) -> Option<Self> {
        tokens
            .id_token
            .as_ref()
            .and_then(|id| Self::from_token(id.expose_secret(), mapping))
            .or_else(|| Self::from_token(tokens.access_token.expose_secret(), mapping))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("subject", &"[REDACTED]")
            .field("role", &self.role)
            .field("email", &self.email.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// What one context currently believes about the session.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub generation: u64,
    pub access_expires_at: Option<i64>,
    /// When the next background refresh is due, if one is scheduled.
    pub refresh_at: Option<DateTime<Utc>>,
    /// Most recent refresh failure that has not been recovered from.
    pub last_error: Option<SessionError>,
    pub identity: Option<Identity>,
    pub tokens: Option<TokenSet>,
}

impl SessionSnapshot {
    pub(crate) fn from_state(
        state: &SessionState,
        refresh_at: Option<DateTime<Utc>>,
        last_error: Option<SessionError>,
        mapping: &ClaimMapping,
    ) -> Self {
        Self {
            status: state.status,
            generation: state.generation,
            access_expires_at: state.access_expires_at,
            refresh_at,
            last_error,
            identity: state
                .tokens
                .as_ref()
                .and_then(|tokens| Identity::from_tokens(tokens, mapping)),
            tokens: state.tokens.clone(),
        }
    }

    /// Identity of the signed-in user.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Access token to present as `Authorization: Bearer`.
    pub fn access_token(&self) -> Option<&SecretString> {
        self.tokens.as_ref().map(|tokens| &tokens.access_token)
    }

    /// True while the session holds usable tokens.
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Authenticated | SessionStatus::Refreshing
        )
    }

    /// True when the caller should send the user back to sign-in.
    pub fn requires_login(&self) -> bool {
        self.status == SessionStatus::Expired
    }
}
