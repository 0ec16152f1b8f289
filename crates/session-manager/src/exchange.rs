//! Refresh token exchange.
//!
//! Swaps a refresh token for new tokens at the identity provider's OAuth2
//! token endpoint (`grant_type=refresh_token`, public client).
//!
//! # Failure classification
//!
//! - 400/401: the refresh token was revoked or expired (`invalid_grant`).
//!   Terminal, the session ends.
//! - Network errors, timeouts, 5xx, 429, any other status, or an
//!   unparsable body: transient, retried with backoff.
//!
//! Response bodies of rejections are only logged at trace level.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::state::TokenSet;
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

/// Connection timeout for the token endpoint.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Tokens returned by a successful exchange.
///
/// Providers may omit the refresh token (Cognito never rotates it) and the
/// identity token.
#[derive(Clone, Debug)]
pub struct RefreshedTokens {
    pub access_token: SecretString,
    pub id_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
}

impl RefreshedTokens {
    /// Merge into the token set the refresh started from; anything the
    /// provider did not return is kept.
    pub fn merge_into(self, previous: &TokenSet) -> TokenSet {
        TokenSet {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .unwrap_or_else(|| previous.refresh_token.clone()),
            id_token: self.id_token.or_else(|| previous.id_token.clone()),
        }
    }
}

/// Exchanges refresh tokens for new tokens.
#[async_trait]
pub trait RefreshExchange: Send + Sync {
    /// # Errors
    ///
    /// `RefreshTerminalFailure` if the refresh token is no longer accepted,
    /// `RefreshTransientFailure` for anything that may succeed on retry.
    async fn exchange(&self, refresh_token: &SecretString) -> Result<RefreshedTokens, SessionError>;
}

/// OAuth2 token response.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// OAuth2 error response (`{"error": "invalid_grant"}`).
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// [`RefreshExchange`] over HTTP.
pub struct HttpRefreshExchange {
    endpoint: String,
    client_id: String,
    http_client: reqwest::Client,
}

impl HttpRefreshExchange {
    /// Build an exchange for the configured token endpoint.
    ///
    /// # Errors
    ///
    /// `Configuration` if the HTTP client cannot be built.
    pub fn new(config: &SessionConfig) -> Result<Self, SessionError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SessionError::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            endpoint: config.refresh_endpoint.clone(),
            client_id: config.client_id.clone(),
            http_client,
        })
    }
}

#[async_trait]
impl RefreshExchange for HttpRefreshExchange {
    #[instrument(skip_all)]
    async fn exchange(&self, refresh_token: &SecretString) -> Result<RefreshedTokens, SessionError> {
        debug!(
            target: "session.exchange",
            client_id = %self.client_id,
            url = %self.endpoint,
            "Exchanging refresh token"
        );

        let form_body = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token.expose_secret()),
        ];

        let response = self
            .http_client
            .post(&self.endpoint)
            .form(&form_body)
            .send()
            .await
            .map_err(|e| {
                debug!(target: "session.exchange", error = %e, "HTTP request failed");
                SessionError::RefreshTransientFailure(format!("HTTP request failed: {e}"))
            })?;

        let status = response.status();

        if status.is_success() {
            let body: TokenResponse = response.json().await.map_err(|e| {
                warn!(target: "session.exchange", error = %e, "Failed to parse token response");
                SessionError::RefreshTransientFailure(format!("Invalid token response: {e}"))
            })?;

            debug!(
                target: "session.exchange",
                expires_in_secs = ?body.expires_in,
                rotated = body.refresh_token.is_some(),
                "Refresh token exchanged"
            );

            Ok(RefreshedTokens {
                access_token: SecretString::from(body.access_token),
                id_token: body.id_token.map(SecretString::from),
                refresh_token: body.refresh_token.map(SecretString::from),
            })
        } else if status.as_u16() == 400 || status.as_u16() == 401 {
            let body = response.text().await.unwrap_or_else(|e| {
                trace!(target: "session.exchange", error = %e, "Failed to read error response body");
                String::new()
            });
            trace!(target: "session.exchange", body = %body, "Refresh rejection response body");

            let reason = serde_json::from_str::<ErrorResponse>(&body)
                .map_or_else(|_| format!("Status {status}"), |e| e.error);
            warn!(
                target: "session.exchange",
                status = %status,
                reason = %reason,
                "Refresh token rejected"
            );
            Err(SessionError::RefreshTerminalFailure(reason))
        } else if status.is_server_error() || status.as_u16() == 429 {
            warn!(target: "session.exchange", status = %status, "Token endpoint unavailable");
            Err(SessionError::RefreshTransientFailure(format!(
                "Token endpoint returned {status}"
            )))
        } else {
            warn!(target: "session.exchange", status = %status, "Unexpected response from token endpoint");
            Err(SessionError::RefreshTransientFailure(format!(
                "Unexpected status: {status}"
            )))
        }
    }
}
