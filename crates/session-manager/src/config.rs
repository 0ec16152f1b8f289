//! Session manager configuration.

use crate::error::SessionError;
use common::role::ClaimMapping;
use std::time::Duration;

/// Default refresh skew (refresh 5 minutes before the access token expires).
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(300);

/// Default HTTP request timeout for the refresh exchange.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default refresh attempts per cycle before giving up until the next cycle.
pub const DEFAULT_MAX_REFRESH_ATTEMPTS: u32 = 5;

/// Initial backoff delay for retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(1000);

/// Maximum backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// Configuration for the session manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// OAuth2 token endpoint accepting `grant_type=refresh_token`.
    pub refresh_endpoint: String,

    /// Public OAuth client ID (no secret).
    pub client_id: String,

    /// Refresh this long before the access token expires.
    pub refresh_skew: Duration,

    /// HTTP request timeout.
    pub http_timeout: Duration,

    /// Refresh attempts per cycle.
    pub max_refresh_attempts: u32,

    /// First retry delay; doubles per attempt.
    pub initial_backoff: Duration,

    /// Cap on the retry delay, also the pause between exhausted cycles.
    pub max_backoff: Duration,

    /// Claim names for reading the identity hint.
    pub claim_mapping: ClaimMapping,
}

impl SessionConfig {
    /// Create a new configuration with defaults.
    ///
    /// # Security Warning
    ///
    /// Refresh tokens travel in the request body. Use
    /// [`SessionConfig::new_secure`] to enforce HTTPS.
    #[must_use]
    pub fn new(refresh_endpoint: String, client_id: String) -> Self {
        Self {
            refresh_endpoint,
            client_id,
            refresh_skew: DEFAULT_REFRESH_SKEW,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            max_refresh_attempts: DEFAULT_MAX_REFRESH_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            claim_mapping: ClaimMapping::default(),
        }
    }

    /// Create a new configuration requiring HTTPS.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Configuration` if the URL doesn't use HTTPS.
    pub fn new_secure(refresh_endpoint: String, client_id: String) -> Result<Self, SessionError> {
        if !refresh_endpoint.starts_with("https://") {
            return Err(SessionError::Configuration(
                "Refresh endpoint must use HTTPS in production".into(),
            ));
        }
        Ok(Self::new(refresh_endpoint, client_id))
    }

    /// Set the refresh skew.
    #[must_use]
    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }

    /// Set the HTTP timeout.
    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Set the refresh attempts per cycle (at least 1).
    #[must_use]
    pub fn with_max_refresh_attempts(mut self, attempts: u32) -> Self {
        self.max_refresh_attempts = attempts.max(1);
        self
    }

    /// Set the backoff range.
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Set the claim mapping used for identity hints.
    #[must_use]
    pub fn with_claim_mapping(mut self, mapping: ClaimMapping) -> Self {
        self.claim_mapping = mapping;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::new("http://localhost:9000/oauth2/token".into(), "web".into());

        assert_eq!(config.refresh_skew, Duration::from_secs(300));
        assert_eq!(config.http_timeout, Duration::from_secs(10));
        assert_eq!(config.max_refresh_attempts, 5);
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert_eq!(config.claim_mapping, ClaimMapping::cognito());
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::new("http://localhost".into(), "web".into())
            .with_refresh_skew(Duration::from_secs(60))
            .with_http_timeout(Duration::from_secs(2))
            .with_max_refresh_attempts(0)
            .with_backoff(Duration::from_millis(500), Duration::from_millis(100))
            .with_claim_mapping(ClaimMapping::standard());

        assert_eq!(config.refresh_skew, Duration::from_secs(60));
        assert_eq!(config.http_timeout, Duration::from_secs(2));
        assert_eq!(config.max_refresh_attempts, 1);
        assert_eq!(config.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.max_backoff, Duration::from_millis(500));
        assert_eq!(config.claim_mapping, ClaimMapping::standard());
    }

    #[test]
    fn test_new_secure_requires_https() {
        let result = SessionConfig::new_secure("http://auth.example.com".into(), "web".into());
        assert!(matches!(result, Err(SessionError::Configuration(_))));

        let config =
            SessionConfig::new_secure("https://auth.example.com/oauth2/token".into(), "web".into())
                .unwrap();
        assert_eq!(config.refresh_endpoint, "https://auth.example.com/oauth2/token");
    }
}
