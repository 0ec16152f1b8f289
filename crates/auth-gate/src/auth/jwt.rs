//! Token validation.
//!
//! Verifies bearer tokens against keys served by the [`KeyCache`].
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Only RS256 and EdDSA are accepted; the header `alg` must also match
//!   the algorithm of the key it names
//! - Expiry is checked with a small clock skew allowance, no other grace
//! - Generic error messages prevent information leakage
//!
//! # Order of checks
//!
//! structure, algorithm, key lookup, signature, expiry, issuer, audience,
//! subject. The first failing check decides the error kind.

use crate::auth::claims::Claims;
use crate::auth::jwks::{KeyAlgorithm, KeyCache};
use crate::errors::AuthError;
use crate::observability::metrics::record_token_validation;
use common::jwt::{decode_header, peek_payload, DEFAULT_CLOCK_SKEW};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Validation};
use std::time::Duration;
use tracing::instrument;

/// Token validator bound to one issuer.
pub struct TokenValidator {
    /// Cache of the issuer's signing keys.
    key_cache: KeyCache,

    /// Expected `iss` claim.
    issuer: String,

    /// Expected `aud`/`client_id`, if audience is checked.
    audience: Option<String>,

    /// Allowance past `exp` before a token counts as expired.
    clock_skew: Duration,
}

impl TokenValidator {
    /// Create a validator for `issuer` with the default clock skew and no
    /// audience check.
    pub fn new(key_cache: KeyCache, issuer: impl Into<String>) -> Self {
        Self {
            key_cache,
            issuer: issuer.into(),
            audience: None,
            clock_skew: DEFAULT_CLOCK_SKEW,
        }
    }

    /// Require tokens to be issued for `audience`.
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Override the expiry clock skew allowance.
    #[must_use]
    pub fn with_clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }

    /// Configured issuer.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Key cache used for signature verification.
    pub fn key_cache(&self) -> &KeyCache {
        &self.key_cache
    }

    /// Validate a token against the current time.
    ///
    /// # Errors
    ///
    /// Returns the authentication-class [`AuthError`] of the first failing
    /// check.
    #[instrument(skip_all)]
    pub async fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        self.validate_at(token, chrono::Utc::now().timestamp()).await
    }

    /// Validate a token as of `now` (Unix epoch seconds).
    ///
    /// # Errors
    ///
    /// See [`TokenValidator::validate`].
    pub async fn validate_at(&self, token: &str, now: i64) -> Result<Claims, AuthError> {
        let result = self.check(token, now).await;
        match &result {
            Ok(_) => {
                record_token_validation("success");
                tracing::debug!(target: "auth.jwt", "Token validated successfully");
            }
            Err(e) => {
                record_token_validation(e.kind());
                tracing::debug!(target: "auth.jwt", kind = e.kind(), "Token validation failed");
            }
        }
        result
    }

    async fn check(&self, token: &str, now: i64) -> Result<Claims, AuthError> {
        // 1. Structure (includes size check via common::jwt)
        let header = decode_header(token).map_err(|e| {
            tracing::debug!(target: "auth.jwt", error = ?e, "Token header rejected");
            AuthError::TokenMalformed
        })?;
        peek_payload(token).map_err(|e| {
            tracing::debug!(target: "auth.jwt", error = ?e, "Token payload rejected");
            AuthError::TokenMalformed
        })?;

        // 2. Algorithm allow-list
        let algorithm = KeyAlgorithm::from_name(&header.alg).ok_or_else(|| {
            tracing::warn!(target: "auth.jwt", alg = %header.alg, "Unsupported token algorithm");
            AuthError::TokenUnsupportedAlgorithm
        })?;
        let kid = header.kid.ok_or_else(|| {
            tracing::debug!(target: "auth.jwt", "Token header has no kid");
            AuthError::TokenMalformed
        })?;

        // 3. Key lookup
        let key = self.key_cache.get_key(&self.issuer, &kid).await?;
        if key.algorithm() != algorithm {
            tracing::warn!(
                target: "auth.jwt",
                token_alg = algorithm.as_str(),
                key_alg = key.algorithm().as_str(),
                "Token algorithm does not match key algorithm"
            );
            return Err(AuthError::TokenSignatureInvalid);
        }

        // 4. Signature. Time and audience checks are ours, not the library's.
        let mut validation = Validation::new(algorithm.jwt_algorithm());
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let claims = decode::<Claims>(token, key.decoding_key(), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidKeyFormat
                | ErrorKind::InvalidRsaKey(_)
                | ErrorKind::InvalidEcdsaKey
                | ErrorKind::Crypto(_) => {
                    tracing::debug!(target: "auth.jwt", error = %e, "Token signature verification failed");
                    AuthError::TokenSignatureInvalid
                }
                _ => {
                    tracing::debug!(target: "auth.jwt", error = %e, "Token claims could not be decoded");
                    AuthError::TokenMalformed
                }
            })?;

        // 5. Expiry
        let skew = i64::try_from(self.clock_skew.as_secs()).unwrap_or(i64::MAX);
        if now > claims.exp.saturating_add(skew) {
            tracing::debug!(
                target: "auth.jwt",
                exp = claims.exp,
                now = now,
                clock_skew_seconds = skew,
                "Token expired"
            );
            return Err(AuthError::TokenExpired);
        }

        // 6. Issuer
        if claims.iss != self.issuer {
            tracing::warn!(target: "auth.jwt", iss = %claims.iss, "Token issuer mismatch");
            return Err(AuthError::TokenIssuerMismatch);
        }

        // 7. Audience
        if let Some(audience) = &self.audience {
            if !claims.has_audience(audience) {
                tracing::warn!(target: "auth.jwt", "Token audience mismatch");
                return Err(AuthError::TokenAudienceMismatch);
            }
        }

        // 8. Subject
        if claims.sub.is_empty() {
            return Err(AuthError::TokenMissingSubject);
        }

        Ok(claims)
    }
}
