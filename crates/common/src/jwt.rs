//! JWT utilities shared by the token gate and the session manager.
//!
//! This module provides:
//! - Size limits for DoS prevention
//! - Clock skew constants for expiry validation
//! - Structural checks and unverified header/payload peeking
//! - Public key decoding helpers for JWK material
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Nothing in this module verifies a signature. Values read here are
//!   only fit for key lookup (server) or scheduling hints (client)
//! - Error messages are generic to prevent information leakage
//!
//! # Usage
//!
//! ```rust,ignore
//! use common::jwt::{decode_header, peek_expiry};
//!
//! // Server: find the key to verify with
//! let header = decode_header(token)?;
//! let kid = header.kid.ok_or(JwtValidationError::MissingKid)?;
//! let key = key_cache.get_key(issuer, &kid).await?;
//!
//! // Client: schedule a refresh from the access token's expiry
//! let exp = peek_expiry(access_token)?;
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// JWTs larger than this size are rejected BEFORE any parsing or cryptographic
/// operations.
///
/// - Typical identity provider access tokens are 800-1500 bytes
/// - ID tokens with group claims rarely exceed 3KB
/// - Checked BEFORE base64 decode and signature verification
pub const MAX_JWT_SIZE_BYTES: usize = 8192; // 8KB

/// Default clock skew allowance applied to `exp` (30 seconds).
///
/// A token whose `exp` lies less than this far in the past is still
/// accepted. There is no other grace period.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(30);

/// Maximum allowed clock skew allowance (10 minutes).
///
/// Bounds configuration so a typo cannot turn expiry checking off.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while inspecting a JWT's structure.
///
/// Note: Error messages are intentionally generic to prevent information leakage.
/// Detailed information is logged at debug level for troubleshooting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token format is invalid (not a valid JWT structure).
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Token is missing required `kid` header.
    #[error("The access token is invalid or expired")]
    MissingKid,

    /// Token is missing the `alg` header.
    #[error("The access token is invalid or expired")]
    MissingAlgorithm,

    /// Token payload has no numeric `exp` claim.
    #[error("The access token is invalid or expired")]
    MissingExpiry,
}

// =============================================================================
// Header
// =============================================================================

/// The parts of a JWT header needed to pick a verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    /// Algorithm named by the token (not yet trusted).
    pub alg: String,

    /// Key identifier used to look the key up in the issuer's key set.
    ///
    /// `None` when absent, empty, or not a string. Kept optional so callers
    /// can reject an unsupported `alg` before complaining about the key.
    pub kid: Option<String>,
}

// =============================================================================
// Functions
// =============================================================================

/// Split a token into its three non-empty segments.
///
/// # Errors
///
/// - `TokenTooLarge` - Token exceeds `MAX_JWT_SIZE_BYTES`
/// - `MalformedToken` - Token does not have exactly three non-empty segments
pub fn split_token(token: &str) -> Result<(&str, &str, &str), JwtValidationError> {
    // Check token size first (DoS prevention)
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(signature), None)
            if !header.is_empty() && !payload.is_empty() && !signature.is_empty() =>
        {
            Ok((header, payload, signature))
        }
        _ => {
            tracing::debug!(target: "common.jwt", "Token rejected: invalid JWT format");
            Err(JwtValidationError::MalformedToken)
        }
    }
}

/// Decode one base64url segment into a JSON object.
fn decode_segment(segment: &str) -> Result<Map<String, Value>, JwtValidationError> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode JWT segment base64");
        JwtValidationError::MalformedToken
    })?;

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => {
            tracing::debug!(target: "common.jwt", "JWT segment is not a JSON object");
            Err(JwtValidationError::MalformedToken)
        }
        Err(e) => {
            tracing::debug!(target: "common.jwt", error = %e, "Failed to parse JWT segment JSON");
            Err(JwtValidationError::MalformedToken)
        }
    }
}

/// Read the `alg` and `kid` header fields without verifying the signature.
///
/// # Security
///
/// - Token size is checked BEFORE any parsing
/// - The returned algorithm is attacker-controlled; callers must check it
///   against their own allow-list and never treat it as "skip verification"
///
/// # Errors
///
/// Returns `JwtValidationError` variants:
/// - `TokenTooLarge` - Token exceeds size limit
/// - `MalformedToken` - Wrong structure, bad base64, or header not a JSON object
/// - `MissingAlgorithm` - `alg` missing, empty, or not a string
pub fn decode_header(token: &str) -> Result<TokenHeader, JwtValidationError> {
    let (header_part, _, _) = split_token(token)?;
    let header = decode_segment(header_part)?;

    let alg = header
        .get("alg")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(JwtValidationError::MissingAlgorithm)?;

    let kid = header
        .get("kid")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);

    Ok(TokenHeader { alg, kid })
}

/// Extract the `kid` (key ID) from a JWT header without verifying the signature.
///
/// # Errors
///
/// Returns `MissingKid` if the header has no usable `kid`, otherwise the
/// errors of [`decode_header`].
pub fn extract_kid(token: &str) -> Result<String, JwtValidationError> {
    decode_header(token)?
        .kid
        .ok_or(JwtValidationError::MissingKid)
}

/// Decode the payload of a token without verifying it.
///
/// Used by the server to reject structurally broken tokens before any
/// cryptography, and by clients to read scheduling hints from tokens they
/// were handed by the issuer.
///
/// # Errors
///
/// - `TokenTooLarge` / `MalformedToken` as for [`split_token`]
pub fn peek_payload(token: &str) -> Result<Map<String, Value>, JwtValidationError> {
    let (_, payload_part, _) = split_token(token)?;
    decode_segment(payload_part)
}

/// Read the `exp` claim (Unix epoch seconds) without verifying the token.
///
/// # Errors
///
/// Returns `MissingExpiry` if the payload has no integer `exp`, otherwise
/// the errors of [`peek_payload`].
pub fn peek_expiry(token: &str) -> Result<i64, JwtValidationError> {
    peek_payload(token)?
        .get("exp")
        .and_then(Value::as_i64)
        .ok_or(JwtValidationError::MissingExpiry)
}

/// Decode an Ed25519 public key from JWK `x` field (base64url format).
///
/// # Errors
///
/// Returns `base64::DecodeError` if the base64url content cannot be decoded.
pub fn decode_ed25519_public_key_jwk(x_b64url: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(x_b64url)
}

// =============================================================================
// Tests
// =============================================================================
