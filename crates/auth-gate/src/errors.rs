//! Authentication and authorization error types.
//!
//! Every rejection the gate can produce is one variant here. Variants are
//! split into two classes:
//!
//! - authentication-class: the caller could not be identified (401)
//! - authorization-class: the caller is known but lacks the role (403)
//!
//! Messages returned to clients are generic. The variant's [`AuthError::kind`]
//! is logged and counted server-side; raw tokens never appear in either.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::role::Role;
use serde::Serialize;
use thiserror::Error;

/// Generic client-facing message for every authentication failure.
pub const UNAUTHORIZED_MESSAGE: &str = "The access token is invalid or expired";

/// Generic client-facing message for every authorization failure.
pub const FORBIDDEN_MESSAGE: &str = "Access denied";

/// Rejection produced by the token gate.
///
/// Maps to HTTP status codes:
/// - every `Token*` variant and `KeySourceUnavailable`: 401 Unauthorized
/// - `InsufficientRole`: 403 Forbidden
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("No bearer token was presented")]
    TokenMissing,

    #[error("Token is not a well-formed JWT")]
    TokenMalformed,

    #[error("Token algorithm is not supported")]
    TokenUnsupportedAlgorithm,

    #[error("Token signing key is unknown to the issuer")]
    TokenKeyUnknown,

    #[error("Token signature is invalid")]
    TokenSignatureInvalid,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token issuer does not match")]
    TokenIssuerMismatch,

    #[error("Token audience does not match")]
    TokenAudienceMismatch,

    #[error("Token has no subject")]
    TokenMissingSubject,

    #[error("Issuer key source unavailable: {0}")]
    KeySourceUnavailable(String),

    #[error("Role {required} required, caller has {actual}")]
    InsufficientRole { required: Role, actual: Role },
}

impl AuthError {
    /// Stable, bounded identifier for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::TokenMissing => "token_missing",
            AuthError::TokenMalformed => "token_malformed",
            AuthError::TokenUnsupportedAlgorithm => "token_unsupported_algorithm",
            AuthError::TokenKeyUnknown => "token_key_unknown",
            AuthError::TokenSignatureInvalid => "token_signature_invalid",
            AuthError::TokenExpired => "token_expired",
            AuthError::TokenIssuerMismatch => "token_issuer_mismatch",
            AuthError::TokenAudienceMismatch => "token_audience_mismatch",
            AuthError::TokenMissingSubject => "token_missing_subject",
            AuthError::KeySourceUnavailable(_) => "key_source_unavailable",
            AuthError::InsufficientRole { .. } => "insufficient_role",
        }
    }

    /// True for failures that mean "who are you", false for "you may not do that".
    pub fn is_authentication(&self) -> bool {
        !matches!(self, AuthError::InsufficientRole { .. })
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        if self.is_authentication() {
            401
        } else {
            403
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = if self.is_authentication() {
            if let AuthError::KeySourceUnavailable(reason) = &self {
                // Log actual reason server-side
                tracing::warn!(target: "auth.availability", reason = %reason, "Key source unavailable");
            }
            (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", UNAUTHORIZED_MESSAGE)
        } else {
            (StatusCode::FORBIDDEN, "FORBIDDEN", FORBIDDEN_MESSAGE)
        };

        let error_response = ErrorResponse {
            error: ErrorDetail { code, message },
        };

        let mut response = (status, Json(error_response)).into_response();

        // Add WWW-Authenticate header for 401 responses
        if status == StatusCode::UNAUTHORIZED {
            let challenge = if matches!(self, AuthError::TokenMissing) {
                "Bearer realm=\"spendsense-api\""
            } else {
                "Bearer realm=\"spendsense-api\", error=\"invalid_token\""
            };
            if let Ok(header_value) = challenge.parse() {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}
