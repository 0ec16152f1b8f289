//! Authorization gate.
//!
//! Turns a bearer token into a [`Principal`] and enforces role
//! requirements. Authentication always runs first; an
//! [`AuthError::InsufficientRole`] is only ever produced for a caller whose
//! token verified.
//!
//! Per request: `TokenPresented -> Verified -> RoleChecked -> Authorized |
//! Forbidden`, or `Rejected` at any authentication step. Nothing carries
//! over between requests.

use crate::auth::jwt::TokenValidator;
use crate::errors::AuthError;
use crate::observability::metrics::record_authorization_decision;
use common::role::{ClaimMapping, Role};
use std::fmt;
use tracing::instrument;

/// A verified caller.
///
/// Only the gate constructs principals, and only from verified claims.
#[derive(Clone, PartialEq, Eq)]
pub struct Principal {
    subject: String,
    role: Role,
    email: Option<String>,
}

impl Principal {
    /// Subject identifier (`sub`).
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Resolved role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Email address, when the token carries one.
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("subject", &"[REDACTED]")
            .field("role", &self.role)
            .field("email", &self.email.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Extract the token from an `Authorization` header value.
///
/// # Errors
///
/// - `TokenMissing` if there is no header
/// - `TokenMalformed` if the scheme is not `Bearer` or the token is empty
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::TokenMissing)?;

    let (scheme, token) = header.split_once(' ').ok_or(AuthError::TokenMalformed)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::TokenMalformed);
    }

    let token = token.trim();
    if token.is_empty() || token.contains(' ') {
        return Err(AuthError::TokenMalformed);
    }
    Ok(token)
}

/// Validates tokens and checks roles for protected operations.
pub struct AuthGate {
    validator: TokenValidator,
    mapping: ClaimMapping,
}

impl AuthGate {
    /// Create a gate using the Cognito claim mapping.
    pub fn new(validator: TokenValidator) -> Self {
        Self::with_mapping(validator, ClaimMapping::default())
    }

    /// Create a gate with an explicit claim mapping.
    pub fn with_mapping(validator: TokenValidator, mapping: ClaimMapping) -> Self {
        Self { validator, mapping }
    }

    /// Token validator behind the gate.
    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// Authenticate a token. Any role is accepted.
    ///
    /// # Errors
    ///
    /// Returns the validator's authentication-class error unchanged.
    #[instrument(skip_all)]
    pub async fn require_authenticated(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = self.validator.validate(token).await.map_err(|e| {
            audit_rejection(None, &e);
            e
        })?;

        let role = claims.role(&self.mapping);
        Ok(Principal {
            subject: claims.sub,
            role,
            email: claims.email,
        })
    }

    /// Authenticate a token and require exactly `required`.
    ///
    /// # Errors
    ///
    /// Authentication-class errors as [`AuthGate::require_authenticated`];
    /// `InsufficientRole` if the verified caller has another role.
    #[instrument(skip_all, fields(required_role = %required))]
    pub async fn require_role(&self, token: &str, required: Role) -> Result<Principal, AuthError> {
        let principal = self.require_authenticated(token).await?;
        self.authorize(&principal, required)?;
        Ok(principal)
    }

    /// Check an already verified principal against a role requirement.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientRole` if the roles differ.
    pub fn authorize(&self, principal: &Principal, required: Role) -> Result<(), AuthError> {
        let authorized = principal.role == required;
        record_authorization_decision(authorized, required.as_str());

        if authorized {
            return Ok(());
        }

        let err = AuthError::InsufficientRole {
            required,
            actual: principal.role,
        };
        audit_rejection(Some(principal.subject()), &err);
        Err(err)
    }
}

/// Audit log line for a rejection. Never includes the token.
fn audit_rejection(subject: Option<&str>, err: &AuthError) {
    match subject {
        Some(subject) => tracing::warn!(
            target: "auth.gate",
            subject = %subject,
            kind = err.kind(),
            "Request rejected"
        ),
        None => tracing::warn!(target: "auth.gate", kind = err.kind(), "Request rejected"),
    }
}
