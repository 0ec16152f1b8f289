//! JWT claims structure.
//!
//! Contains the claims extracted from verified tokens. The `sub` and
//! `email` fields are redacted in Debug output to prevent exposure in logs.
//! Issuer-specific claims (group lists, custom attributes) are kept in
//! [`Claims::extra`] and read through a [`ClaimMapping`].

use common::role::{ClaimMapping, Role};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// `aud` claim: a single audience or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    /// True if `audience` is named by this claim.
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::One(value) => value == audience,
            Audience::Many(values) => values.iter().any(|v| v == audience),
        }
    }
}

/// JWT Claims structure for verified tokens.
#[derive(Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user identifier) - redacted in Debug output.
    ///
    /// Empty when the token carries none; the validator rejects that.
    #[serde(default)]
    pub sub: String,

    /// Issuer.
    #[serde(default)]
    pub iss: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Intended audience (ID tokens).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,

    /// App client the token was issued to (Cognito access tokens).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Email address - redacted in Debug output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// `access` or `id` on Cognito tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_use: Option<String>,

    /// Every other claim, including group and role indicators.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for Claims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claims")
            .field("sub", &"[REDACTED]")
            .field("iss", &self.iss)
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .field("aud", &self.aud)
            .field("client_id", &self.client_id)
            .field("email", &self.email.as_ref().map(|_| "[REDACTED]"))
            .field("token_use", &self.token_use)
            .field("extra_claims", &self.extra.len())
            .finish()
    }
}

impl Claims {
    /// Resolve the caller's role using `mapping`'s claim names.
    pub fn role(&self, mapping: &ClaimMapping) -> Role {
        mapping.resolve(&self.extra)
    }

    /// True if the token was issued for `audience`, via `aud` or `client_id`.
    pub fn has_audience(&self, audience: &str) -> bool {
        self.aud.as_ref().is_some_and(|aud| aud.contains(audience))
            || self.client_id.as_deref() == Some(audience)
    }
}
