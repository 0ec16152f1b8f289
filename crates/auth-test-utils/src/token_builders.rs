//! Builder patterns for test tokens
//!
//! Provides a fluent API for claim sets shaped like Cognito tokens.

use crate::crypto_fixtures::TestKeypair;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};

/// Builder for test JWT claims
///
/// # Example
/// ```rust,ignore
/// let token = TestTokenBuilder::new("https://issuer.example")
///     .for_user("alice")
///     .in_group("operators")
///     .expires_in(3600)
///     .sign(&keypair);
/// ```
#[derive(Debug, Clone)]
pub struct TestTokenBuilder {
    claims: Map<String, Value>,
}

impl TestTokenBuilder {
    /// Claims for `issuer` with a fixed subject, valid for an hour.
    pub fn new(issuer: &str) -> Self {
        let now = Utc::now();
        let mut claims = Map::new();
        claims.insert("sub".to_string(), json!("test-subject"));
        claims.insert("iss".to_string(), json!(issuer));
        claims.insert("iat".to_string(), json!(now.timestamp()));
        claims.insert(
            "exp".to_string(),
            json!((now + Duration::seconds(3600)).timestamp()),
        );
        claims.insert("token_use".to_string(), json!("access"));
        Self { claims }
    }

    /// Set the subject
    pub fn for_user(self, subject: &str) -> Self {
        self.claim("sub", json!(subject))
    }

    /// Drop the subject claim entirely
    pub fn without_subject(mut self) -> Self {
        self.claims.remove("sub");
        self
    }

    /// Set expiration in seconds from now (negative for the past)
    pub fn expires_in(self, seconds: i64) -> Self {
        self.expires_at((Utc::now() + Duration::seconds(seconds)).timestamp())
    }

    /// Set expiration to an absolute Unix timestamp
    pub fn expires_at(self, timestamp: i64) -> Self {
        self.claim("exp", json!(timestamp))
    }

    /// Add a group to `cognito:groups`
    pub fn in_group(mut self, group: &str) -> Self {
        let groups = self
            .claims
            .entry("cognito:groups".to_string())
            .or_insert_with(|| json!([]));
        if let Some(list) = groups.as_array_mut() {
            list.push(json!(group));
        }
        self
    }

    /// Set `custom:role`
    pub fn with_custom_role(self, role: &str) -> Self {
        self.claim("custom:role", json!(role))
    }

    /// Set `email`
    pub fn with_email(self, email: &str) -> Self {
        self.claim("email", json!(email))
    }

    /// Set `aud`
    pub fn with_audience(self, audience: &str) -> Self {
        self.claim("aud", json!(audience))
    }

    /// Set `client_id`
    pub fn with_client_id(self, client_id: &str) -> Self {
        self.claim("client_id", json!(client_id))
    }

    /// Set any claim
    pub fn claim(mut self, name: &str, value: Value) -> Self {
        self.claims.insert(name.to_string(), value);
        self
    }

    /// Build the claims as a JSON value
    pub fn build(self) -> Value {
        Value::Object(self.claims)
    }

    /// Build and sign with `keypair`
    pub fn sign(self, keypair: &TestKeypair) -> String {
        keypair.sign(&self.build())
    }
}
