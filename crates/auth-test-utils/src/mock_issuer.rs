//! Mocked identity provider.
//!
//! Serves a JWKS document and an OAuth2 token endpoint from a local
//! wiremock server.

use crate::crypto_fixtures::{jwks_json, TestKeypair};
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Path of the key set endpoint, relative to the issuer.
pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// Path of the token (refresh) endpoint.
pub const TOKEN_PATH: &str = "/oauth2/token";

/// A running mock issuer.
pub struct MockIssuer {
    server: MockServer,
}

impl MockIssuer {
    /// Start a mock issuer on a random local port.
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Issuer identifier (`iss`) for tokens from this mock.
    pub fn issuer(&self) -> String {
        self.server.uri()
    }

    /// Key set URL.
    pub fn jwks_url(&self) -> String {
        format!("{}{JWKS_PATH}", self.server.uri())
    }

    /// Token endpoint URL.
    pub fn token_url(&self) -> String {
        format!("{}{TOKEN_PATH}", self.server.uri())
    }

    /// Underlying server, for custom mocks and request inspection.
    pub fn server(&self) -> &MockServer {
        &self.server
    }

    /// Publish `keypairs` at the JWKS endpoint.
    pub async fn mount_jwks(&self, keypairs: &[&TestKeypair]) {
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(keypairs)))
            .mount(&self.server)
            .await;
    }

    /// Make the JWKS endpoint fail with `status`.
    pub async fn mount_jwks_failure(&self, status: u16) {
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Answer refresh grants with `body`, expecting exactly `times` calls.
    pub async fn mount_refresh(&self, body: Value, times: u64) {
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(times)
            .mount(&self.server)
            .await;
    }

    /// Answer refresh grants with an error `status` and OAuth2 error code.
    pub async fn mount_refresh_error(&self, status: u16, error: &str) {
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({ "error": error })))
            .mount(&self.server)
            .await;
    }

    /// Number of requests received at the JWKS endpoint so far.
    pub async fn jwks_requests(&self) -> usize {
        self.count_requests(JWKS_PATH).await
    }

    /// Number of requests received at the token endpoint so far.
    pub async fn refresh_requests(&self) -> usize {
        self.count_requests(TOKEN_PATH).await
    }

    async fn count_requests(&self, request_path: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == request_path)
            .count()
    }
}

/// Token endpoint response body as the issuer returns it.
pub fn token_response(access_token: &str, id_token: &str, refresh_token: Option<&str>) -> Value {
    let mut body = json!({
        "access_token": access_token,
        "id_token": id_token,
        "token_type": "Bearer",
        "expires_in": 3600
    });
    if let (Some(refresh_token), Some(map)) = (refresh_token, body.as_object_mut()) {
        map.insert("refresh_token".to_string(), json!(refresh_token));
    }
    body
}
