//! Current caller handler.

use crate::gate::Principal;
use axum::{Extension, Json};
use common::role::Role;
use serde::Serialize;
use tracing::instrument;

/// Response for `/v1/me` and `/v1/operator/me`.
#[derive(Debug, Clone, Serialize)]
pub struct MeResponse {
    /// Subject identifier.
    pub sub: String,

    /// Resolved role.
    pub role: Role,

    /// Email address, if the token carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Handler for GET /v1/me
///
/// Requires the auth middleware to have placed a [`Principal`] in extensions.
///
/// ```json
/// {
///   "sub": "8c1f5e0a-2b7d-4a7e-9d43-5f2c1b6e8a10",
///   "role": "consumer",
///   "email": "person@example.com"
/// }
/// ```
#[instrument(skip_all, name = "auth.handlers.me")]
pub async fn get_me(Extension(principal): Extension<Principal>) -> Json<MeResponse> {
    Json(MeResponse {
        sub: principal.subject().to_string(),
        role: principal.role(),
        email: principal.email().map(ToString::to_string),
    })
}
