//! Health check handler.

use crate::routes::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

/// Response for `/v1/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always "healthy" when the process is serving.
    pub status: String,

    /// Issuer whose tokens this service accepts.
    pub issuer: String,

    /// "cached" once a key set has been fetched, "empty" before.
    pub keys: String,
}

/// Liveness handler.
///
/// Does not contact the issuer. Reports whether a key set is cached so an
/// operator can see if the first fetch has happened yet.
///
/// ## Example Response
///
/// ```json
/// {
///   "status": "healthy",
///   "issuer": "https://cognito-idp.us-east-1.amazonaws.com/us-east-1_abc",
///   "keys": "cached"
/// }
/// ```
#[instrument(skip_all, name = "auth.health.check")]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let validator = state.gate.validator();
    let keys = match validator.key_cache().key_set(validator.issuer()).await {
        Some(_) => "cached",
        None => "empty",
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        issuer: validator.issuer().to_string(),
        keys: keys.to_string(),
    })
}
