//! Authentication middleware for protected routes.
//!
//! Extracts the Bearer token from the Authorization header, runs it through
//! the [`AuthGate`], and injects the resulting [`Principal`] into request
//! extensions.

use crate::errors::AuthError;
use crate::gate::{bearer_token, AuthGate, Principal};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::IntoResponse,
};
use common::role::Role;
use std::sync::Arc;
use tracing::instrument;

/// State for the authentication middleware.
#[derive(Clone)]
pub struct AuthState {
    /// Gate shared by every protected route.
    pub gate: Arc<AuthGate>,
}

/// Read the bearer token from a request.
fn request_token(req: &Request) -> Result<&str, AuthError> {
    let header = match req.headers().get(AUTHORIZATION) {
        Some(value) => Some(value.to_str().map_err(|_| {
            tracing::debug!(target: "auth.middleware", "Authorization header is not valid UTF-8");
            AuthError::TokenMalformed
        })?),
        None => None,
    };

    bearer_token(header).map_err(|e| {
        tracing::debug!(target: "auth.middleware", kind = e.kind(), "Unusable Authorization header");
        e
    })
}

/// Require any authenticated caller.
///
/// # Authorization Header Format
///
/// ```text
/// Authorization: Bearer <token>
/// ```
///
/// # Response
///
/// - 401 Unauthorized with WWW-Authenticate header if the token is missing or invalid
/// - Otherwise continues with the [`Principal`] in extensions
#[instrument(skip_all, name = "auth.middleware.require_auth")]
pub async fn require_auth(
    State(state): State<Arc<AuthState>>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, AuthError> {
    let token = request_token(&req)?;
    let principal = state.gate.require_authenticated(token).await?;

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

/// Require an authenticated operator.
///
/// # Response
///
/// - 401 for authentication failures, as [`require_auth`]
/// - 403 Forbidden for verified callers without the operator role
#[instrument(skip_all, name = "auth.middleware.require_operator")]
pub async fn require_operator(
    State(state): State<Arc<AuthState>>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, AuthError> {
    let token = request_token(&req)?;
    let principal = state.gate.require_role(token, Role::Operator).await?;

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

/// Extension trait for reading the principal from a request.
pub trait PrincipalExt {
    /// The authenticated principal, or `None` if no auth middleware ran.
    fn principal(&self) -> Option<&Principal>;
}

impl<B> PrincipalExt for axum::extract::Request<B> {
    fn principal(&self) -> Option<&Principal> {
        self.extensions().get::<Principal>()
    }
}
