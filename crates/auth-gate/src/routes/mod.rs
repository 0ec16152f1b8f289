//! HTTP routes for the token gate service.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::gate::AuthGate;
use crate::handlers;
use crate::middleware::{require_auth, require_operator, AuthState};
use axum::{middleware, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,

    /// Gate protecting every authenticated route.
    pub gate: Arc<AuthGate>,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/v1/health` - Liveness probe - public
/// - `/metrics` - Prometheus metrics endpoint - public
/// - `/v1/me` - Current caller - any authenticated caller
/// - `/v1/operator/me` - Current caller - operators only
/// - TraceLayer for request logging
/// - 30 second request timeout
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let auth_state = Arc::new(AuthState {
        gate: Arc::clone(&state.gate),
    });

    // Public routes (no authentication required)
    let public_routes = Router::new()
        .route("/v1/health", get(handlers::health_check))
        .with_state(state);

    // Metrics route with its own state
    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Any authenticated caller
    let authenticated_routes = Router::new()
        .route("/v1/me", get(handlers::get_me))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&auth_state),
            require_auth,
        ));

    // Operators only
    let operator_routes = Router::new()
        .route("/v1/operator/me", get(handlers::get_me))
        .route_layer(middleware::from_fn_with_state(auth_state, require_operator));

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - Timeout the request (innermost)
    // 2. TraceLayer - Log request details
    public_routes
        .merge(metrics_routes)
        .merge(authenticated_routes)
        .merge(operator_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
}
