//! Metrics definitions for the token gate.
//!
//! All metrics follow Prometheus naming conventions:
//! - `auth_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code:
//! - `outcome`: `success` or an [`AuthError::kind`](crate::errors::AuthError::kind) value
//! - `status`: `success`, `error`
//! - `decision`: `authorized`, `forbidden`

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Key fetches are network round trips to the issuer
        .set_buckets_for_metric(
            Matcher::Prefix("auth_jwks_fetch".to_string()),
            &[0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000],
        )
        .map_err(|e| format!("Failed to set JWKS fetch buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

/// Record the outcome of one token validation.
///
/// Metric: `auth_token_validations_total`
/// Labels: `outcome`
pub fn record_token_validation(outcome: &'static str) {
    counter!("auth_token_validations_total", "outcome" => outcome).increment(1);
}

/// Record one fetch of an issuer's key set.
///
/// Metric: `auth_jwks_fetches_total`, `auth_jwks_fetch_duration_seconds`
/// Labels: `status`
pub fn record_jwks_fetch(success: bool, duration: Duration) {
    let status = if success { "success" } else { "error" };

    histogram!("auth_jwks_fetch_duration_seconds", "status" => status)
        .record(duration.as_secs_f64());
    counter!("auth_jwks_fetches_total", "status" => status).increment(1);
}

/// Record a role check made after successful authentication.
///
/// Metric: `auth_authorization_decisions_total`
/// Labels: `decision`, `required_role`
pub fn record_authorization_decision(authorized: bool, required_role: &'static str) {
    let decision = if authorized { "authorized" } else { "forbidden" };
    counter!("auth_authorization_decisions_total",
        "decision" => decision,
        "required_role" => required_role
    )
    .increment(1);
}
