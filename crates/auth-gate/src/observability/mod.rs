//! Observability for the token gate: Prometheus metrics.

pub mod metrics;
