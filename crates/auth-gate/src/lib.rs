//! Bearer token gate.
//!
//! Turns an `Authorization: Bearer <token>` header into a verified
//! [`Principal`](gate::Principal) with a resolved role, or a classified
//! rejection.
//!
//! ```text
//! middleware -> gate -> auth::jwt (validator) -> auth::jwks (key cache) -> issuer
//! ```
//!
//! # Modules
//!
//! - `auth` - Key cache, token validator and claims
//! - `config` - Service configuration from environment
//! - `errors` - Error taxonomy with HTTP status code mapping
//! - `gate` - Role resolution and enforcement
//! - `handlers` - HTTP request handlers
//! - `middleware` - Axum authentication middleware
//! - `observability` - Prometheus metrics
//! - `routes` - Axum router setup

pub mod auth;
pub mod config;
pub mod errors;
pub mod gate;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod routes;

pub use errors::AuthError;
pub use gate::{AuthGate, Principal};
