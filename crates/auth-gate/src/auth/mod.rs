//! Token authentication.
//!
//! - [`jwks`]: signing key cache with single-flight refresh
//! - [`jwt`]: token validator
//! - [`claims`]: verified claim set

pub mod claims;
pub mod jwks;
pub mod jwt;

pub use claims::{Audience, Claims};
pub use jwks::{HttpKeySource, KeyCache, KeySource, KeySourceError, SigningKey};
pub use jwt::TokenValidator;
