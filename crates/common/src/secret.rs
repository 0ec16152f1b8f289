//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Use these types
//! for every token the session core handles: bearer access tokens, refresh
//! tokens, identity tokens and OAuth client secrets.
//!
//! `SecretString` implements `Debug` with redaction, so any struct deriving
//! `Debug` over a secret gets safe logging behaviour, and the value is
//! zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::SecretString;
//! use secrecy::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct RefreshRequest {
//!     client_id: String,
//!     refresh_token: SecretString,
//! }
//!
//! let req = RefreshRequest {
//!     client_id: "web-client".to_string(),
//!     refresh_token: SecretString::from("eyJjdHkiOiJKV1QiLCJlbmMiOi"),
//! };
//!
//! // Safe: refresh_token is redacted
//! println!("{:?}", req);
//!
//! // Reading the value requires an explicit call
//! let token: &str = req.refresh_token.expose_secret();
//! ```

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretString};
