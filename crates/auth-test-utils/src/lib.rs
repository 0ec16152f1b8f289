//! # Auth Test Utilities
//!
//! Shared test utilities for the token gate and the session manager.
//!
//! This crate provides:
//! - Deterministic crypto fixtures (fixed Ed25519 keys for reproducible tests)
//! - Claim builders that sign into real tokens (`TestTokenBuilder`)
//! - A mocked issuer serving a key set and a refresh endpoint (`MockIssuer`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use auth_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let keypair = TestKeypair::new(1, "key-1");
//!     let issuer = MockIssuer::start().await;
//!     issuer.mount_jwks(&[&keypair]).await;
//!
//!     let token = TestTokenBuilder::new(&issuer.issuer())
//!         .for_user("alice")
//!         .in_group("operators")
//!         .sign(&keypair);
//! }
//! ```

pub mod crypto_fixtures;
pub mod mock_issuer;
pub mod token_builders;

// Re-export commonly used items
pub use crypto_fixtures::*;
pub use mock_issuer::*;
pub use token_builders::*;
