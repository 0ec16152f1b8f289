//! Common utilities and types shared by the token gate and the session manager.

#![warn(clippy::pedantic)]

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (structure checks, header and payload peeking, constants)
pub mod jwt;

/// Module for the role model and claim-to-role resolution
pub mod role;
