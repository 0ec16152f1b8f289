//! Token gate configuration.
//!
//! Configuration is loaded from environment variables. The issuer is either
//! given directly or derived from a Cognito user pool.

use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use common::role::ClaimMapping;
use std::collections::HashMap;
use std::env;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default AWS region for Cognito issuer derivation.
pub const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Default key set TTL in seconds (1 hour).
pub const DEFAULT_JWKS_CACHE_TTL_SECONDS: u64 = 3600;

/// Default seconds an unknown `kid` is rejected without refetching.
pub const DEFAULT_JWKS_MISS_COOLDOWN_SECONDS: u64 = 30;

/// Token gate configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Expected `iss` claim.
    pub issuer: String,

    /// URL of the issuer's JWKS endpoint.
    pub jwks_url: String,

    /// Expected `aud`/`client_id`. `None` disables the audience check.
    pub audience: Option<String>,

    /// Allowance past `exp` in seconds.
    pub jwt_clock_skew_seconds: u64,

    /// How long a fetched key set is fresh, in seconds.
    pub jwks_cache_ttl_seconds: u64,

    /// How long an unknown `kid` is rejected without refetching, in
    /// seconds. 0 refetches on every unknown `kid`.
    pub jwks_miss_cooldown_seconds: u64,

    /// Claim names used for role resolution.
    pub claim_mapping: ClaimMapping,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid JWT clock skew configuration: {0}")]
    InvalidJwtClockSkew(String),

    #[error("Invalid JWKS cache TTL configuration: {0}")]
    InvalidJwksCacheTtl(String),

    #[error("Invalid JWKS miss cooldown configuration: {0}")]
    InvalidJwksMissCooldown(String),

    #[error("Invalid claim mapping configuration: {0}")]
    InvalidClaimMapping(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`Config::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if no issuer can be determined or a numeric
    /// setting is out of range.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let issuer = match (vars.get("AUTH_ISSUER"), vars.get("COGNITO_USER_POOL_ID")) {
            (Some(issuer), _) => issuer.trim_end_matches('/').to_string(),
            (None, Some(pool_id)) => {
                let region = vars
                    .get("AWS_REGION")
                    .map_or(DEFAULT_AWS_REGION, String::as_str);
                format!("https://cognito-idp.{region}.amazonaws.com/{pool_id}")
            }
            (None, None) => {
                return Err(ConfigError::MissingEnvVar(
                    "AUTH_ISSUER or COGNITO_USER_POOL_ID".to_string(),
                ))
            }
        };

        let jwks_url = vars
            .get("AUTH_JWKS_URL")
            .cloned()
            .unwrap_or_else(|| format!("{issuer}/.well-known/jwks.json"));

        let audience = vars
            .get("AUTH_AUDIENCE")
            .filter(|value| !value.is_empty())
            .cloned();

        // Parse JWT clock skew tolerance with validation
        let jwt_clock_skew_seconds = if let Some(value_str) = vars.get("JWT_CLOCK_SKEW_SECONDS") {
            let value: u64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must be a non-negative integer, got '{value_str}': {e}"
                ))
            })?;

            if value > MAX_CLOCK_SKEW.as_secs() {
                return Err(ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {value}",
                    MAX_CLOCK_SKEW.as_secs()
                )));
            }

            value
        } else {
            DEFAULT_CLOCK_SKEW.as_secs()
        };

        // Parse key set TTL with validation
        let jwks_cache_ttl_seconds = if let Some(value_str) = vars.get("JWKS_CACHE_TTL_SECONDS") {
            let value: u64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidJwksCacheTtl(format!(
                    "JWKS_CACHE_TTL_SECONDS must be a valid positive integer, got '{value_str}': {e}"
                ))
            })?;

            if value == 0 {
                return Err(ConfigError::InvalidJwksCacheTtl(
                    "JWKS_CACHE_TTL_SECONDS must be greater than 0".to_string(),
                ));
            }

            value
        } else {
            DEFAULT_JWKS_CACHE_TTL_SECONDS
        };

        let jwks_miss_cooldown_seconds = match vars.get("JWKS_MISS_COOLDOWN_SECONDS") {
            Some(value_str) => value_str.parse().map_err(|e| {
                ConfigError::InvalidJwksMissCooldown(format!(
                    "JWKS_MISS_COOLDOWN_SECONDS must be a non-negative integer, got '{value_str}': {e}"
                ))
            })?,
            None => DEFAULT_JWKS_MISS_COOLDOWN_SECONDS,
        };

        let claim_mapping = match vars.get("AUTH_CLAIM_MAPPING").map(String::as_str) {
            None | Some("cognito") => ClaimMapping::cognito(),
            Some("standard") => ClaimMapping::standard(),
            Some(other) => {
                return Err(ConfigError::InvalidClaimMapping(format!(
                    "AUTH_CLAIM_MAPPING must be 'cognito' or 'standard', got '{other}'"
                )))
            }
        };

        Ok(Config {
            bind_address,
            issuer,
            jwks_url,
            audience,
            jwt_clock_skew_seconds,
            jwks_cache_ttl_seconds,
            jwks_miss_cooldown_seconds,
            claim_mapping,
        })
    }
}
