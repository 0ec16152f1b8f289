//! Role model and claim-to-role resolution.
//!
//! Roles form a closed set. Resolution is pure and total: any set of
//! claims resolves to exactly one role, falling back to [`Role::DEFAULT`].
//!
//! # Precedence
//!
//! 1. groups claim contains the operator group → `operator`
//! 2. groups claim contains the consumer group → `consumer`
//! 3. custom role claim names a known role → that role
//! 4. otherwise → `consumer`
//!
//! Provider-specific claim names live in [`ClaimMapping`], so the same
//! rules apply to any OIDC issuer once its names are mapped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Caller role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End user of the product.
    Consumer,
    /// Internal staff with access to operator tooling.
    Operator,
}

impl Role {
    /// Role assigned when a token carries no usable role indicator.
    pub const DEFAULT: Role = Role::Consumer;

    /// Lowercase wire name of the role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Consumer => "consumer",
            Role::Operator => "operator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known role.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consumer" => Ok(Role::Consumer),
            "operator" => Ok(Role::Operator),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Maps an issuer's claim names onto the role indicators the resolver reads.
///
/// | Field | Cognito | Standard |
/// |---|---|---|
/// | `groups_claim` | `cognito:groups` | `groups` |
/// | `role_claim` | `custom:role` | `role` |
/// | `operator_group` | `operators` | `operators` |
/// | `consumer_group` | `consumers` | `consumers` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMapping {
    /// Claim holding an array of group names.
    pub groups_claim: String,

    /// Claim holding a single role name.
    pub role_claim: String,

    /// Group whose members resolve to [`Role::Operator`].
    pub operator_group: String,

    /// Group whose members resolve to [`Role::Consumer`].
    pub consumer_group: String,
}

impl ClaimMapping {
    /// Claim names used by Amazon Cognito user pools.
    #[must_use]
    pub fn cognito() -> Self {
        Self {
            groups_claim: "cognito:groups".to_string(),
            role_claim: "custom:role".to_string(),
            operator_group: "operators".to_string(),
            consumer_group: "consumers".to_string(),
        }
    }

    /// Vendor-neutral claim names.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            groups_claim: "groups".to_string(),
            role_claim: "role".to_string(),
            operator_group: "operators".to_string(),
            consumer_group: "consumers".to_string(),
        }
    }

    /// Resolve the role for a decoded claims object.
    ///
    /// Only a JSON array counts as a groups claim; non-string members are
    /// ignored. A role claim naming an unknown role is ignored.
    #[must_use]
    pub fn resolve(&self, claims: &Map<String, Value>) -> Role {
        let groups: Vec<&str> = claims
            .get(&self.groups_claim)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let custom_role = claims.get(&self.role_claim).and_then(Value::as_str);

        resolve_role(&groups, custom_role, self)
    }
}

impl Default for ClaimMapping {
    fn default() -> Self {
        Self::cognito()
    }
}

/// Resolve a role from already-extracted indicators.
#[must_use]
pub fn resolve_role(groups: &[&str], custom_role: Option<&str>, mapping: &ClaimMapping) -> Role {
    if groups.iter().any(|g| *g == mapping.operator_group) {
        return Role::Operator;
    }
    if groups.iter().any(|g| *g == mapping.consumer_group) {
        return Role::Consumer;
    }

    custom_role
        .and_then(|value| value.parse().ok())
        .unwrap_or(Role::DEFAULT)
}
