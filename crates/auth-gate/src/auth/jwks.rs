//! Key cache for an issuer's published signing keys.
//!
//! The cache fetches the JWKS (JSON Web Key Set) an issuer publishes and keeps
//! one [`KeySet`] per issuer, rebuilt wholesale on every successful fetch.
//!
//! # Lookup rules
//!
//! - A cached key whose `kid` matches is served even if its set is stale
//!   (rotation grace). A stale hit starts one background revalidation.
//! - An unseen `kid` triggers a fetch, then the lookup is retried once.
//!   A `kid` still missing after that fetch is answered from memory for
//!   the miss cooldown; at most [`MAX_TRACKED_MISSES`] such misses per
//!   issuer trigger fetches within one cooldown.
//! - Concurrent callers that miss at the same time share one fetch per
//!   issuer (single-flight). Waiters reuse the outcome of the fetch that
//!   completed while they queued instead of issuing their own.
//! - A failed fetch leaves the previous set in place.
//!
//! # Security
//!
//! - Keys are cached to reduce load on the issuer and improve latency
//! - Only signature keys of supported types are admitted to a set
//! - HTTPS should be used in production (enforced by deployment config)

use crate::errors::AuthError;
use crate::observability::metrics::record_jwks_fetch;
use async_trait::async_trait;
use common::jwt::decode_ed25519_public_key_jwk;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as SyncMutex;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

/// Default key set TTL (1 hour).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Default time an unknown `kid` is answered without asking the issuer again.
pub const DEFAULT_MISS_COOLDOWN: Duration = Duration::from_secs(30);

/// Unknown `kid`s remembered per issuer. Further unknown `kid`s are rejected
/// without a fetch until an entry expires.
pub const MAX_TRACKED_MISSES: usize = 64;

/// Default timeout for one key set fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Length of a raw Ed25519 public key.
const ED25519_PUBLIC_KEY_LEN: usize = 32;

// =============================================================================
// Wire types
// =============================================================================

/// JSON Web Key as published by the issuer.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type ("RSA" or "OKP").
    pub kty: String,

    /// Key ID - used to select the correct key for verification.
    pub kid: String,

    /// Algorithm the key is meant for.
    #[serde(default)]
    pub alg: Option<String>,

    /// Key use (must be "sig" when present).
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,

    /// Curve name for OKP keys.
    #[serde(default)]
    pub crv: Option<String>,

    /// OKP public key value (base64url).
    #[serde(default)]
    pub x: Option<String>,

    /// RSA modulus (base64url).
    #[serde(default)]
    pub n: Option<String>,

    /// RSA public exponent (base64url).
    #[serde(default)]
    pub e: Option<String>,
}

/// JWKS document.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksResponse {
    /// List of JSON Web Keys.
    pub keys: Vec<Jwk>,
}

// =============================================================================
// Signing keys
// =============================================================================

/// Signature algorithms the gate verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    Rs256,
    /// Ed25519.
    EdDsa,
}

impl KeyAlgorithm {
    /// Parse a JOSE algorithm name. Anything outside the allow-list is `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "RS256" => Some(KeyAlgorithm::Rs256),
            "EdDSA" => Some(KeyAlgorithm::EdDsa),
            _ => None,
        }
    }

    /// JOSE name of the algorithm.
    pub fn as_str(self) -> &'static str {
        match self {
            KeyAlgorithm::Rs256 => "RS256",
            KeyAlgorithm::EdDsa => "EdDSA",
        }
    }

    /// Matching `jsonwebtoken` algorithm.
    pub fn jwt_algorithm(self) -> Algorithm {
        match self {
            KeyAlgorithm::Rs256 => Algorithm::RS256,
            KeyAlgorithm::EdDsa => Algorithm::EdDSA,
        }
    }
}

/// Why a published JWK was not admitted to a key set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("key use is not \"sig\"")]
    NotSigningKey,

    #[error("missing key material: {0}")]
    MissingMaterial(&'static str),

    #[error("invalid key material: {0}")]
    InvalidMaterial(String),
}

/// A verified-usable public key, identified by `kid`.
///
/// Immutable once built. Debug output omits key material.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    algorithm: KeyAlgorithm,
    decoding_key: DecodingKey,
}

impl SigningKey {
    /// Build a signing key from a published JWK.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyParseError`] for encryption keys, unsupported key
    /// types or algorithms, and missing or undecodable key material.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, KeyParseError> {
        if let Some(key_use) = &jwk.key_use {
            if key_use != "sig" {
                return Err(KeyParseError::NotSigningKey);
            }
        }

        let (algorithm, decoding_key) = match jwk.kty.as_str() {
            "RSA" => {
                expect_alg(jwk, KeyAlgorithm::Rs256)?;
                let n = jwk.n.as_deref().ok_or(KeyParseError::MissingMaterial("n"))?;
                let e = jwk.e.as_deref().ok_or(KeyParseError::MissingMaterial("e"))?;
                let key = DecodingKey::from_rsa_components(n, e)
                    .map_err(|e| KeyParseError::InvalidMaterial(e.to_string()))?;
                (KeyAlgorithm::Rs256, key)
            }
            "OKP" => {
                if let Some(crv) = &jwk.crv {
                    if crv != "Ed25519" {
                        return Err(KeyParseError::UnsupportedAlgorithm(crv.clone()));
                    }
                }
                expect_alg(jwk, KeyAlgorithm::EdDsa)?;
                let x = jwk.x.as_deref().ok_or(KeyParseError::MissingMaterial("x"))?;
                let public_key = decode_ed25519_public_key_jwk(x)
                    .map_err(|e| KeyParseError::InvalidMaterial(e.to_string()))?;
                if public_key.len() != ED25519_PUBLIC_KEY_LEN {
                    return Err(KeyParseError::InvalidMaterial(format!(
                        "Ed25519 key must be {ED25519_PUBLIC_KEY_LEN} bytes, got {}",
                        public_key.len()
                    )));
                }
                (KeyAlgorithm::EdDsa, DecodingKey::from_ed_der(&public_key))
            }
            other => return Err(KeyParseError::UnsupportedKeyType(other.to_string())),
        };

        Ok(Self {
            kid: jwk.kid.clone(),
            algorithm,
            decoding_key,
        })
    }

    /// Key identifier.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Algorithm this key verifies.
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// A JWK's own `alg`, when present, must name the algorithm of its key type.
fn expect_alg(jwk: &Jwk, expected: KeyAlgorithm) -> Result<(), KeyParseError> {
    match jwk.alg.as_deref() {
        None => Ok(()),
        Some(alg) if alg == expected.as_str() => Ok(()),
        Some(alg) => Err(KeyParseError::UnsupportedAlgorithm(alg.to_string())),
    }
}

// =============================================================================
// Key sets
// =============================================================================

/// All signing keys of one issuer as of one fetch.
#[derive(Debug)]
pub struct KeySet {
    issuer: String,
    keys: HashMap<String, SigningKey>,
    fetched_at: Instant,
    ttl: Duration,
}

impl KeySet {
    /// Build a key set from a fetched JWKS.
    ///
    /// Keys that cannot be used for verification are skipped, not fatal:
    /// issuers commonly publish encryption keys alongside signing keys.
    pub fn from_jwks(issuer: &str, jwks: Vec<Jwk>, ttl: Duration) -> Self {
        let mut keys = HashMap::with_capacity(jwks.len());
        for jwk in jwks {
            match SigningKey::from_jwk(&jwk) {
                Ok(key) => {
                    keys.insert(jwk.kid, key);
                }
                Err(e) => {
                    tracing::debug!(
                        target: "auth.jwks",
                        kid = %jwk.kid,
                        error = %e,
                        "Skipping unusable JWK"
                    );
                }
            }
        }

        Self {
            issuer: issuer.to_string(),
            keys,
            fetched_at: Instant::now(),
            ttl,
        }
    }

    /// Look up a key by `kid`.
    pub fn get(&self, kid: &str) -> Option<&SigningKey> {
        self.keys.get(kid)
    }

    /// True once the set is older than its TTL.
    pub fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }

    /// Issuer the set belongs to.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Number of usable keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when the issuer published no usable key.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// =============================================================================
// Key sources
// =============================================================================

/// Failure to obtain an issuer's key set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeySourceError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("endpoint returned status {0}")]
    Status(u16),

    #[error("invalid key set document: {0}")]
    InvalidDocument(String),
}

/// Where key sets come from.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the current published keys of `issuer`.
    async fn fetch(&self, issuer: &str) -> Result<Vec<Jwk>, KeySourceError>;
}

/// Fetches key sets over HTTP.
///
/// Each issuer's endpoint defaults to `{issuer}/.well-known/jwks.json`
/// (the OIDC discovery location) unless overridden.
pub struct HttpKeySource {
    http_client: reqwest::Client,
    endpoints: HashMap<String, String>,
}

impl HttpKeySource {
    /// Create a key source with the default fetch timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_FETCH_TIMEOUT)
    }

    /// Create a key source with a custom fetch timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "auth.jwks", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self {
            http_client,
            endpoints: HashMap::new(),
        }
    }

    /// Override the JWKS URL for one issuer.
    #[must_use]
    pub fn with_endpoint(mut self, issuer: impl Into<String>, jwks_url: impl Into<String>) -> Self {
        self.endpoints.insert(issuer.into(), jwks_url.into());
        self
    }

    /// JWKS URL used for `issuer`.
    pub fn endpoint_for(&self, issuer: &str) -> String {
        self.endpoints.get(issuer).cloned().unwrap_or_else(|| {
            format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/'))
        })
    }
}

impl Default for HttpKeySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    #[instrument(skip(self))]
    async fn fetch(&self, issuer: &str) -> Result<Vec<Jwk>, KeySourceError> {
        let url = self.endpoint_for(issuer);
        tracing::debug!(target: "auth.jwks", url = %url, "Fetching JWKS");

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            tracing::error!(target: "auth.jwks", error = %e, "Failed to fetch JWKS");
            KeySourceError::Request(e.to_string())
        })?;

        if !response.status().is_success() {
            tracing::error!(
                target: "auth.jwks",
                status = %response.status(),
                "JWKS endpoint returned error"
            );
            return Err(KeySourceError::Status(response.status().as_u16()));
        }

        let jwks: JwksResponse = response.json().await.map_err(|e| {
            tracing::error!(target: "auth.jwks", error = %e, "Failed to parse JWKS response");
            KeySourceError::InvalidDocument(e.to_string())
        })?;

        Ok(jwks.keys)
    }
}

// =============================================================================
// Key cache
// =============================================================================

/// Per-issuer cache entry.
struct IssuerSlot {
    /// Latest successfully fetched set.
    current: RwLock<Option<Arc<KeySet>>>,

    /// Held for the duration of a fetch. Guards the outcome of the latest attempt.
    fetch_lock: Mutex<Option<KeySourceError>>,

    /// Completed fetch attempts, successful or not.
    attempts: AtomicU64,

    /// Set while a background revalidation task is running.
    revalidating: AtomicBool,

    /// `kid`s missing from the set after a fetch, with when they were missed.
    recent_misses: SyncMutex<HashMap<String, Instant>>,
}

impl IssuerSlot {
    fn new() -> Self {
        Self {
            current: RwLock::new(None),
            fetch_lock: Mutex::new(None),
            attempts: AtomicU64::new(0),
            revalidating: AtomicBool::new(false),
            recent_misses: SyncMutex::new(HashMap::new()),
        }
    }

    /// Whether a lookup of `kid` must be answered without fetching.
    ///
    /// True for a `kid` missed within `cooldown`, and for any `kid` once
    /// [`MAX_TRACKED_MISSES`] misses are live.
    fn suppress_fetch(&self, kid: &str, cooldown: Duration) -> bool {
        let mut misses = self
            .recent_misses
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        misses.retain(|_, missed_at| missed_at.elapsed() < cooldown);
        misses.contains_key(kid) || misses.len() >= MAX_TRACKED_MISSES
    }

    fn record_miss(&self, kid: &str, cooldown: Duration) {
        if cooldown.is_zero() {
            return;
        }
        self.recent_misses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kid.to_string(), Instant::now());
    }

    async fn current(&self) -> Option<Arc<KeySet>> {
        self.current.read().await.clone()
    }
}

struct KeyCacheInner {
    source: Arc<dyn KeySource>,
    ttl: Duration,
    miss_cooldown: Duration,
    slots: RwLock<HashMap<String, Arc<IssuerSlot>>>,
}

/// Thread-safe cache of signing keys, keyed by issuer.
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct KeyCache {
    inner: Arc<KeyCacheInner>,
}

impl KeyCache {
    /// Create a key cache with the default TTL.
    pub fn new(source: Arc<dyn KeySource>) -> Self {
        Self::with_ttl(source, DEFAULT_CACHE_TTL)
    }

    /// Create a key cache with a custom TTL.
    pub fn with_ttl(source: Arc<dyn KeySource>, ttl: Duration) -> Self {
        Self::with_miss_cooldown(source, ttl, DEFAULT_MISS_COOLDOWN)
    }

    /// Create a key cache with a custom TTL and miss cooldown.
    /// `Duration::ZERO` fetches on every unknown `kid`.
    pub fn with_miss_cooldown(
        source: Arc<dyn KeySource>,
        ttl: Duration,
        miss_cooldown: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(KeyCacheInner {
                source,
                ttl,
                miss_cooldown,
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Configured key set TTL.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    async fn slot(&self, issuer: &str) -> Arc<IssuerSlot> {
        if let Some(slot) = self.inner.slots.read().await.get(issuer) {
            return Arc::clone(slot);
        }

        let mut slots = self.inner.slots.write().await;
        Arc::clone(
            slots
                .entry(issuer.to_string())
                .or_insert_with(|| Arc::new(IssuerSlot::new())),
        )
    }

    /// Get a signing key by issuer and key ID.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::TokenKeyUnknown` if the key is not published even
    /// after a fresh fetch.
    /// Returns `AuthError::KeySourceUnavailable` if a needed fetch failed.
    #[instrument(skip(self), fields(issuer = %issuer, kid = %kid))]
    pub async fn get_key(&self, issuer: &str, kid: &str) -> Result<SigningKey, AuthError> {
        let slot = self.slot(issuer).await;
        // Observed before reading the set, so a fetch finishing in between is noticed
        let observed = slot.attempts.load(Ordering::Acquire);

        if let Some(key_set) = slot.current().await {
            if let Some(key) = key_set.get(kid) {
                if key_set.is_stale() {
                    tracing::debug!(target: "auth.jwks", "Serving key from stale JWKS, revalidating");
                    self.spawn_revalidation(issuer, Arc::clone(&slot), observed);
                } else {
                    tracing::debug!(target: "auth.jwks", "JWKS cache hit");
                }
                return Ok(key.clone());
            }
        }

        if slot.suppress_fetch(kid, self.inner.miss_cooldown) {
            tracing::debug!(target: "auth.jwks", "Unknown kid missed recently, not refetching");
            return Err(AuthError::TokenKeyUnknown);
        }

        // Cache empty or kid unseen - fetch fresh JWKS
        self.refresh(issuer, &slot, observed).await.map_err(|e| {
            AuthError::KeySourceUnavailable(e.to_string())
        })?;

        slot.current()
            .await
            .and_then(|key_set| key_set.get(kid).cloned())
            .ok_or_else(|| {
                tracing::warn!(target: "auth.jwks", "Key not found in JWKS after refresh");
                slot.record_miss(kid, self.inner.miss_cooldown);
                AuthError::TokenKeyUnknown
            })
    }

    /// Fetch and replace the key set for `issuer`, unless another caller
    /// completed a fetch since `observed` was read.
    async fn refresh(
        &self,
        issuer: &str,
        slot: &IssuerSlot,
        observed: u64,
    ) -> Result<(), KeySourceError> {
        let mut last_error = slot.fetch_lock.lock().await;

        if slot.attempts.load(Ordering::Acquire) != observed {
            tracing::debug!(target: "auth.jwks", "Reusing result of concurrent JWKS fetch");
            return match last_error.as_ref() {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            };
        }

        let started = Instant::now();
        let result = self.inner.source.fetch(issuer).await;
        record_jwks_fetch(result.is_ok(), started.elapsed());

        let outcome = match result {
            Ok(jwks) => {
                let key_set = KeySet::from_jwks(issuer, jwks, self.inner.ttl);
                tracing::info!(
                    target: "auth.jwks",
                    key_count = key_set.len(),
                    "JWKS cache refreshed"
                );
                *slot.current.write().await = Some(Arc::new(key_set));
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    target: "auth.jwks",
                    error = %err,
                    "JWKS fetch failed, keeping previous key set"
                );
                Err(err)
            }
        };

        *last_error = outcome.as_ref().err().cloned();
        slot.attempts.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    /// Revalidate a stale set in the background, at most one task per issuer.
    fn spawn_revalidation(&self, issuer: &str, slot: Arc<IssuerSlot>, observed: u64) {
        if slot
            .revalidating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let cache = self.clone();
        let issuer = issuer.to_string();
        tokio::spawn(async move {
            if let Err(e) = cache.refresh(&issuer, &slot, observed).await {
                tracing::warn!(target: "auth.jwks", error = %e, "Background JWKS revalidation failed");
            }
            slot.revalidating.store(false, Ordering::Release);
        });
    }

    /// Snapshot of the cached key set for `issuer`, if any.
    pub async fn key_set(&self, issuer: &str) -> Option<Arc<KeySet>> {
        let slot = self.inner.slots.read().await.get(issuer).cloned();
        match slot {
            Some(slot) => slot.current().await,
            None => None,
        }
    }

    /// Force a fetch for `issuer`, replacing the cached set on success.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::KeySourceUnavailable` if the fetch fails.
    pub async fn force_refresh(&self, issuer: &str) -> Result<(), AuthError> {
        let slot = self.slot(issuer).await;
        let observed = slot.attempts.load(Ordering::Acquire);
        self.refresh(issuer, &slot, observed)
            .await
            .map_err(|e| AuthError::KeySourceUnavailable(e.to_string()))
    }
}
