//! Key cache integration tests.
//!
//! Covers single-flight fetching, rotation, the unknown-kid cooldown, and
//! stale-key fallback using a scripted key source, plus the HTTP key source
//! against a mock issuer.

// Test code is allowed to use expect/unwrap for assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use auth_gate::auth::jwks::{
    HttpKeySource, Jwk, KeyCache, KeySource, KeySourceError, DEFAULT_CACHE_TTL, MAX_TRACKED_MISSES,
};
use auth_gate::AuthError;
use auth_test_utils::{MockIssuer, TestKeypair};
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ISSUER: &str = "https://issuer.example";

/// Key source returning a configurable result after a delay.
struct ScriptedSource {
    calls: AtomicUsize,
    delay: Duration,
    response: Mutex<Result<Vec<Jwk>, KeySourceError>>,
}

impl ScriptedSource {
    fn publishing(keypairs: &[&TestKeypair]) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
            response: Mutex::new(Ok(jwks(keypairs))),
        })
    }

    fn failing() -> Arc<Self> {
        let source = Self::publishing(&[]);
        source.fail();
        source
    }

    fn publish(&self, keypairs: &[&TestKeypair]) {
        *self.response.lock().unwrap() = Ok(jwks(keypairs));
    }

    fn fail(&self) {
        *self.response.lock().unwrap() = Err(KeySourceError::Status(503));
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for ScriptedSource {
    async fn fetch(&self, issuer: &str) -> Result<Vec<Jwk>, KeySourceError> {
        assert_eq!(issuer, ISSUER);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.response.lock().unwrap().clone()
    }
}

fn jwks(keypairs: &[&TestKeypair]) -> Vec<Jwk> {
    keypairs
        .iter()
        .map(|k| serde_json::from_value(k.jwk_json()).unwrap())
        .collect()
}

#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() {
    let keypair = TestKeypair::new(1, "key-1");
    let source = ScriptedSource::publishing(&[&keypair]);
    let cache = KeyCache::new(source.clone());

    let lookups = (0..32).map(|_| {
        let cache = cache.clone();
        async move { cache.get_key(ISSUER, "key-1").await }
    });
    let results = join_all(lookups).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(source.calls(), 1, "32 concurrent misses must share one fetch");
}

#[tokio::test]
async fn test_concurrent_unknown_kid_shares_one_fetch() {
    let keypair = TestKeypair::new(1, "key-1");
    let source = ScriptedSource::publishing(&[&keypair]);
    let cache = KeyCache::new(source.clone());

    let lookups = (0..16).map(|_| {
        let cache = cache.clone();
        async move { cache.get_key(ISSUER, "never-published").await }
    });
    let results = join_all(lookups).await;

    for result in results {
        assert_eq!(result.unwrap_err(), AuthError::TokenKeyUnknown);
    }
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_fetch_failure_is_shared() {
    let source = ScriptedSource::failing();
    let cache = KeyCache::new(source.clone());

    let lookups = (0..8).map(|_| {
        let cache = cache.clone();
        async move { cache.get_key(ISSUER, "key-1").await }
    });

    for result in join_all(lookups).await {
        assert!(matches!(result, Err(AuthError::KeySourceUnavailable(_))));
    }
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_cached_key_served_without_fetch() {
    let keypair = TestKeypair::new(1, "key-1");
    let source = ScriptedSource::publishing(&[&keypair]);
    let cache = KeyCache::new(source.clone());

    for _ in 0..5 {
        let key = cache.get_key(ISSUER, "key-1").await.unwrap();
        assert_eq!(key.kid(), "key-1");
    }
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_rotated_key_fetched_on_first_sight() {
    let old = TestKeypair::new(1, "key-1");
    let new = TestKeypair::new(2, "key-2");
    let source = ScriptedSource::publishing(&[&old]);
    let cache = KeyCache::new(source.clone());

    cache.get_key(ISSUER, "key-1").await.unwrap();

    source.publish(&[&old, &new]);
    let key = cache.get_key(ISSUER, "key-2").await.unwrap();

    assert_eq!(key.kid(), "key-2");
    assert_eq!(source.calls(), 2);
    // Replaced wholesale, the old key is still published so still present
    assert!(cache.get_key(ISSUER, "key-1").await.is_ok());
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_unseen_kid_not_refetched_during_cooldown() {
    let keypair = TestKeypair::new(1, "key-1");
    let source = ScriptedSource::publishing(&[&keypair]);
    let cache = KeyCache::new(source.clone());

    for _ in 0..3 {
        assert_eq!(
            cache.get_key(ISSUER, "missing").await.unwrap_err(),
            AuthError::TokenKeyUnknown
        );
    }
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_unseen_kid_refetched_after_cooldown() {
    let keypair = TestKeypair::new(1, "key-1");
    let source = ScriptedSource::publishing(&[&keypair]);
    let cache =
        KeyCache::with_miss_cooldown(source.clone(), DEFAULT_CACHE_TTL, Duration::from_millis(100));

    assert!(cache.get_key(ISSUER, "key-2").await.is_err());
    assert!(cache.get_key(ISSUER, "key-2").await.is_err());
    assert_eq!(source.calls(), 1);

    let rotated = TestKeypair::new(2, "key-2");
    source.publish(&[&keypair, &rotated]);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let key = cache.get_key(ISSUER, "key-2").await.unwrap();
    assert_eq!(key.kid(), "key-2");
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_cooldown_applies_per_kid() {
    let old = TestKeypair::new(1, "key-1");
    let new = TestKeypair::new(2, "key-2");
    let source = ScriptedSource::publishing(&[&old]);
    let cache = KeyCache::new(source.clone());

    assert!(cache.get_key(ISSUER, "forged").await.is_err());

    source.publish(&[&old, &new]);
    assert!(cache.get_key(ISSUER, "key-2").await.is_ok());
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_zero_cooldown_refetches_each_time() {
    let keypair = TestKeypair::new(1, "key-1");
    let source = ScriptedSource::publishing(&[&keypair]);
    let cache = KeyCache::with_miss_cooldown(source.clone(), DEFAULT_CACHE_TTL, Duration::ZERO);

    for _ in 0..3 {
        assert_eq!(
            cache.get_key(ISSUER, "missing").await.unwrap_err(),
            AuthError::TokenKeyUnknown
        );
    }
    assert_eq!(source.calls(), 3);
}

#[tokio::test]
async fn test_distinct_unknown_kids_bounded_per_cooldown() {
    let keypair = TestKeypair::new(1, "key-1");
    let source = ScriptedSource::publishing(&[&keypair]);
    let cache = KeyCache::new(source.clone());

    for i in 0..MAX_TRACKED_MISSES + 10 {
        assert_eq!(
            cache.get_key(ISSUER, &format!("forged-{i}")).await.unwrap_err(),
            AuthError::TokenKeyUnknown
        );
    }
    assert_eq!(source.calls(), MAX_TRACKED_MISSES);

    // Known keys are still served from the cache
    assert!(cache.get_key(ISSUER, "key-1").await.is_ok());
    assert_eq!(source.calls(), MAX_TRACKED_MISSES);
}

#[tokio::test]
async fn test_stale_known_key_served_when_source_down() {
    let keypair = TestKeypair::new(1, "key-1");
    let source = ScriptedSource::publishing(&[&keypair]);
    // Zero TTL: every set is stale as soon as it is stored
    let cache = KeyCache::with_ttl(source.clone(), Duration::ZERO);

    cache.get_key(ISSUER, "key-1").await.unwrap();
    source.fail();

    let key = cache.get_key(ISSUER, "key-1").await.unwrap();
    assert_eq!(key.kid(), "key-1");

    // Background revalidation ran once and failed; the set is retained
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(source.calls(), 2);
    assert!(cache.key_set(ISSUER).await.unwrap().get("key-1").is_some());
}

#[tokio::test]
async fn test_stale_hits_start_one_revalidation() {
    let keypair = TestKeypair::new(1, "key-1");
    let source = ScriptedSource::publishing(&[&keypair]);
    let cache = KeyCache::with_ttl(source.clone(), Duration::ZERO);

    cache.get_key(ISSUER, "key-1").await.unwrap();

    // All of these land while the first revalidation is still sleeping
    for _ in 0..10 {
        cache.get_key(ISSUER, "key-1").await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_failed_fetch_keeps_previous_set() {
    let keypair = TestKeypair::new(1, "key-1");
    let source = ScriptedSource::publishing(&[&keypair]);
    let cache = KeyCache::new(source.clone());

    cache.get_key(ISSUER, "key-1").await.unwrap();
    source.fail();

    assert!(matches!(
        cache.get_key(ISSUER, "key-2").await,
        Err(AuthError::KeySourceUnavailable(_))
    ));
    assert!(cache.get_key(ISSUER, "key-1").await.is_ok());
}

#[tokio::test]
async fn test_force_refresh_replaces_set() {
    let old = TestKeypair::new(1, "key-1");
    let new = TestKeypair::new(2, "key-2");
    let source = ScriptedSource::publishing(&[&old]);
    let cache = KeyCache::new(source.clone());

    cache.force_refresh(ISSUER).await.unwrap();
    source.publish(&[&new]);
    cache.force_refresh(ISSUER).await.unwrap();

    let set = cache.key_set(ISSUER).await.unwrap();
    assert!(set.get("key-1").is_none());
    assert!(set.get("key-2").is_some());
}

// =============================================================================
// HTTP key source
// =============================================================================

#[tokio::test]
async fn test_http_key_source_fetches_issuer_jwks() {
    let issuer = MockIssuer::start().await;
    let keypair = TestKeypair::new(1, "key-1");
    issuer.mount_jwks(&[&keypair]).await;

    let keys = HttpKeySource::new().fetch(&issuer.issuer()).await.unwrap();

    assert_eq!(keys.len(), 1);
    assert_eq!(keys.first().unwrap().kid, "key-1");
}

#[tokio::test]
async fn test_http_key_source_error_status() {
    let issuer = MockIssuer::start().await;
    issuer.mount_jwks_failure(500).await;

    let result = HttpKeySource::new().fetch(&issuer.issuer()).await;

    assert_eq!(result.unwrap_err(), KeySourceError::Status(500));
}

#[tokio::test]
async fn test_http_key_source_unreachable() {
    let source = HttpKeySource::with_timeout(Duration::from_secs(1))
        .with_endpoint(ISSUER, "http://127.0.0.1:1/jwks.json");

    assert!(matches!(
        source.fetch(ISSUER).await,
        Err(KeySourceError::Request(_))
    ));
}
