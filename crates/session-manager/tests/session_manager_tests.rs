//! Session manager scheduling and cross-context tests.
//!
//! Time is paused: `tokio::time` only moves when every task is idle, so
//! refresh timers fire at exact offsets from login.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use auth_test_utils::{TestKeypair, TestTokenBuilder};
use common::role::Role;
use common::secret::{ExposeSecret, SecretString};
use session_manager::{
    Commit, MemorySessionStore, RefreshExchange, RefreshedTokens, SessionConfig, SessionError,
    SessionManager, SessionState, SessionStatus, SessionStore, SessionUpdate, TokenSet,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{sleep_until, Instant};

const ISSUER: &str = "https://issuer.example";

// =============================================================================
// Fixtures
// =============================================================================

fn keypair() -> TestKeypair {
    TestKeypair::new(7, "session-key")
}

fn access_token(expires_in: i64) -> String {
    TestTokenBuilder::new(ISSUER)
        .for_user("user-1")
        .expires_in(expires_in)
        .sign(&keypair())
}

fn id_token() -> String {
    TestTokenBuilder::new(ISSUER)
        .for_user("user-1")
        .with_email("person@example.com")
        .in_group("operators")
        .claim("token_use", serde_json::json!("id"))
        .sign(&keypair())
}

fn token_set(expires_in: i64) -> TokenSet {
    TokenSet::new(access_token(expires_in), "refresh-1", Some(id_token()))
}

fn refreshed() -> RefreshedTokens {
    refreshed_for(3600)
}

fn refreshed_for(expires_in: i64) -> RefreshedTokens {
    let access_token = TestTokenBuilder::new(ISSUER)
        .for_user("user-1")
        .expires_in(expires_in)
        .claim("jti", serde_json::json!("refreshed"))
        .sign(&keypair());
    RefreshedTokens {
        access_token: SecretString::from(access_token),
        id_token: None,
        refresh_token: None,
    }
}

fn transient() -> SessionError {
    SessionError::RefreshTransientFailure("Token endpoint returned 503".into())
}

fn config() -> SessionConfig {
    SessionConfig::new("http://localhost/oauth2/token".into(), "web-client".into())
}

/// Exchange answering from a script, then with fresh tokens.
struct MockExchange {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<RefreshedTokens, SessionError>>>,
    delay: Duration,
}

impl MockExchange {
    fn new() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    fn scripted(results: Vec<Result<RefreshedTokens, SessionError>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(results.into()),
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RefreshExchange for MockExchange {
    async fn exchange(&self, refresh_token: &SecretString) -> Result<RefreshedTokens, SessionError> {
        assert_eq!(refresh_token.expose_secret(), "refresh-1");
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(refreshed()))
    }
}

/// Shared store counting how often contexts read it.
struct CountingStore {
    inner: MemorySessionStore,
    loads: AtomicUsize,
}

impl CountingStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemorySessionStore::new(),
            loads: AtomicUsize::new(0),
        })
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for CountingStore {
    async fn load(&self) -> Result<SessionState, SessionError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load().await
    }

    async fn update(&self, update: SessionUpdate) -> Result<Commit, SessionError> {
        self.inner.update(update).await
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.inner.subscribe()
    }
}

async fn started(
    config: SessionConfig,
    store: &Arc<CountingStore>,
    exchange: &Arc<MockExchange>,
) -> SessionManager {
    let manager = SessionManager::new(config, store.clone(), exchange.clone());
    manager.start().await.unwrap();
    manager
}

/// Sleep until `millis` after `start` on the paused clock.
async fn at(start: Instant, millis: u64) {
    sleep_until(start + Duration::from_millis(millis)).await;
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_refresh_scheduled_at_expiry_minus_skew() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let manager = started(config(), &store, &exchange).await;

    let tokens = token_set(3600);
    let exp = tokens.access_expiry().unwrap();
    let start = Instant::now();
    let snapshot = manager.login(tokens).await.unwrap();

    assert_eq!(snapshot.status, SessionStatus::Authenticated);
    assert_eq!(snapshot.generation, 1);
    assert_eq!(snapshot.access_expires_at, Some(exp));
    assert_eq!(snapshot.refresh_at.unwrap().timestamp(), exp - 300);
    assert_eq!(manager.refresh_at(), snapshot.refresh_at);

    at(start, 3_298_000).await;
    assert_eq!(exchange.calls(), 0, "refresh must not run early");

    at(start, 3_301_000).await;
    assert_eq!(exchange.calls(), 1, "refresh must run at exp - skew");

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Authenticated);
    assert_eq!(snapshot.generation, 2);
    assert!(snapshot.last_error.is_none());
    assert!(snapshot.refresh_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_short_lived_tokens_refresh_halfway() {
    let store = CountingStore::new();
    let exchange = MockExchange::scripted((0..4).map(|_| Ok(refreshed_for(60))).collect());
    let manager = started(config(), &store, &exchange).await;

    // 120s token with a 300s skew: exp - skew is already past.
    let start = Instant::now();
    let snapshot = manager.login(token_set(120)).await.unwrap();
    assert!(snapshot.refresh_at.unwrap() > chrono::Utc::now());

    at(start, 10_000).await;
    assert_eq!(exchange.calls(), 0, "refresh must not run immediately");

    at(start, 59_000).await;
    assert_eq!(exchange.calls(), 0);

    at(start, 61_000).await;
    assert_eq!(exchange.calls(), 1, "refresh runs halfway to expiry");

    // 60s tokens refresh every 30s.
    at(start, 125_000).await;
    assert_eq!(exchange.calls(), 3);

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Authenticated);
    assert_eq!(snapshot.generation, 4);
    assert!(snapshot.refresh_at.unwrap() > chrono::Utc::now());
}

#[tokio::test(start_paused = true)]
async fn test_expired_refresh_response_is_not_retried_back_to_back() {
    let store = CountingStore::new();
    let exchange = MockExchange::scripted(vec![Ok(refreshed_for(-10)), Ok(refreshed_for(-10))]);
    let manager = started(config(), &store, &exchange).await;

    let start = Instant::now();
    manager.login(token_set(120)).await.unwrap();

    // Already expired tokens are refreshed one second apart.
    at(start, 60_200).await;
    assert_eq!(exchange.calls(), 1);

    at(start, 63_500).await;
    assert_eq!(exchange.calls(), 3);
    assert_eq!(manager.snapshot().generation, 4);

    // The third exchange returned a token valid for an hour.
    at(start, 70_000).await;
    assert_eq!(exchange.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_keeps_tokens_the_provider_did_not_return() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let manager = started(config(), &store, &exchange).await;

    let tokens = token_set(3600);
    let old_access = tokens.access_token.expose_secret().to_string();
    let old_id = tokens.id_token.as_ref().unwrap().expose_secret().to_string();
    let start = Instant::now();
    manager.login(tokens).await.unwrap();

    at(start, 3_301_000).await;

    let tokens = manager.snapshot().tokens.unwrap();
    assert_ne!(tokens.access_token.expose_secret(), old_access);
    assert_eq!(tokens.refresh_token.expose_secret(), "refresh-1");
    assert_eq!(tokens.id_token.unwrap().expose_secret(), old_id);
}

#[tokio::test(start_paused = true)]
async fn test_second_login_replaces_pending_refresh() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let manager = started(config(), &store, &exchange).await;
    assert_eq!(store.loads(), 1);

    let start = Instant::now();
    manager.login(token_set(1800)).await.unwrap();
    manager.login(token_set(3600)).await.unwrap();

    // The first login's timer (due at 1500s) was cancelled and never reads
    // the store.
    at(start, 3_298_000).await;
    assert_eq!(store.loads(), 1);
    assert_eq!(exchange.calls(), 0);

    at(start, 3_301_000).await;
    assert_eq!(store.loads(), 2);
    assert_eq!(exchange.calls(), 1);
    assert_eq!(manager.snapshot().generation, 3);
}

#[tokio::test(start_paused = true)]
async fn test_logout_cancels_pending_refresh() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let manager = started(config(), &store, &exchange).await;

    let start = Instant::now();
    manager.login(token_set(3600)).await.unwrap();
    let snapshot = manager.logout().await.unwrap();

    assert_eq!(snapshot.status, SessionStatus::Unauthenticated);
    assert_eq!(snapshot.generation, 2);
    assert!(snapshot.tokens.is_none());
    assert!(snapshot.refresh_at.is_none());

    at(start, 4_000_000).await;
    assert_eq!(exchange.calls(), 0);
    assert_eq!(store.loads(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_manager_stops_refreshing() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let manager = started(config(), &store, &exchange).await;

    let start = Instant::now();
    manager.login(token_set(3600)).await.unwrap();
    drop(manager);

    at(start, 4_000_000).await;
    assert_eq!(exchange.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_refreshing() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let manager = started(config(), &store, &exchange).await;

    let start = Instant::now();
    manager.login(token_set(3600)).await.unwrap();
    manager.shutdown();

    at(start, 4_000_000).await;
    assert_eq!(exchange.calls(), 0);
    // The shared session is untouched
    assert_eq!(
        store.load().await.unwrap().status,
        SessionStatus::Authenticated
    );
}

// =============================================================================
// Refresh failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_terminal_failure_expires_session() {
    let store = CountingStore::new();
    let exchange = MockExchange::scripted(vec![Err(SessionError::RefreshTerminalFailure(
        "invalid_grant".into(),
    ))]);
    let manager = started(config(), &store, &exchange).await;

    let start = Instant::now();
    manager.login(token_set(3600)).await.unwrap();
    at(start, 3_301_000).await;

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Expired);
    assert!(snapshot.requires_login());
    assert!(snapshot.tokens.is_none());
    assert!(snapshot.identity().is_none());
    assert!(snapshot.refresh_at.is_none());
    assert_eq!(snapshot.generation, 2);
    assert_eq!(
        snapshot.last_error,
        Some(SessionError::RefreshTerminalFailure("invalid_grant".into()))
    );

    let stored = store.load().await.unwrap();
    assert_eq!(stored.status, SessionStatus::Expired);
    assert!(stored.tokens.is_none());

    // Nothing left to refresh
    at(start, 8_000_000).await;
    assert_eq!(exchange.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retried_without_losing_session() {
    let store = CountingStore::new();
    let exchange = MockExchange::scripted(vec![Err(transient()), Err(transient())]);
    let manager = started(config(), &store, &exchange).await;

    let start = Instant::now();
    manager.login(token_set(3600)).await.unwrap();

    // First attempt at ~3300s, retry after 1s, next retry after 2s more
    at(start, 3_301_500).await;
    assert_eq!(exchange.calls(), 2);
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Refreshing);
    assert!(snapshot.is_authenticated());
    assert!(snapshot.access_token().is_some());
    assert_eq!(snapshot.generation, 1);

    at(start, 3_310_000).await;
    assert_eq!(exchange.calls(), 3);
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Authenticated);
    assert_eq!(snapshot.generation, 2);
    assert!(snapshot.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_keep_session_and_try_again_later() {
    let store = CountingStore::new();
    let exchange =
        MockExchange::scripted(vec![Err(transient()), Err(transient()), Err(transient())]);
    let config = config()
        .with_max_refresh_attempts(3)
        .with_backoff(Duration::from_secs(1), Duration::from_secs(4));
    let manager = started(config, &store, &exchange).await;

    let start = Instant::now();
    manager.login(token_set(3600)).await.unwrap();

    // Attempts at ~3300s, +1s, +3s; then a pause of 4s
    at(start, 3_304_500).await;
    assert_eq!(exchange.calls(), 3);
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Authenticated);
    assert_eq!(snapshot.generation, 1);
    assert!(snapshot.tokens.is_some());
    assert!(matches!(
        snapshot.last_error,
        Some(SessionError::RefreshTransientFailure(_))
    ));
    assert_eq!(
        store.load().await.unwrap().status,
        SessionStatus::Authenticated
    );

    at(start, 3_310_000).await;
    assert_eq!(exchange.calls(), 4);
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.generation, 2);
    assert!(snapshot.last_error.is_none());
}

// =============================================================================
// Cross-context consistency
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_login_propagates_to_other_context() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let first = started(config(), &store, &exchange).await;
    let second = started(config(), &store, &exchange).await;

    let mut updates = second.subscribe();
    first.login(token_set(3600)).await.unwrap();

    let snapshot = updates
        .wait_for(|s| s.status == SessionStatus::Authenticated)
        .await
        .unwrap();
    assert_eq!(snapshot.generation, 1);
    assert!(snapshot.refresh_at.is_some());
    assert_eq!(snapshot.identity().unwrap().subject, "user-1");
}

#[tokio::test(start_paused = true)]
async fn test_refresh_in_one_context_is_adopted_by_the_other() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let first = started(config(), &store, &exchange).await;
    // Refreshes later than the first context
    let second = started(
        config().with_refresh_skew(Duration::from_secs(60)),
        &store,
        &exchange,
    )
    .await;

    let start = Instant::now();
    first.login(token_set(3600)).await.unwrap();
    let mut updates = second.subscribe();
    updates.wait_for(|s| s.generation == 1).await.unwrap();

    at(start, 3_301_000).await;
    assert_eq!(exchange.calls(), 1);
    assert_eq!(first.snapshot().generation, 2);
    let adopted = second.snapshot();
    assert_eq!(adopted.generation, 2);
    assert_eq!(
        adopted.access_token().unwrap().expose_secret(),
        first.snapshot().access_token().unwrap().expose_secret()
    );

    // The second context's old timer (due at ~3540s) was replaced
    at(start, 3_700_000).await;
    assert_eq!(exchange.calls(), 1);
    assert_eq!(store.load().await.unwrap().generation, 2);
    assert_eq!(second.snapshot().generation, 2);
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_refreshes_commit_one_generation() {
    let store = CountingStore::new();
    let exchange = MockExchange::slow(Duration::from_secs(1));
    let first = started(config(), &store, &exchange).await;
    let second = started(config(), &store, &exchange).await;

    let start = Instant::now();
    first.login(token_set(3600)).await.unwrap();
    second
        .subscribe()
        .wait_for(|s| s.generation == 1)
        .await
        .unwrap();

    // Both timers fire together and both exchanges are in flight before
    // either commits. Only one result is committed.
    at(start, 3_305_000).await;
    assert_eq!(exchange.calls(), 2);
    assert_eq!(store.load().await.unwrap().generation, 2);

    let a = first.snapshot();
    let b = second.snapshot();
    assert_eq!(a.generation, 2);
    assert_eq!(b.generation, 2);
    assert_eq!(a.status, SessionStatus::Authenticated);
    assert_eq!(b.status, SessionStatus::Authenticated);
    assert_eq!(
        a.access_token().unwrap().expose_secret(),
        b.access_token().unwrap().expose_secret()
    );
}

#[tokio::test(start_paused = true)]
async fn test_logout_observed_by_other_context_without_network() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let first = started(config(), &store, &exchange).await;
    let second = started(config(), &store, &exchange).await;

    let start = Instant::now();
    let mut updates = second.subscribe();
    first.login(token_set(3600)).await.unwrap();
    updates.wait_for(|s| s.generation == 1).await.unwrap();

    first.logout().await.unwrap();
    let snapshot = updates
        .wait_for(|s| s.status == SessionStatus::Unauthenticated)
        .await
        .unwrap();

    assert_eq!(snapshot.generation, 2);
    assert!(snapshot.tokens.is_none());
    assert!(snapshot.refresh_at.is_none());

    at(start, 4_000_000).await;
    assert_eq!(exchange.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_expiry_propagates_to_other_context() {
    let store = CountingStore::new();
    let exchange = MockExchange::scripted(vec![Err(SessionError::RefreshTerminalFailure(
        "invalid_grant".into(),
    ))]);
    let first = started(config(), &store, &exchange).await;
    let second = started(
        config().with_refresh_skew(Duration::from_secs(60)),
        &store,
        &exchange,
    )
    .await;

    let start = Instant::now();
    first.login(token_set(3600)).await.unwrap();

    at(start, 3_301_000).await;
    let snapshot = second.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Expired);
    assert!(snapshot.tokens.is_none());

    at(start, 4_000_000).await;
    assert_eq!(exchange.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_restores_persisted_session() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();

    let start = Instant::now();
    let first = started(config(), &store, &exchange).await;
    first.login(token_set(3600)).await.unwrap();
    first.shutdown();

    let restored = started(config(), &store, &exchange).await;
    let snapshot = restored.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Authenticated);
    assert_eq!(snapshot.generation, 1);
    assert!(snapshot.refresh_at.is_some());

    at(start, 3_301_000).await;
    assert_eq!(exchange.calls(), 1);
    assert_eq!(restored.snapshot().generation, 2);
}

// =============================================================================
// Login
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_login_with_reports_authenticating() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let manager = started(config(), &store, &exchange).await;

    let (tx, rx) = oneshot::channel::<TokenSet>();
    let mut updates = manager.subscribe();
    let task = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .login_with(async move {
                    rx.await
                        .map_err(|_| SessionError::InvalidTokenSet("sign-in abandoned".into()))
                })
                .await
        }
    });

    updates
        .wait_for(|s| s.status == SessionStatus::Authenticating)
        .await
        .unwrap();
    tx.send(token_set(3600)).unwrap();

    let snapshot = task.await.unwrap().unwrap();
    assert_eq!(snapshot.status, SessionStatus::Authenticated);
    assert_eq!(manager.snapshot().status, SessionStatus::Authenticated);
}

#[tokio::test(start_paused = true)]
async fn test_failed_sign_in_restores_status() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let manager = started(config(), &store, &exchange).await;

    let err = manager
        .login_with(async {
            Err::<TokenSet, _>(SessionError::InvalidTokenSet("bad credentials".into()))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::InvalidTokenSet(_)));
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Unauthenticated);
    assert_eq!(snapshot.last_error, Some(err));
    assert_eq!(store.load().await.unwrap().generation, 0);
}

#[tokio::test(start_paused = true)]
async fn test_login_rejects_token_without_expiry() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let manager = started(config(), &store, &exchange).await;

    let err = manager
        .login(TokenSet::new("opaque-token", "refresh-1", None))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::InvalidTokenSet(_)));
    assert_eq!(manager.snapshot().status, SessionStatus::Unauthenticated);
    assert_eq!(store.load().await.unwrap().generation, 0);
}

#[tokio::test(start_paused = true)]
async fn test_access_token_requires_session() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let manager = started(config(), &store, &exchange).await;

    assert_eq!(
        manager.access_token().unwrap_err(),
        SessionError::NotAuthenticated
    );

    let tokens = token_set(3600);
    let issued = tokens.access_token.expose_secret().to_string();
    manager.login(tokens).await.unwrap();
    assert_eq!(manager.access_token().unwrap().expose_secret(), issued);

    manager.logout().await.unwrap();
    assert_eq!(
        manager.access_token().unwrap_err(),
        SessionError::NotAuthenticated
    );
}

#[tokio::test(start_paused = true)]
async fn test_identity_read_from_id_token() {
    let store = CountingStore::new();
    let exchange = MockExchange::new();
    let manager = started(config(), &store, &exchange).await;

    let snapshot = manager.login(token_set(3600)).await.unwrap();
    let identity = snapshot.identity().unwrap();

    assert_eq!(identity.subject, "user-1");
    assert_eq!(identity.role, Role::Operator);
    assert_eq!(identity.email.as_deref(), Some("person@example.com"));
}
