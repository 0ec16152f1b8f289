//! Session manager.
//!
//! One [`SessionManager`] per context. It holds the context's view of the
//! shared session, schedules the background refresh, and listens to the
//! [`SessionStore`] for changes committed by other contexts.
//!
//! # Consistency
//!
//! - Every transition is one atomic store update with the next generation.
//! - A context adopts a stored state only if its generation is higher than
//!   the local one, so a stale context can never roll the session back.
//! - A refresh commits only if the store is still at the generation the
//!   refresh started from. When a timer fires after another context already
//!   committed, the refresh is skipped and rescheduled from the newer expiry.
//! - At most one refresh is pending per context; scheduling a new one
//!   cancels the previous one, and logout cancels it outright.
//!
//! Local transitions (user actions, refresh steps, store notifications) are
//! serialized by one async lock. The exchange itself runs outside the lock
//! so user actions never wait for the network.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::exchange::RefreshExchange;
use crate::state::{SessionSnapshot, SessionState, SessionStatus, TokenSet};
use crate::store::{Commit, SessionStore, SessionUpdate};
use chrono::{DateTime, Utc};
use common::secret::SecretString;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Floor on the delay before a scheduled refresh.
///
/// Tokens that expire within the refresh skew would otherwise be
/// refreshed back to back.
const MIN_REFRESH_DELAY_SECS: i64 = 1;

/// Handle to a context's session.
///
/// Cheap to clone; every clone drives the same context. Dropping the last
/// clone stops the background refresh and the store listener.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct ScheduledRefresh {
    generation: u64,
    cancel: CancellationToken,
}

struct Inner {
    config: SessionConfig,
    store: Arc<dyn SessionStore>,
    exchange: Arc<dyn RefreshExchange>,
    snapshot: watch::Sender<SessionSnapshot>,
    transitions: Mutex<()>,
    scheduled: std::sync::Mutex<Option<ScheduledRefresh>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Subscription to a context's [`SessionSnapshot`].
#[derive(Clone)]
pub struct SessionReceiver(watch::Receiver<SessionSnapshot>);

impl SessionReceiver {
    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.0.borrow().clone()
    }

    /// Wait for the next change and return the new snapshot.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ChannelClosed` if the manager was dropped.
    pub async fn changed(&mut self) -> Result<SessionSnapshot, SessionError> {
        self.0
            .changed()
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        Ok(self.0.borrow_and_update().clone())
    }

    /// Wait until the snapshot satisfies `condition`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ChannelClosed` if the manager was dropped.
    pub async fn wait_for(
        &mut self,
        condition: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, SessionError> {
        self.0
            .wait_for(condition)
            .await
            .map(|snapshot| snapshot.clone())
            .map_err(|_| SessionError::ChannelClosed)
    }
}

impl fmt::Debug for SessionReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.0.borrow();
        f.debug_struct("SessionReceiver")
            .field("status", &snapshot.status)
            .field("generation", &snapshot.generation)
            .finish()
    }
}

impl SessionManager {
    /// Create a manager for one context. Call [`SessionManager::start`] to
    /// load the shared session and follow other contexts.
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn SessionStore>,
        exchange: Arc<dyn RefreshExchange>,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                exchange,
                snapshot,
                transitions: Mutex::new(()),
                scheduled: std::sync::Mutex::new(None),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Load the persisted session, schedule its refresh, and start following
    /// changes from other contexts. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Store` if the session cannot be loaded.
    #[instrument(skip_all)]
    pub async fn start(&self) -> Result<SessionSnapshot, SessionError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(self.snapshot());
        }

        // Subscribe before loading so no commit falls between the two
        let changes = self.inner.store.subscribe();
        let stored = match self.inner.store.load().await {
            Ok(stored) => stored,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        {
            let _guard = self.inner.transitions.lock().await;
            self.inner.reconcile(stored);
        }
        spawn_listener(&self.inner, changes);

        let snapshot = self.snapshot();
        info!(
            target: "session.manager",
            generation = snapshot.generation,
            status = ?snapshot.status,
            "Session manager started"
        );
        Ok(snapshot)
    }

    /// Store a freshly issued token set and schedule its refresh.
    ///
    /// # Errors
    ///
    /// - `InvalidTokenSet` if the access token has no readable expiry
    /// - `Store` if the session cannot be persisted
    #[instrument(skip_all)]
    pub async fn login(&self, tokens: TokenSet) -> Result<SessionSnapshot, SessionError> {
        let access_expires_at = tokens.access_expiry()?;

        let _guard = self.inner.transitions.lock().await;
        let state = match self
            .inner
            .store
            .update(SessionUpdate::authenticated(tokens, access_expires_at))
            .await?
        {
            Commit::Committed(state) | Commit::Superseded(state) => state,
        };

        info!(
            target: "session.manager",
            generation = state.generation,
            "Signed in"
        );
        self.inner.adopt(state, None);
        Ok(self.snapshot())
    }

    /// Run a sign-in flow and store its tokens.
    ///
    /// The status is `Authenticating` while `sign_in` runs. If it fails the
    /// previous status is restored and the error recorded in `last_error`.
    ///
    /// # Errors
    ///
    /// The error of `sign_in`, or any error of [`SessionManager::login`].
    pub async fn login_with<F>(&self, sign_in: F) -> Result<SessionSnapshot, SessionError>
    where
        F: Future<Output = Result<TokenSet, SessionError>> + Send,
    {
        let previous = self.inner.snapshot.borrow().status;
        self.inner
            .snapshot
            .send_modify(|s| s.status = SessionStatus::Authenticating);

        let result = match sign_in.await {
            Ok(tokens) => self.login(tokens).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(target: "session.manager", error = %e, "Sign-in failed");
            self.inner.snapshot.send_modify(|s| {
                if s.status == SessionStatus::Authenticating {
                    s.status = previous;
                }
                s.last_error = Some(e.clone());
            });
        }
        result
    }

    /// End the session in every context. Any pending refresh is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Store` if the logout cannot be persisted.
    #[instrument(skip_all)]
    pub async fn logout(&self) -> Result<SessionSnapshot, SessionError> {
        let _guard = self.inner.transitions.lock().await;
        let state = match self.inner.store.update(SessionUpdate::logged_out()).await? {
            Commit::Committed(state) | Commit::Superseded(state) => state,
        };

        info!(
            target: "session.manager",
            generation = state.generation,
            "Signed out"
        );
        self.inner.adopt(state, None);
        Ok(self.snapshot())
    }

    /// Current snapshot of this context.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Follow this context's snapshots.
    #[must_use]
    pub fn subscribe(&self) -> SessionReceiver {
        SessionReceiver(self.inner.snapshot.subscribe())
    }

    /// Access token to attach to an outgoing request.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotAuthenticated` unless the session holds
    /// tokens.
    pub fn access_token(&self) -> Result<SecretString, SessionError> {
        self.inner
            .snapshot
            .borrow()
            .access_token()
            .cloned()
            .ok_or(SessionError::NotAuthenticated)
    }

    /// When the pending refresh is due, if one is scheduled.
    #[must_use]
    pub fn refresh_at(&self) -> Option<DateTime<Utc>> {
        self.inner.snapshot.borrow().refresh_at
    }

    /// Stop the background refresh and the store listener. The shared
    /// session is left as it is.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        debug!(target: "session.manager", "Session manager shut down");
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.inner.snapshot.borrow();
        f.debug_struct("SessionManager")
            .field("status", &snapshot.status)
            .field("generation", &snapshot.generation)
            .field("refresh_at", &snapshot.refresh_at)
            .finish()
    }
}

impl Inner {
    /// Replace the local copy with `state` and schedule its refresh.
    ///
    /// Callers hold `transitions` and pass a state read from the store, which
    /// is never older than the local copy.
    fn adopt(self: &Arc<Self>, state: SessionState, last_error: Option<SessionError>) {
        let refresh_at = match (state.status, state.access_expires_at) {
            (SessionStatus::Authenticated, Some(exp)) => Some(self.refresh_instant(exp)),
            _ => None,
        };
        let generation = state.generation;

        self.snapshot.send_replace(SessionSnapshot::from_state(
            &state,
            refresh_at,
            last_error,
            &self.config.claim_mapping,
        ));

        match refresh_at {
            Some(at) => self.schedule_at(generation, at),
            None => self.cancel_scheduled(),
        }
    }

    /// Adopt a state committed elsewhere if it is newer than the local copy.
    fn reconcile(self: &Arc<Self>, state: SessionState) {
        let local = self.snapshot.borrow().generation;
        if state.generation <= local {
            return;
        }

        info!(
            target: "session.manager",
            from = local,
            to = state.generation,
            status = ?state.status,
            "Session changed in another context"
        );
        self.adopt(state, None);
    }

    /// When to refresh a token expiring at `access_expires_at`.
    ///
    /// The lead time is the refresh skew, capped at half the remaining
    /// lifetime, and the result is never sooner than
    /// [`MIN_REFRESH_DELAY_SECS`] from now.
    fn refresh_instant(&self, access_expires_at: i64) -> DateTime<Utc> {
        let now = Utc::now();
        let earliest = now + chrono::Duration::seconds(MIN_REFRESH_DELAY_SECS);
        let Some(expires_at) = DateTime::<Utc>::from_timestamp(access_expires_at, 0) else {
            return earliest;
        };

        let half_remaining = (expires_at - now) / 2;
        let lead = chrono::Duration::from_std(self.config.refresh_skew)
            .map_or(half_remaining, |skew| skew.min(half_remaining));
        (expires_at - lead).max(earliest)
    }

    /// Schedule the refresh of `generation` at `at`, replacing any pending
    /// one.
    fn schedule_at(self: &Arc<Self>, generation: u64, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let cancel = self.shutdown.child_token();

        let previous = self
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(ScheduledRefresh {
                generation,
                cancel: cancel.clone(),
            });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        debug!(
            target: "session.manager",
            generation,
            delay_secs = delay.as_secs(),
            "Refresh scheduled"
        );

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            if let Some(inner) = weak.upgrade() {
                inner.run_refresh(generation, cancel).await;
            }
        });
    }

    fn cancel_scheduled(&self) {
        let previous = self
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.cancel.cancel();
            debug!(
                target: "session.manager",
                generation = previous.generation,
                "Scheduled refresh cancelled"
            );
        }
    }

    #[instrument(skip_all, fields(generation = generation))]
    async fn run_refresh(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let Some(previous) = self.begin_refresh(generation, &cancel).await else {
            return;
        };

        let mut backoff = self.config.initial_backoff;
        let mut attempt: u32 = 1;

        loop {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = self.exchange.exchange(&previous.refresh_token) => result,
            };

            let refreshed = result.and_then(|tokens| {
                let tokens = tokens.merge_into(&previous);
                let access_expires_at = tokens
                    .access_expiry()
                    .map_err(|e| SessionError::RefreshTransientFailure(e.to_string()))?;
                Ok((tokens, access_expires_at))
            });

            match refreshed {
                Ok((tokens, access_expires_at)) => {
                    self.commit_refresh(generation, &cancel, tokens, access_expires_at)
                        .await;
                    return;
                }
                Err(e) if e.is_terminal() => {
                    self.expire(generation, &cancel, e).await;
                    return;
                }
                Err(e) if attempt >= self.config.max_refresh_attempts => {
                    self.give_up(generation, &cancel, e).await;
                    return;
                }
                Err(e) => {
                    warn!(
                        target: "session.manager",
                        attempt,
                        backoff = ?backoff,
                        error = %e,
                        "Token refresh failed, will retry"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2).min(self.config.max_backoff);
                    attempt += 1;
                }
            }
        }
    }

    /// Reconcile with the store and mark the context `Refreshing`.
    ///
    /// Returns the tokens to refresh, or `None` if there is nothing to do.
    async fn begin_refresh(
        self: &Arc<Self>,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Option<TokenSet> {
        let _guard = self.transitions.lock().await;
        if cancel.is_cancelled() {
            return None;
        }

        let stored = match self.store.load().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(target: "session.manager", error = %e, "Failed to load session before refresh");
                self.retry_later(generation, e);
                return None;
            }
        };

        if stored.generation != generation {
            debug!(
                target: "session.manager",
                stored = stored.generation,
                "Session already changed, skipping refresh"
            );
            self.adopt(stored, None);
            return None;
        }

        let tokens = match (stored.status, stored.tokens) {
            (SessionStatus::Authenticated, Some(tokens)) => tokens,
            _ => return None,
        };

        self.snapshot
            .send_modify(|s| s.status = SessionStatus::Refreshing);
        debug!(target: "session.manager", "Refreshing session");
        Some(tokens)
    }

    async fn commit_refresh(
        self: &Arc<Self>,
        generation: u64,
        cancel: &CancellationToken,
        tokens: TokenSet,
        access_expires_at: i64,
    ) {
        let _guard = self.transitions.lock().await;
        if cancel.is_cancelled() {
            return;
        }

        let update = SessionUpdate::authenticated(tokens, access_expires_at).if_generation(generation);
        match self.store.update(update).await {
            Ok(Commit::Committed(state)) => {
                info!(
                    target: "session.manager",
                    generation = state.generation,
                    "Session refreshed"
                );
                self.adopt(state, None);
            }
            Ok(Commit::Superseded(state)) => {
                info!(
                    target: "session.manager",
                    stored = state.generation,
                    "Refresh result discarded, session already changed"
                );
                self.adopt(state, None);
            }
            Err(e) => {
                warn!(target: "session.manager", error = %e, "Failed to store refreshed session");
                self.retry_later(generation, e);
            }
        }
    }

    async fn expire(self: &Arc<Self>, generation: u64, cancel: &CancellationToken, error: SessionError) {
        let _guard = self.transitions.lock().await;
        if cancel.is_cancelled() {
            return;
        }

        match self.store.update(SessionUpdate::expired().if_generation(generation)).await {
            Ok(Commit::Committed(state)) => {
                warn!(
                    target: "session.manager",
                    generation = state.generation,
                    error = %error,
                    "Session expired, sign-in required"
                );
                self.adopt(state, Some(error));
            }
            Ok(Commit::Superseded(state)) => self.adopt(state, None),
            Err(e) => {
                warn!(target: "session.manager", error = %e, "Failed to store expired session");
                self.cancel_scheduled();
                self.snapshot.send_modify(|s| {
                    s.status = SessionStatus::Expired;
                    s.tokens = None;
                    s.identity = None;
                    s.access_expires_at = None;
                    s.refresh_at = None;
                    s.last_error = Some(error);
                });
            }
        }
    }

    async fn give_up(self: &Arc<Self>, generation: u64, cancel: &CancellationToken, error: SessionError) {
        let _guard = self.transitions.lock().await;
        if cancel.is_cancelled() {
            return;
        }

        warn!(
            target: "session.manager",
            attempts = self.config.max_refresh_attempts,
            error = %error,
            "Token refresh retries exhausted, will try again later"
        );
        self.retry_later(generation, error);
    }

    /// Keep the session, record `error`, and try again after the maximum
    /// backoff.
    fn retry_later(self: &Arc<Self>, generation: u64, error: SessionError) {
        let pause = chrono::Duration::from_std(self.config.max_backoff)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let at = Utc::now() + pause;

        self.snapshot.send_modify(|s| {
            if s.status == SessionStatus::Refreshing {
                s.status = SessionStatus::Authenticated;
            }
            s.refresh_at = Some(at);
            s.last_error = Some(error);
        });
        self.schedule_at(generation, at);
    }
}

/// Follow commits from other contexts until the manager goes away.
fn spawn_listener(inner: &Arc<Inner>, mut changes: broadcast::Receiver<SessionState>) {
    let weak = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => break,
                received = changes.recv() => received,
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };

            match received {
                Ok(state) => {
                    let _guard = inner.transitions.lock().await;
                    inner.reconcile(state);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(target: "session.manager", skipped, "Session notifications lagged, reloading");
                    let _guard = inner.transitions.lock().await;
                    match inner.store.load().await {
                        Ok(state) => inner.reconcile(state),
                        Err(e) => {
                            warn!(target: "session.manager", error = %e, "Failed to reload session");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(target: "session.manager", "Session listener stopped");
    });
}
