//! Shared session storage.
//!
//! Every context of one profile shares a single store. The store is the
//! source of truth: contexts keep a local copy and reconcile it to whatever
//! the store broadcasts, moving only to higher generations.

use crate::error::SessionError;
use crate::state::{SessionState, SessionStatus, TokenSet};
use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

/// Capacity of the change channel. A subscriber that falls further behind
/// reloads from the store.
const CHANGE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
enum Change {
    Authenticated {
        tokens: TokenSet,
        access_expires_at: i64,
    },
    LoggedOut,
    Expired,
}

/// A state replacement to commit.
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    change: Change,
    expected_generation: Option<u64>,
}

impl SessionUpdate {
    /// Store a fresh token set (login or refresh).
    pub fn authenticated(tokens: TokenSet, access_expires_at: i64) -> Self {
        Self::new(Change::Authenticated {
            tokens,
            access_expires_at,
        })
    }

    /// Clear tokens; the session is over by user choice.
    pub fn logged_out() -> Self {
        Self::new(Change::LoggedOut)
    }

    /// Clear tokens; the refresh token was rejected.
    pub fn expired() -> Self {
        Self::new(Change::Expired)
    }

    /// Only commit if the store is still at `generation`.
    #[must_use]
    pub fn if_generation(mut self, generation: u64) -> Self {
        self.expected_generation = Some(generation);
        self
    }

    fn new(change: Change) -> Self {
        Self {
            change,
            expected_generation: None,
        }
    }

    fn apply(self, current: &SessionState) -> SessionState {
        let generation = current.generation + 1;
        match self.change {
            Change::Authenticated {
                tokens,
                access_expires_at,
            } => SessionState {
                generation,
                status: SessionStatus::Authenticated,
                tokens: Some(tokens),
                access_expires_at: Some(access_expires_at),
            },
            Change::LoggedOut => SessionState {
                generation,
                ..SessionState::default()
            },
            Change::Expired => SessionState {
                generation,
                status: SessionStatus::Expired,
                tokens: None,
                access_expires_at: None,
            },
        }
    }
}

/// Outcome of [`SessionStore::update`].
#[derive(Debug, Clone)]
pub enum Commit {
    /// The update was written; this is the new state.
    Committed(SessionState),
    /// Another context moved the store past the expected generation. The
    /// update was discarded; this is the state that won.
    Superseded(SessionState),
}

/// Storage shared by every context of a session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Current state.
    async fn load(&self) -> Result<SessionState, SessionError>;

    /// Atomically replace the state with `update` applied, assigning the next
    /// generation, then notify subscribers.
    async fn update(&self, update: SessionUpdate) -> Result<Commit, SessionError>;

    /// Notifications of committed states, in commit order.
    fn subscribe(&self) -> broadcast::Receiver<SessionState>;
}

/// In-process store, shared between contexts through an `Arc`.
pub struct MemorySessionStore {
    state: Mutex<SessionState>,
    changes: broadcast::Sender<SessionState>,
}

impl MemorySessionStore {
    /// Create an empty store at generation 0.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(SessionState::default()),
            changes,
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<SessionState, SessionError> {
        Ok(self.state.lock().await.clone())
    }

    async fn update(&self, update: SessionUpdate) -> Result<Commit, SessionError> {
        let mut state = self.state.lock().await;

        if let Some(expected) = update.expected_generation {
            if state.generation != expected {
                tracing::debug!(
                    target: "session.store",
                    expected,
                    current = state.generation,
                    "Update superseded"
                );
                return Ok(Commit::Superseded(state.clone()));
            }
        }

        *state = update.apply(&state);
        tracing::debug!(
            target: "session.store",
            generation = state.generation,
            status = ?state.status,
            "Session state committed"
        );

        // Notify while still holding the lock so subscribers see commits in
        // generation order. No receivers is fine.
        let _ = self.changes.send(state.clone());
        Ok(Commit::Committed(state.clone()))
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.changes.subscribe()
    }
}
