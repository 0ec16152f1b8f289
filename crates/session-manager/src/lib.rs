//! Client-side session manager.
//!
//! Keeps a token set usable without interrupting the user, and keeps every
//! context (tab, window, process) that shares one persisted session
//! consistent.
//!
//! # Features
//!
//! - Proactive refresh at `access token expiry - skew` (default 5 minutes)
//! - Exponential backoff on transient refresh failures (1s, 2s, 4s, ..., max 30s)
//! - Terminal refresh failures end the session as `Expired`
//! - Shared [`SessionStore`] with a strictly increasing generation; contexts
//!   only ever move to a higher generation
//! - Snapshot subscription via `tokio::sync::watch`
//!
//! # Example
//!
//! ```rust,ignore
//! use session_manager::{HttpRefreshExchange, MemorySessionStore, SessionConfig, SessionManager};
//! use std::sync::Arc;
//!
//! let config = SessionConfig::new_secure(
//!     "https://auth.example.com/oauth2/token".to_string(),
//!     "web-client".to_string(),
//! )?;
//! let store = Arc::new(MemorySessionStore::new());
//! let exchange = Arc::new(HttpRefreshExchange::new(&config)?);
//!
//! let manager = SessionManager::new(config, store, exchange);
//! manager.start().await?;
//! manager.login(tokens).await?;
//!
//! let mut session = manager.subscribe();
//! session.changed().await?;
//! ```

pub mod config;
pub mod error;
pub mod exchange;
pub mod manager;
pub mod state;
pub mod store;

pub use config::SessionConfig;
pub use error::SessionError;
pub use exchange::{HttpRefreshExchange, RefreshExchange, RefreshedTokens};
pub use manager::{SessionManager, SessionReceiver};
pub use state::{Identity, SessionSnapshot, SessionState, SessionStatus, TokenSet};
pub use store::{Commit, MemorySessionStore, SessionStore, SessionUpdate};
