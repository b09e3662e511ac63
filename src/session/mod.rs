//! Session Module
//!
//! Per-caller sessions: each owns one event stream connection and ties a
//! caller identity to the account it submits for.

pub mod initializer;
pub mod rate_limit;
pub mod registry;

pub use initializer::{DerivedAccounts, SessionInitializer};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use registry::{EvictionCallback, SessionConfig, SessionDeps, SessionRegistry};

use crate::streaming::{ConnectionManager, StreamError};
use crate::types::AccountId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Rate limit exceeded, retry after {}s", retry_after.as_secs())]
    RateLimitExceeded { retry_after: Duration },

    #[error("Identity {identity} already holds {limit} sessions")]
    CapacityExceeded { identity: String, limit: usize },

    #[error("Session initialization failed: {0}")]
    Initialization(String),

    #[error("Session stream failed: {0}")]
    Connection(#[from] StreamError),

    #[error("Session {0} not found")]
    NotFound(Uuid),
}

impl SessionError {
    /// Check if the same request may succeed later without caller changes
    pub fn is_transient(&self) -> bool {
        match self {
            SessionError::Connection(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// One live session
pub struct Session {
    id: Uuid,
    identity: String,
    account: AccountId,
    connection: ConnectionManager,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    marked_for_cleanup: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("account", &self.account)
            .field("state", &self.connection.state())
            .field("marked_for_cleanup", &self.is_marked())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        id: Uuid,
        identity: String,
        account: AccountId,
        connection: ConnectionManager,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity,
            account,
            connection,
            created_at: now,
            last_activity: Mutex::new(now),
            marked_for_cleanup: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    pub fn is_marked(&self) -> bool {
        self.marked_for_cleanup.load(Ordering::Acquire)
    }

    /// Record activity. Ignored once marked.
    pub(crate) fn touch(&self) -> bool {
        if self.is_marked() {
            return false;
        }
        *self.last_activity.lock() = Instant::now();
        true
    }

    /// `true` if this call did the marking
    pub(crate) fn mark(&self) -> bool {
        !self.marked_for_cleanup.swap(true, Ordering::AcqRel)
    }
}
