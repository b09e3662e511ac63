//! Session registry with rate-limited creation and mark-and-sweep eviction
//!
//! Eviction runs in two phases. `mark_idle` flags every session idle past
//! the threshold; from then on `get`/`touch` treat it as absent. `sweep`
//! tears down a snapshot of the marked sessions. Activity that arrives
//! between the phases cannot bring a marked session back.

use super::initializer::SessionInitializer;
use super::rate_limit::{RateLimitConfig, RateLimiter};
use super::{Session, SessionError};
use crate::metrics::metrics;
use crate::nonce_manager::{DriftReconciler, NonceStore, PendingTxStore};
use crate::streaming::{ConnectionConfig, ConnectionManager, EventTransport};
use crate::submission::AccountLocks;
use crate::types::{AccountId, EventFilter};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type EvictionCallback = Arc<dyn Fn(&Session) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_sessions_per_identity: usize,
    pub rate_limit: RateLimitConfig,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub connection: ConnectionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_identity: 5,
            rate_limit: RateLimitConfig::default(),
            idle_timeout: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(60),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Shared pieces every session is wired to
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn EventTransport>,
    pub store: Arc<NonceStore>,
    pub reconciler: Arc<DriftReconciler>,
    pub locks: Arc<AccountLocks>,
    pub initializer: Arc<dyn SessionInitializer>,
    pub pending_records: Option<Arc<PendingTxStore>>,
}

pub struct SessionRegistry {
    config: SessionConfig,
    deps: SessionDeps,
    sessions: DashMap<Uuid, Arc<Session>>,
    by_identity: DashMap<String, HashSet<Uuid>>,
    limiter: RateLimiter,
    on_evict: RwLock<Option<EvictionCallback>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("identities", &self.by_identity.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, deps: SessionDeps) -> Self {
        let limiter = RateLimiter::new(config.rate_limit.clone());
        Self {
            config,
            deps,
            sessions: DashMap::new(),
            by_identity: DashMap::new(),
            limiter,
            on_evict: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Called with each evicted session before it is torn down
    pub fn set_eviction_callback<F>(&self, callback: F)
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        *self.on_evict.write() = Some(Arc::new(callback));
    }

    /// Create a session for `identity`, charging `rate_limit_key`.
    ///
    /// Any failure after a slot was reserved tears down everything set up
    /// so far before the error is returned.
    pub async fn create(
        &self,
        identity: &str,
        rate_limit_key: &str,
    ) -> Result<Arc<Session>, SessionError> {
        if let Err(limited) = self.limiter.check(rate_limit_key) {
            metrics().sessions_rate_limited.inc();
            warn!(identity, rate_limit_key, retry_after_s = limited.retry_after.as_secs(), "Session creation rate limited");
            return Err(SessionError::RateLimitExceeded {
                retry_after: limited.retry_after,
            });
        }

        let id = Uuid::new_v4();
        self.reserve(identity, id)?;
        let reservation = scopeguard::guard(id, |id| self.release_slot(identity, &id));

        let account = self.deps.initializer.account_for(identity).await?;
        let connection = ConnectionManager::new(
            self.config.connection.clone(),
            self.deps.transport.clone(),
        )
        .with_nonce_feedback(
            account,
            self.deps.store.clone(),
            self.deps.pending_records.clone(),
        );
        let session = Arc::new(Session::new(id, identity.to_string(), account, connection));
        self.sessions.insert(id, session.clone());

        // From here on the session is observable; unwind it fully on failure
        let reservation = scopeguard::ScopeGuard::into_inner(reservation);
        let unwind = scopeguard::guard(session.clone(), |session| {
            warn!(session_id = %session.id(), "Unwinding partially initialized session");
            self.sessions.remove(&session.id());
            self.teardown(&session);
        });

        session.connection().connect(EventFilter::Account(account))?;
        self.deps.initializer.register(&session).await?;

        if !self.deps.reconciler.reconcile(&account).await {
            debug!(account = %account.short(), "Initial reconciliation failed, continuing with local state");
        }

        scopeguard::ScopeGuard::into_inner(unwind);
        metrics().sessions_created.inc();
        metrics().active_sessions.set(self.sessions.len() as i64);
        info!(
            session_id = %reservation,
            identity,
            account = %account.short(),
            "Session created"
        );
        Ok(session)
    }

    fn reserve(&self, identity: &str, id: Uuid) -> Result<(), SessionError> {
        let mut ids = self.by_identity.entry(identity.to_string()).or_default();
        if ids.len() >= self.config.max_sessions_per_identity {
            return Err(SessionError::CapacityExceeded {
                identity: identity.to_string(),
                limit: self.config.max_sessions_per_identity,
            });
        }
        ids.insert(id);
        Ok(())
    }

    fn release_slot(&self, identity: &str, id: &Uuid) {
        self.by_identity.remove_if_mut(identity, |_, ids| {
            ids.remove(id);
            ids.is_empty()
        });
    }

    /// Live session by id; refreshes its activity. Marked sessions are absent.
    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        let session = self.sessions.get(id)?.clone();
        if !session.touch() {
            return None;
        }
        Some(session)
    }

    /// Refresh activity without handing out the session
    pub fn touch(&self, id: &Uuid) -> bool {
        self.sessions
            .get(id)
            .map(|session| session.touch())
            .unwrap_or(false)
    }

    /// Tear a session down. `false` if it was already gone.
    pub fn destroy(&self, id: &Uuid) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                self.teardown(&session);
                metrics().active_sessions.set(self.sessions.len() as i64);
                info!(session_id = %id, "Session destroyed");
                true
            }
            None => false,
        }
    }

    /// Phase one: mark sessions idle for at least `max_idle`.
    ///
    /// Returns every marked session still registered, including ones marked
    /// by an earlier pass that was never swept.
    pub fn mark_idle(&self, max_idle: Duration) -> Vec<Arc<Session>> {
        let mut marked = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if !session.is_marked() && session.idle_for() >= max_idle && session.mark() {
                debug!(session_id = %session.id(), idle_s = session.idle_for().as_secs(), "Session marked for cleanup");
            }
            if session.is_marked() {
                marked.push(session.clone());
            }
        }
        marked
    }

    /// Phase two: tear down a snapshot of marked sessions
    pub fn sweep(&self, marked: Vec<Arc<Session>>) -> usize {
        let callback = self.on_evict.read().clone();
        let mut evicted = 0;
        for session in marked {
            if !session.is_marked() {
                continue;
            }
            if self.sessions.remove(&session.id()).is_none() {
                continue;
            }
            // Notified only for sessions this pass actually evicts, before teardown
            if let Some(callback) = &callback {
                callback(&session);
            }
            self.teardown(&session);
            evicted += 1;
        }
        if evicted > 0 {
            metrics().sessions_evicted.inc_by(evicted as u64);
            metrics().active_sessions.set(self.sessions.len() as i64);
            info!(evicted, remaining = self.sessions.len(), "Idle sessions evicted");
        }
        evicted
    }

    /// Mark then sweep. Returns how many sessions were evicted.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let marked = self.mark_idle(max_idle);
        let evicted = self.sweep(marked);
        let pruned = self.limiter.prune();
        if pruned > 0 {
            debug!(pruned, "Expired rate limit buckets pruned");
        }
        evicted
    }

    /// Sweep every `sweep_interval` until `shutdown` flips to true
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_idle(self.config.idle_timeout);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Session sweeper stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Live sessions for `identity`
    pub fn sessions_for(&self, identity: &str) -> Vec<Arc<Session>> {
        let Some(ids) = self.by_identity.get(identity).map(|ids| ids.clone()) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.sessions.get(id).map(|s| s.clone()))
            .filter(|s| !s.is_marked())
            .collect()
    }

    /// Tear down every session
    pub fn destroy_all(&self) -> usize {
        let ids: Vec<Uuid> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.iter().filter(|id| self.destroy(id)).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn account_in_use(&self, account: &AccountId) -> bool {
        self.sessions.iter().any(|s| s.account() == account)
    }

    /// Close the stream, free the identity slot and, when no other session
    /// uses the account, release its nonce state and lock token.
    fn teardown(&self, session: &Session) {
        session.connection().disconnect();
        self.release_slot(session.identity(), &session.id());
        if !self.account_in_use(session.account()) {
            self.deps.store.retire(session.account());
            self.deps.locks.prune(session.account());
        }
    }
}
