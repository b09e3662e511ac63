//! Per-account sequence counters with in-flight tracking
//!
//! `NonceStore` is the source of truth for "which sequence do I use next".
//! Each account gets an [`AccountNonceEntry`] holding:
//! - `current`: next sequence to allocate. Only moves backward through
//!   [`NonceStore::reset`], [`NonceStore::release`] of the most recent
//!   allocation, or reconciliation.
//! - `pending`: sequences handed out but not yet accepted, confirmed, or
//!   reconciled away. Every pending value is `< current`.
//! - `last_sync_at`: last successful reconciliation, used by the interval gate.
//!
//! The store does not serialize callers. `SubmissionCoordinator` holds the
//! per-account lock around every allocate/send/release cycle.

use super::nonce_errors::NonceResult;
use super::nonce_persistence::NonceBackend;
use crate::types::{AccountId, Sequence};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Sequence state for one account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountNonceEntry {
    pub current: Sequence,
    pub pending: BTreeSet<Sequence>,
    pub last_sync_at: Option<Instant>,
}

impl AccountNonceEntry {
    fn with_current(current: Sequence) -> Self {
        Self {
            current,
            ..Default::default()
        }
    }

    fn check_invariant(&self) {
        debug_assert!(
            self.pending.iter().all(|s| *s < self.current),
            "pending sequence >= current ({:?} vs {})",
            self.pending,
            self.current
        );
    }
}

/// Arena of per-account nonce entries backed by a [`NonceBackend`]
#[derive(Debug)]
pub struct NonceStore {
    entries: DashMap<AccountId, AccountNonceEntry>,
    backend: Arc<dyn NonceBackend>,
    /// Held across snapshot + save so an older snapshot never lands last
    flush_lock: Mutex<()>,
}

impl NonceStore {
    /// Empty store that persists through `backend`
    pub fn new(backend: Arc<dyn NonceBackend>) -> Self {
        Self {
            entries: DashMap::new(),
            backend,
            flush_lock: Mutex::new(()),
        }
    }

    /// Store populated from whatever `backend` holds.
    ///
    /// A backend that cannot be read at all yields an empty store and a warning.
    pub fn open(backend: Arc<dyn NonceBackend>) -> Self {
        let store = Self::new(backend);
        match store.backend.load() {
            Ok(loaded) => {
                for (account, current) in loaded {
                    store
                        .entries
                        .insert(account, AccountNonceEntry::with_current(current));
                }
                debug!(accounts = store.entries.len(), "Nonce store loaded");
            }
            Err(e) => {
                warn!(error = %e, "Failed to load nonce store, starting empty");
            }
        }
        store
    }

    /// Hand out the next sequence for `account` and mark it pending
    pub fn allocate(&self, account: &AccountId) -> Sequence {
        let mut entry = self.entries.entry(*account).or_default();
        let sequence = entry.current;
        entry.pending.insert(sequence);
        entry.current = sequence.saturating_add(1);
        entry.check_invariant();

        debug!(account = %account.short(), sequence, "Allocated sequence");
        sequence
    }

    /// Next sequence that would be allocated, without mutating anything
    pub fn peek(&self, account: &AccountId) -> Sequence {
        self.entries.get(account).map(|e| e.current).unwrap_or(0)
    }

    pub fn contains(&self, account: &AccountId) -> bool {
        self.entries.contains_key(account)
    }

    /// Snapshot of an account's entry
    pub fn entry(&self, account: &AccountId) -> Option<AccountNonceEntry> {
        self.entries.get(account).map(|e| e.clone())
    }

    pub fn pending(&self, account: &AccountId) -> Vec<Sequence> {
        self.entries
            .get(account)
            .map(|e| e.pending.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Authoritative forward override.
    ///
    /// Returns `true` if `current` moved. A value below `current` is ignored.
    pub fn set_current(&self, account: &AccountId, value: Sequence) -> bool {
        let mut entry = self.entries.entry(*account).or_default();
        if value < entry.current {
            debug!(
                account = %account.short(),
                current = entry.current,
                requested = value,
                "Ignoring backward set_current"
            );
            return false;
        }
        let moved = value != entry.current;
        entry.current = value;
        entry.check_invariant();
        moved
    }

    /// Drop `sequence` from pending. Confirming an absent sequence is a no-op.
    pub fn confirm(&self, account: &AccountId, sequence: Sequence) -> bool {
        match self.entries.get_mut(account) {
            Some(mut entry) => entry.pending.remove(&sequence),
            None => false,
        }
    }

    /// Undo an allocation the ledger refused.
    ///
    /// Rewinds `current` only when `sequence` is the most recent allocation.
    pub fn release(&self, account: &AccountId, sequence: Sequence) {
        if let Some(mut entry) = self.entries.get_mut(account) {
            entry.pending.remove(&sequence);
            if entry.current == sequence.saturating_add(1) {
                entry.current = sequence;
            }
            entry.check_invariant();
            debug!(account = %account.short(), sequence, current = entry.current, "Released sequence");
        }
    }

    /// Zero the counter and drop every pending sequence
    pub fn reset(&self, account: &AccountId) {
        self.entries
            .insert(*account, AccountNonceEntry::with_current(0));
        debug!(account = %account.short(), "Nonce entry reset");
    }

    /// Reconciliation override. May move `current` backward.
    pub(crate) fn adopt(&self, account: &AccountId, value: Sequence, clear_pending: bool) {
        let mut entry = self.entries.entry(*account).or_default();
        entry.current = value;
        if clear_pending {
            entry.pending.clear();
        } else {
            entry.pending.retain(|s| *s < value);
        }
        entry.check_invariant();
    }

    pub fn last_sync_at(&self, account: &AccountId) -> Option<Instant> {
        self.entries.get(account).and_then(|e| e.last_sync_at)
    }

    pub(crate) fn mark_synced(&self, account: &AccountId, at: Instant) {
        self.entries.entry(*account).or_default().last_sync_at = Some(at);
    }

    /// Session teardown: abandon pending sequences and persist the counter
    pub fn retire(&self, account: &AccountId) {
        if let Some(mut entry) = self.entries.get_mut(account) {
            entry.pending.clear();
        }
        self.flush_or_warn();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Account -> current map, the persisted shape
    pub fn snapshot(&self) -> BTreeMap<AccountId, Sequence> {
        self.entries
            .iter()
            .map(|e| (*e.key(), e.value().current))
            .collect()
    }

    /// Write the current snapshot to the backend
    pub fn flush(&self) -> NonceResult<()> {
        let _guard = self.flush_lock.lock();
        let snapshot = self.snapshot();
        self.backend.save(&snapshot)
    }

    /// Flush, logging instead of propagating failures
    pub fn flush_or_warn(&self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to persist nonce store");
        }
    }
}
