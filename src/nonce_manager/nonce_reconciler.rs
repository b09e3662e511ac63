//! Drift reconciliation between local sequence state and the ledger
//!
//! Resolution rules, with `drift = |local - ledger|`:
//!
//! | local vs ledger               | resolution    | effect                              |
//! |-------------------------------|---------------|-------------------------------------|
//! | no local entry                | `Initialized` | adopt ledger, clear pending         |
//! | local <= ledger               | `Adopted`     | adopt ledger, clear pending         |
//! | local > ledger, drift <= T    | `KeptLocal`   | read-replica lag, keep local + pending |
//! | local > ledger, drift > T     | `ChainReset`  | adopt ledger, clear pending + records |
//!
//! `T` is the configurable drift threshold (default 100). A drift exactly
//! equal to `T` counts as lag.

use super::nonce_errors::{NonceError, NonceResult};
use super::nonce_store::NonceStore;
use super::pending_tx::PendingTxStore;
use crate::ledger::Ledger;
use crate::metrics::metrics;
use crate::types::{AccountId, Sequence};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Default backward drift tolerated as indexer lag
pub const DEFAULT_DRIFT_THRESHOLD: u64 = 100;

/// Default minimum spacing between opportunistic reconciliations
pub const DEFAULT_MIN_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Reconciliation policy
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub drift_threshold: u64,
    pub min_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
            min_interval: DEFAULT_MIN_RECONCILE_INTERVAL,
        }
    }
}

/// How a reconciliation resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftResolution {
    /// No local state; ledger value adopted
    Initialized { ledger: Sequence },
    /// Local was behind or equal; ledger value adopted
    Adopted { local: Sequence, ledger: Sequence },
    /// Local ahead within threshold; local kept
    KeptLocal { local: Sequence, ledger: Sequence },
    /// Local far ahead; ledger reset assumed, local truncated
    ChainReset { local: Sequence, ledger: Sequence },
}

impl DriftResolution {
    fn label(&self) -> &'static str {
        match self {
            DriftResolution::Initialized { .. } => "initialized",
            DriftResolution::Adopted { .. } => "adopted",
            DriftResolution::KeptLocal { .. } => "kept_local",
            DriftResolution::ChainReset { .. } => "chain_reset",
        }
    }
}

/// Pure decision function for a local/ledger pair
pub fn resolve_drift(local: Option<Sequence>, ledger: Sequence, threshold: u64) -> DriftResolution {
    match local {
        None => DriftResolution::Initialized { ledger },
        Some(local) if local <= ledger => DriftResolution::Adopted { local, ledger },
        Some(local) if local - ledger > threshold => DriftResolution::ChainReset { local, ledger },
        Some(local) => DriftResolution::KeptLocal { local, ledger },
    }
}

/// Compares local sequence state against the ledger and resolves mismatches
pub struct DriftReconciler {
    store: Arc<NonceStore>,
    ledger: Arc<dyn Ledger>,
    config: ReconcilerConfig,
    pending_records: Option<Arc<PendingTxStore>>,
}

impl std::fmt::Debug for DriftReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriftReconciler")
            .field("config", &self.config)
            .field("has_pending_records", &self.pending_records.is_some())
            .finish_non_exhaustive()
    }
}

impl DriftReconciler {
    pub fn new(store: Arc<NonceStore>, ledger: Arc<dyn Ledger>, config: ReconcilerConfig) -> Self {
        Self {
            store,
            ledger,
            config,
            pending_records: None,
        }
    }

    /// Also prune persisted pending transactions when local state is declared stale
    pub fn with_pending_records(mut self, records: Arc<PendingTxStore>) -> Self {
        self.pending_records = Some(records);
        self
    }

    pub fn store(&self) -> &Arc<NonceStore> {
        &self.store
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Reconcile now, bypassing the interval gate. `true` when synced.
    pub async fn reconcile(&self, account: &AccountId) -> bool {
        match self.reconcile_detailed(account).await {
            Ok(_) => true,
            Err(e) => {
                warn!(account = %account.short(), error = %e, "Reconciliation failed");
                false
            }
        }
    }

    /// Rate-limited reconcile. `None` when skipped by the interval gate.
    pub async fn maybe_reconcile(&self, account: &AccountId) -> Option<bool> {
        if let Some(last) = self.store.last_sync_at(account) {
            if last.elapsed() < self.config.min_interval {
                debug!(account = %account.short(), "Reconciliation skipped, interval not elapsed");
                return None;
            }
        }
        Some(self.reconcile(account).await)
    }

    /// Reconcile and report how the drift was resolved
    #[instrument(skip(self), fields(account = %account.short()))]
    pub async fn reconcile_detailed(&self, account: &AccountId) -> NonceResult<DriftResolution> {
        let ledger_value = self
            .ledger
            .get_account(account)
            .await
            .map_err(|e| NonceError::LedgerFetch {
                account: *account,
                message: e.to_string(),
            })?
            .map(|a| a.sequence)
            .unwrap_or(0);

        let local = self.store.entry(account).map(|e| e.current);
        let resolution = resolve_drift(local, ledger_value, self.config.drift_threshold);

        match resolution {
            DriftResolution::Initialized { ledger } => {
                self.store.adopt(account, ledger, true);
                self.prune_records(account, ledger);
            }
            DriftResolution::Adopted { ledger, .. } => {
                self.store.adopt(account, ledger, true);
                self.prune_records(account, ledger);
            }
            DriftResolution::KeptLocal { local, ledger } => {
                debug!(local, ledger, "Local ahead of ledger within threshold, keeping local");
            }
            DriftResolution::ChainReset { local, ledger } => {
                warn!(
                    local,
                    ledger,
                    threshold = self.config.drift_threshold,
                    "Chain reset detected, truncating local sequence state"
                );
                self.store.adopt(account, ledger, true);
                if let Some(records) = &self.pending_records {
                    let dropped = records.clear_account(account);
                    if dropped > 0 {
                        warn!(dropped, "Discarded pending transactions after chain reset");
                    }
                }
                metrics().chain_resets.inc();
            }
        }

        self.store.mark_synced(account, Instant::now());
        self.store.flush_or_warn();
        metrics()
            .reconciliations
            .with_label_values(&[resolution.label()])
            .inc();

        info!(resolution = ?resolution, "Reconciled account sequence");
        Ok(resolution)
    }

    /// Records below the ledger sequence have executed
    fn prune_records(&self, account: &AccountId, ledger: Sequence) {
        let Some(records) = &self.pending_records else {
            return;
        };
        if ledger == 0 {
            return;
        }
        let removed = records.confirm_through(account, ledger - 1);
        if removed > 0 {
            debug!(removed, "Pruned executed pending transactions");
        }
    }
}
