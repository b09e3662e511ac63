//! Per-account submission state machine
//!
//! ```text
//! lock(account)
//!   -> maybe_reconcile (interval gated)
//!   -> allocate -> build -> send
//!        Accepted            -> confirm, current = seq + 1, on_success
//!        SequenceMismatch    -> release, reconcile (forced), allocate -> build -> send once more
//!        Other rejection     -> release, return to caller
//!        Transport failure   -> keep seq pending, return to caller
//! unlock (guard drop, every exit path)
//! ```
//!
//! A second mismatch after a fresh reconciliation is returned as-is: the
//! problem is not the sequence.

use super::locks::AccountLocks;
use super::SubmissionError;
use crate::ledger::{Ledger, RejectReason, SubmitOutcome};
use crate::metrics::{metrics, Timer};
use crate::nonce_manager::{DriftReconciler, NonceStore, PendingTxStore};
use crate::observability::CorrelationId;
use crate::types::{AccountId, Sequence};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Final verdict of a `submit` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Accepted {
        sequence: Sequence,
        /// Accepted on the post-reconciliation retry
        retried: bool,
    },
    Rejected {
        sequence: Sequence,
        reason: RejectReason,
    },
}

impl SubmissionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmissionOutcome::Accepted { .. })
    }

    pub fn sequence(&self) -> Sequence {
        match self {
            SubmissionOutcome::Accepted { sequence, .. }
            | SubmissionOutcome::Rejected { sequence, .. } => *sequence,
        }
    }
}

enum Attempt {
    Accepted(Sequence),
    Rejected(Sequence, RejectReason),
}

/// Serializes submissions per account and recovers from sequence drift
pub struct SubmissionCoordinator {
    store: Arc<NonceStore>,
    reconciler: Arc<DriftReconciler>,
    ledger: Arc<dyn Ledger>,
    locks: Arc<AccountLocks>,
    pending_records: Option<Arc<PendingTxStore>>,
}

impl std::fmt::Debug for SubmissionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionCoordinator")
            .field("locked_accounts", &self.locks.len())
            .field("has_pending_records", &self.pending_records.is_some())
            .finish_non_exhaustive()
    }
}

impl SubmissionCoordinator {
    pub fn new(
        store: Arc<NonceStore>,
        reconciler: Arc<DriftReconciler>,
        ledger: Arc<dyn Ledger>,
        locks: Arc<AccountLocks>,
    ) -> Self {
        Self {
            store,
            reconciler,
            ledger,
            locks,
            pending_records: None,
        }
    }

    /// Persist every outgoing transaction until it is confirmed
    pub fn with_pending_records(mut self, records: Arc<PendingTxStore>) -> Self {
        self.pending_records = Some(records);
        self
    }

    pub fn store(&self) -> &Arc<NonceStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<AccountLocks> {
        &self.locks
    }

    /// Submit a transaction for `account`.
    ///
    /// `build` turns a sequence into signed transaction bytes; it runs once,
    /// or twice when the first attempt hits a sequence mismatch.
    /// `on_success` runs with the accepted sequence before the lock is released.
    pub async fn submit<B, S>(
        &self,
        account: &AccountId,
        mut build: B,
        on_success: S,
    ) -> Result<SubmissionOutcome, SubmissionError>
    where
        B: FnMut(Sequence) -> anyhow::Result<Bytes>,
        S: FnOnce(Sequence),
    {
        let correlation_id = CorrelationId::new();
        let span = info_span!(
            "submit",
            account = %account.short(),
            correlation_id = %correlation_id
        );

        async move {
            let _guard = self.locks.lock(account).await;
            let timer = Timer::new();
            metrics().submissions_total.inc();

            if self.reconciler.maybe_reconcile(account).await == Some(false) {
                debug!("Opportunistic reconciliation failed, continuing with local state");
            }

            let result = match self.attempt(account, &mut build).await {
                Ok(Attempt::Rejected(sequence, reason)) if reason.is_sequence_mismatch() => {
                    warn!(sequence, reason = %reason, "Sequence mismatch, resyncing and retrying once");
                    metrics().sequence_mismatch_retries.inc();
                    self.reconciler.reconcile(account).await;
                    self.attempt(account, &mut build).await.map(|a| (a, true))
                }
                other => other.map(|a| (a, false)),
            };

            timer.observe_duration(&metrics().submit_latency);

            match result {
                Ok((Attempt::Accepted(sequence), retried)) => {
                    metrics().submissions_accepted.inc();
                    info!(sequence, retried, "Transaction accepted");
                    on_success(sequence);
                    Ok(SubmissionOutcome::Accepted { sequence, retried })
                }
                Ok((Attempt::Rejected(sequence, reason), _)) => {
                    metrics().submissions_rejected.inc();
                    warn!(sequence, reason = %reason, "Transaction rejected");
                    Ok(SubmissionOutcome::Rejected { sequence, reason })
                }
                Err(e) => {
                    if matches!(e, SubmissionError::Transport { .. }) {
                        metrics().submission_transport_failures.inc();
                    }
                    warn!(error = %e, "Submission failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt<B>(&self, account: &AccountId, build: &mut B) -> Result<Attempt, SubmissionError>
    where
        B: FnMut(Sequence) -> anyhow::Result<Bytes>,
    {
        let sequence = self.store.allocate(account);

        let payload = match build(sequence) {
            Ok(payload) => payload,
            Err(e) => {
                self.store.release(account, sequence);
                return Err(SubmissionError::Build {
                    sequence,
                    message: format!("{:#}", e),
                });
            }
        };

        if let Some(records) = &self.pending_records {
            if let Err(e) = records.record(account, sequence, payload.clone()) {
                warn!(sequence, error = %e, "Failed to persist pending transaction");
            }
        }

        match self.ledger.submit(payload).await {
            Ok(SubmitOutcome::Accepted) => {
                self.store.confirm(account, sequence);
                self.store.set_current(account, sequence + 1);
                self.store.flush_or_warn();
                Ok(Attempt::Accepted(sequence))
            }
            Ok(SubmitOutcome::Rejected(reason)) => {
                self.store.release(account, sequence);
                if let Some(records) = &self.pending_records {
                    records.remove(account, sequence);
                }
                Ok(Attempt::Rejected(sequence, reason))
            }
            Err(source) => Err(SubmissionError::Transport { sequence, source }),
        }
    }
}
