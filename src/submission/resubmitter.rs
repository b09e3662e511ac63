//! Background resubmission of unconfirmed transactions
//!
//! Every `interval`, each account's persisted records are resent in
//! sequence order while holding that account's submission lock, so the
//! resubmitter never interleaves with a live `submit`.

use super::locks::AccountLocks;
use crate::ledger::{Ledger, SubmitOutcome};
use crate::metrics::metrics;
use crate::nonce_manager::{PendingTxRecord, PendingTxStore};
use crate::types::AccountId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Floor applied to `ResubmitConfig::interval`; tokio rejects a zero period
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct ResubmitConfig {
    pub interval: Duration,
    /// Records resent this many times are abandoned
    pub max_retries: u32,
}

impl Default for ResubmitConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            max_retries: 20,
        }
    }
}

/// Counters for one pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResubmitStats {
    pub resent: usize,
    pub confirmed: usize,
    pub dropped: usize,
    pub failed: usize,
}

pub struct Resubmitter {
    records: Arc<PendingTxStore>,
    ledger: Arc<dyn Ledger>,
    locks: Arc<AccountLocks>,
    config: ResubmitConfig,
}

impl Resubmitter {
    pub fn new(
        records: Arc<PendingTxStore>,
        ledger: Arc<dyn Ledger>,
        locks: Arc<AccountLocks>,
        config: ResubmitConfig,
    ) -> Self {
        Self {
            records,
            ledger,
            locks,
            config,
        }
    }

    /// One pass over every account with pending records
    pub async fn run_once(&self) -> ResubmitStats {
        let mut stats = ResubmitStats::default();
        for account in self.records.accounts() {
            let _guard = self.locks.lock(&account).await;
            self.resend_account(&account, &mut stats).await;
        }
        if stats != ResubmitStats::default() {
            debug!(?stats, "Resubmission pass complete");
        }
        stats
    }

    async fn resend_account(&self, account: &AccountId, stats: &mut ResubmitStats) {
        for record in self.records.list(account) {
            // A mismatch earlier in this pass may have confirmed later records
            if self.records.get(account, record.sequence).is_none() {
                continue;
            }
            if record.retry_count >= self.config.max_retries {
                warn!(
                    account = %account.short(),
                    sequence = record.sequence,
                    retries = record.retry_count,
                    "Abandoning pending transaction"
                );
                self.records.remove(account, record.sequence);
                metrics().resubmissions_dropped.inc();
                stats.dropped += 1;
                continue;
            }

            metrics().resubmissions.inc();
            stats.resent += 1;
            match self.ledger.submit(record.payload.clone()).await {
                Ok(SubmitOutcome::Accepted) => {
                    // Stays until a stream event or reconciliation confirms execution
                    self.records.bump_retry(account, record.sequence);
                }
                Ok(SubmitOutcome::Rejected(reason)) if reason.is_sequence_mismatch() => {
                    stats.confirmed += self.settle_mismatch(account, &record).await;
                }
                Ok(SubmitOutcome::Rejected(reason)) => {
                    warn!(
                        account = %account.short(),
                        sequence = record.sequence,
                        reason = %reason,
                        "Pending transaction rejected, dropping"
                    );
                    self.records.remove(account, record.sequence);
                    stats.dropped += 1;
                }
                Err(e) => {
                    debug!(account = %account.short(), error = %e, "Resubmission transport failure");
                    self.records.bump_retry(account, record.sequence);
                    stats.failed += 1;
                    return;
                }
            }
        }
    }

    /// Ledger already past this sequence means it executed
    async fn settle_mismatch(&self, account: &AccountId, record: &PendingTxRecord) -> usize {
        match self.ledger.get_account(account).await {
            Ok(Some(state)) if state.sequence > record.sequence => {
                let confirmed = self.records.confirm_through(account, state.sequence - 1);
                info!(
                    account = %account.short(),
                    ledger = state.sequence,
                    confirmed,
                    "Pending transactions already executed"
                );
                confirmed
            }
            Ok(_) => {
                self.records.bump_retry(account, record.sequence);
                0
            }
            Err(e) => {
                debug!(account = %account.short(), error = %e, "Ledger lookup failed during resubmission");
                self.records.bump_retry(account, record.sequence);
                0
            }
        }
    }

    /// Run passes every `interval` until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Resubmitter stopping");
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerError, RejectReason};
    use crate::test_utils::MockLedger;
    use bytes::Bytes;

    fn account() -> AccountId {
        AccountId::new([0x21; 32])
    }

    fn setup(max_retries: u32) -> (Arc<PendingTxStore>, Arc<MockLedger>, Resubmitter) {
        let records = Arc::new(PendingTxStore::temporary().unwrap());
        let ledger = Arc::new(MockLedger::new());
        let resubmitter = Resubmitter::new(
            records.clone(),
            ledger.clone(),
            Arc::new(AccountLocks::new()),
            ResubmitConfig {
                interval: Duration::from_millis(10),
                max_retries,
            },
        );
        (records, ledger, resubmitter)
    }

    #[tokio::test]
    async fn test_resends_in_sequence_order() {
        let (records, ledger, resubmitter) = setup(5);
        records.record(&account(), 2, Bytes::from_static(b"two")).unwrap();
        records.record(&account(), 1, Bytes::from_static(b"one")).unwrap();

        let stats = resubmitter.run_once().await;
        assert_eq!(stats.resent, 2);
        assert_eq!(
            ledger.submissions(),
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
        assert_eq!(records.get(&account(), 1).unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_mismatch_with_ledger_ahead_confirms() {
        let (records, ledger, resubmitter) = setup(5);
        records.record(&account(), 3, Bytes::from_static(b"three")).unwrap();
        records.record(&account(), 4, Bytes::from_static(b"four")).unwrap();
        ledger.set_sequence(&account(), 5);
        ledger.push_outcome(SubmitOutcome::Rejected(RejectReason::SequenceMismatch(
            "nonce too low".into(),
        )));

        let stats = resubmitter.run_once().await;
        assert_eq!(stats.confirmed, 2);
        assert!(records.is_empty());
        assert_eq!(ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_other_rejection_drops_record() {
        let (records, ledger, resubmitter) = setup(5);
        records.record(&account(), 0, Bytes::from_static(b"bad")).unwrap();
        ledger.push_outcome(SubmitOutcome::Rejected(RejectReason::Other("malformed".into())));

        let stats = resubmitter.run_once().await;
        assert_eq!(stats.dropped, 1);
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_stops_account_for_pass() {
        let (records, ledger, resubmitter) = setup(5);
        records.record(&account(), 0, Bytes::from_static(b"a")).unwrap();
        records.record(&account(), 1, Bytes::from_static(b"b")).unwrap();
        ledger.push_error(LedgerError::Transport {
            endpoint: "mock".into(),
            message: "down".into(),
        });

        let stats = resubmitter.run_once().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(ledger.submissions().len(), 1);
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_abandons_after_max_retries() {
        let (records, _ledger, resubmitter) = setup(2);
        records.record(&account(), 0, Bytes::from_static(b"a")).unwrap();

        resubmitter.run_once().await;
        resubmitter.run_once().await;
        let stats = resubmitter.run_once().await;
        assert_eq!(stats.dropped, 1);
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let (_records, _ledger, resubmitter) = setup(2);
        let (tx, rx) = watch::channel(false);
        let handle = Arc::new(resubmitter).spawn(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_floored_instead_of_panicking() {
        let records = Arc::new(PendingTxStore::temporary().unwrap());
        let ledger = Arc::new(MockLedger::new());
        ledger.set_sequence(&account(), 1);
        ledger.push_outcome(SubmitOutcome::Rejected(RejectReason::SequenceMismatch(
            "nonce too low".into(),
        )));
        records.record(&account(), 0, Bytes::from_static(b"a")).unwrap();

        let resubmitter = Resubmitter::new(
            records.clone(),
            ledger,
            Arc::new(AccountLocks::new()),
            ResubmitConfig {
                interval: Duration::ZERO,
                max_retries: 5,
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = Arc::new(resubmitter).spawn(rx);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(records.is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
