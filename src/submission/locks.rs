//! Per-account exclusive submission tokens
//!
//! tokio's `Mutex` queues waiters in FIFO order, so a second submitter for the
//! same account parks behind the first and resumes once its guard drops.
//! Accounts never contend with each other.

use crate::types::AccountId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct AccountLocks {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `account`. Released when the guard drops.
    pub async fn lock(&self, account: &AccountId) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(*account).or_default().clone();
        mutex.lock_owned().await
    }

    /// Non-waiting variant
    pub fn try_lock(&self, account: &AccountId) -> Option<OwnedMutexGuard<()>> {
        let mutex = self.locks.entry(*account).or_default().clone();
        mutex.try_lock_owned().ok()
    }

    pub fn is_locked(&self, account: &AccountId) -> bool {
        self.locks
            .get(account)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Forget an account's token if nobody holds or waits on it
    pub fn prune(&self, account: &AccountId) -> bool {
        self.locks
            .remove_if(account, |_, mutex| Arc::strong_count(mutex) == 1)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn account(byte: u8) -> AccountId {
        AccountId::new([byte; 32])
    }

    #[tokio::test]
    async fn test_same_account_serializes() {
        let locks = Arc::new(AccountLocks::new());
        let guard = locks.lock(&account(1)).await;
        assert!(locks.is_locked(&account(1)));
        assert!(locks.try_lock(&account(1)).is_none());

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&account(1)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resume")
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_accounts_do_not_contend() {
        let locks = AccountLocks::new();
        let _a = locks.lock(&account(1)).await;
        assert!(locks.try_lock(&account(2)).is_some());
    }

    #[tokio::test]
    async fn test_prune_only_idle_tokens() {
        let locks = AccountLocks::new();
        let guard = locks.lock(&account(3)).await;
        assert!(!locks.prune(&account(3)));
        drop(guard);
        assert!(locks.prune(&account(3)));
        assert!(locks.is_empty());
    }
}
