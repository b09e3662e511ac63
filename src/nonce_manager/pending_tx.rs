//! Persisted unconfirmed transactions
//!
//! One record per `(account, sequence)` so a transaction the ledger has not
//! yet executed survives a restart and can be resubmitted. Records leave the
//! store when:
//! - a confirmation event reports a transaction at or above their sequence,
//! - reconciliation finds the ledger already past them,
//! - a chain reset discards everything for the account,
//! - the resubmitter gives up on them.
//!
//! Keys are the 32 account bytes followed by the big-endian sequence, so a
//! prefix scan yields one account's records in sequence order.

use super::nonce_errors::{NonceError, NonceResult};
use crate::types::{AccountId, Sequence, ACCOUNT_ID_LEN};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

/// Unconfirmed transaction awaiting execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTxRecord {
    pub account: AccountId,
    pub sequence: Sequence,
    pub payload: Bytes,
    pub submitted_at: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    sequence: Sequence,
    payload: String,
    submitted_at: DateTime<Utc>,
    #[serde(default)]
    retry_count: u32,
}

fn record_key(account: &AccountId, sequence: Sequence) -> [u8; ACCOUNT_ID_LEN + 8] {
    let mut key = [0u8; ACCOUNT_ID_LEN + 8];
    key[..ACCOUNT_ID_LEN].copy_from_slice(account.as_bytes());
    key[ACCOUNT_ID_LEN..].copy_from_slice(&sequence.to_be_bytes());
    key
}

fn split_key(key: &[u8]) -> Option<(AccountId, Sequence)> {
    if key.len() != ACCOUNT_ID_LEN + 8 {
        return None;
    }
    let account = AccountId::from_slice(&key[..ACCOUNT_ID_LEN]).ok()?;
    let sequence = Sequence::from_be_bytes(key[ACCOUNT_ID_LEN..].try_into().ok()?);
    Some((account, sequence))
}

fn decode_record(key: &[u8], value: &[u8]) -> NonceResult<PendingTxRecord> {
    let corrupt = |reason: String| NonceError::CorruptRecord {
        key: hex::encode(key),
        reason,
    };

    let (account, sequence) = split_key(key).ok_or_else(|| corrupt("bad key".to_string()))?;
    let stored: StoredRecord =
        serde_json::from_slice(value).map_err(|e| corrupt(e.to_string()))?;
    if stored.sequence != sequence {
        return Err(corrupt(format!(
            "sequence {} does not match key {}",
            stored.sequence, sequence
        )));
    }
    let payload = BASE64
        .decode(stored.payload.as_bytes())
        .map_err(|e| corrupt(e.to_string()))?;

    Ok(PendingTxRecord {
        account,
        sequence,
        payload: Bytes::from(payload),
        submitted_at: stored.submitted_at,
        retry_count: stored.retry_count,
    })
}

fn encode_record(record: &PendingTxRecord) -> NonceResult<Vec<u8>> {
    let stored = StoredRecord {
        sequence: record.sequence,
        payload: BASE64.encode(&record.payload),
        submitted_at: record.submitted_at,
        retry_count: record.retry_count,
    };
    Ok(serde_json::to_vec(&stored)?)
}

/// `sled`-backed store of unconfirmed transactions
#[derive(Debug, Clone)]
pub struct PendingTxStore {
    tree: sled::Tree,
}

impl PendingTxStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> NonceResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(&db)
    }

    /// Throwaway database, removed on drop
    pub fn temporary() -> NonceResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(&db)
    }

    fn from_db(db: &sled::Db) -> NonceResult<Self> {
        Ok(Self {
            tree: db.open_tree("pending_transactions")?,
        })
    }

    /// Persist a transaction about to be sent
    pub fn record(&self, account: &AccountId, sequence: Sequence, payload: Bytes) -> NonceResult<()> {
        let record = PendingTxRecord {
            account: *account,
            sequence,
            payload,
            submitted_at: Utc::now(),
            retry_count: 0,
        };
        self.put(&record)
    }

    fn put(&self, record: &PendingTxRecord) -> NonceResult<()> {
        let value = encode_record(record)?;
        self.tree
            .insert(record_key(&record.account, record.sequence), value)?;
        self.tree.flush()?;
        Ok(())
    }

    pub fn get(&self, account: &AccountId, sequence: Sequence) -> Option<PendingTxRecord> {
        let key = record_key(account, sequence);
        match self.tree.get(key) {
            Ok(Some(value)) => match decode_record(&key, &value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Dropping corrupt pending transaction");
                    self.remove_key(&key);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Pending transaction lookup failed");
                None
            }
        }
    }

    fn remove_key(&self, key: &[u8]) -> bool {
        match self.tree.remove(key) {
            Ok(previous) => previous.is_some(),
            Err(e) => {
                warn!(error = %e, "Failed to remove pending transaction");
                false
            }
        }
    }

    pub fn remove(&self, account: &AccountId, sequence: Sequence) -> bool {
        self.remove_key(&record_key(account, sequence))
    }

    /// Remove every record for `account` with sequence `<= sequence`
    pub fn confirm_through(&self, account: &AccountId, sequence: Sequence) -> usize {
        let start = record_key(account, 0);
        let end = record_key(account, sequence);
        let keys: Vec<sled::IVec> = self
            .tree
            .range(start..=end)
            .keys()
            .filter_map(Result::ok)
            .collect();

        let removed = keys.iter().filter(|k| self.remove_key(k)).count();
        if removed > 0 {
            debug!(account = %account.short(), through = sequence, removed, "Confirmed pending transactions");
        }
        removed
    }

    /// Drop every record for `account`
    pub fn clear_account(&self, account: &AccountId) -> usize {
        let keys: Vec<sled::IVec> = self
            .tree
            .scan_prefix(account.as_bytes())
            .keys()
            .filter_map(Result::ok)
            .collect();
        keys.iter().filter(|k| self.remove_key(k)).count()
    }

    /// Records for `account` in sequence order. Corrupt records are dropped.
    pub fn list(&self, account: &AccountId) -> Vec<PendingTxRecord> {
        let mut records = Vec::new();
        for item in self.tree.scan_prefix(account.as_bytes()) {
            let (key, value) = match item {
                Ok(kv) => kv,
                Err(e) => {
                    warn!(error = %e, "Pending transaction scan failed");
                    break;
                }
            };
            match decode_record(&key, &value) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(error = %e, "Dropping corrupt pending transaction");
                    self.remove_key(&key);
                }
            }
        }
        records
    }

    /// Accounts with at least one record
    pub fn accounts(&self) -> Vec<AccountId> {
        let accounts: BTreeSet<AccountId> = self
            .tree
            .iter()
            .keys()
            .filter_map(Result::ok)
            .filter_map(|k| split_key(&k).map(|(account, _)| account))
            .collect();
        accounts.into_iter().collect()
    }

    /// Increment a record's retry counter, returning the new value
    pub fn bump_retry(&self, account: &AccountId, sequence: Sequence) -> Option<u32> {
        let mut record = self.get(account, sequence)?;
        record.retry_count = record.retry_count.saturating_add(1);
        record.submitted_at = Utc::now();
        match self.put(&record) {
            Ok(()) => Some(record.retry_count),
            Err(e) => {
                warn!(error = %e, "Failed to update pending transaction");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &[u8], value: &[u8]) {
        let _ = self.tree.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(byte: u8) -> AccountId {
        AccountId::new([byte; 32])
    }

    #[test]
    fn test_record_list_in_sequence_order() {
        let store = PendingTxStore::temporary().unwrap();
        let a = account(1);
        store.record(&a, 5, Bytes::from_static(b"five")).unwrap();
        store.record(&a, 3, Bytes::from_static(b"three")).unwrap();
        store.record(&account(2), 1, Bytes::from_static(b"other")).unwrap();

        let records = store.list(&a);
        assert_eq!(
            records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            vec![3, 5]
        );
        assert_eq!(records[0].payload, Bytes::from_static(b"three"));
        assert_eq!(records[0].retry_count, 0);
        assert_eq!(store.accounts(), vec![a, account(2)]);
    }

    #[test]
    fn test_confirm_through_and_clear() {
        let store = PendingTxStore::temporary().unwrap();
        let a = account(3);
        for seq in 0..5 {
            store.record(&a, seq, Bytes::from(vec![seq as u8])).unwrap();
        }

        assert_eq!(store.confirm_through(&a, 2), 3);
        assert_eq!(store.confirm_through(&a, 2), 0);
        assert_eq!(store.list(&a).len(), 2);

        assert_eq!(store.clear_account(&a), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_bump_retry_persists() {
        let store = PendingTxStore::temporary().unwrap();
        let a = account(4);
        store.record(&a, 9, Bytes::from_static(b"tx")).unwrap();

        assert_eq!(store.bump_retry(&a, 9), Some(1));
        assert_eq!(store.bump_retry(&a, 9), Some(2));
        assert_eq!(store.get(&a, 9).unwrap().retry_count, 2);
        assert_eq!(store.bump_retry(&a, 10), None);
    }

    #[test]
    fn test_corrupt_record_is_discarded_not_the_store() {
        let store = PendingTxStore::temporary().unwrap();
        let a = account(5);
        store.record(&a, 1, Bytes::from_static(b"good")).unwrap();
        store.insert_raw(&record_key(&a, 2), b"{ not json");

        let records = store.list(&a);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reopen_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending");
        {
            let store = PendingTxStore::open(&path).unwrap();
            store.record(&account(6), 0, Bytes::from_static(b"keep")).unwrap();
        }
        let reopened = PendingTxStore::open(&path).unwrap();
        assert_eq!(reopened.list(&account(6)).len(), 1);
    }
}
