//! Store persistence through the file backend

use super::test_helpers::account;
use crate::nonce_manager::{FileBackend, NonceStore};
use std::sync::Arc;

const FILE_NAME: &str = "nonces.json";

#[test]
fn test_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = (account(0x0A), account(0x0B));

    let store = NonceStore::open(Arc::new(FileBackend::new(dir.path(), FILE_NAME)));
    store.set_current(&a, 7);
    store.set_current(&b, 0);
    store.flush().unwrap();

    let reopened = NonceStore::open(Arc::new(FileBackend::new(dir.path(), FILE_NAME)));
    assert_eq!(reopened.snapshot(), store.snapshot());
    assert_eq!(reopened.peek(&a), 7);
    assert!(reopened.contains(&b));
    assert_eq!(reopened.peek(&b), 0);
}

#[test]
fn test_empty_store_round_trips() {
    let dir = tempfile::tempdir().unwrap();

    let store = NonceStore::open(Arc::new(FileBackend::new(dir.path(), FILE_NAME)));
    store.flush().unwrap();

    let reopened = NonceStore::open(Arc::new(FileBackend::new(dir.path(), FILE_NAME)));
    assert!(reopened.is_empty());
}

#[test]
fn test_pending_sequences_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let a = account(0x0C);

    let store = NonceStore::open(Arc::new(FileBackend::new(dir.path(), FILE_NAME)));
    store.set_current(&a, 3);
    store.allocate(&a);
    store.allocate(&a);
    store.flush().unwrap();

    let reopened = NonceStore::open(Arc::new(FileBackend::new(dir.path(), FILE_NAME)));
    assert_eq!(reopened.peek(&a), 5);
    assert!(reopened.pending(&a).is_empty());
}

#[test]
fn test_corrupt_records_are_skipped_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let a = account(0x0D);
    let document = format!(
        r#"{{"{}": "12", "not-an-account": "3", "{}": "abc"}}"#,
        a,
        account(0x0E)
    );
    std::fs::write(dir.path().join(FILE_NAME), document).unwrap();

    let store = NonceStore::open(Arc::new(FileBackend::new(dir.path(), FILE_NAME)));
    assert_eq!(store.len(), 1);
    assert_eq!(store.peek(&a), 12);
}
