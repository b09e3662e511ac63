//! Per-account serialization under a multi-threaded runtime

use super::test_helpers::{account, decode_payload, memory_store, payload, stack};
use futures::future::join_all;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_account_submissions_never_overlap() {
    const SUBMISSIONS: usize = 16;

    let a = account(0xC1);
    let s = stack(memory_store());
    s.ledger.set_sequence(&a, 0);
    s.ledger.set_latency(Duration::from_millis(5));

    let handles: Vec<_> = (0..SUBMISSIONS)
        .map(|_| {
            let coordinator = s.coordinator.clone();
            tokio::spawn(async move { coordinator.submit(&a, payload, |_| {}).await })
        })
        .collect();

    let results = timeout(TIMEOUT, join_all(handles))
        .await
        .expect("submissions deadlocked");

    let sequences: HashSet<u64> = results
        .into_iter()
        .map(|r| r.unwrap().unwrap().sequence())
        .collect();
    assert_eq!(sequences, (0..SUBMISSIONS as u64).collect());

    assert_eq!(s.ledger.max_in_flight(), 1);
    assert_eq!(s.store.peek(&a), SUBMISSIONS as u64);
    assert!(s.store.pending(&a).is_empty());

    // Wire order matches allocation order
    let sent: Vec<u64> = s.ledger.submissions().iter().map(decode_payload).collect();
    let mut sorted = sent.clone();
    sorted.sort_unstable();
    assert_eq!(sent, sorted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_accounts_submit_concurrently() {
    const ACCOUNTS: u8 = 8;

    let s = stack(memory_store());
    s.ledger.set_latency(Duration::from_millis(200));

    let handles: Vec<_> = (0..ACCOUNTS)
        .map(|i| {
            let coordinator = s.coordinator.clone();
            let a = account(0xD0 + i);
            tokio::spawn(async move { coordinator.submit(&a, payload, |_| {}).await })
        })
        .collect();

    let results = timeout(TIMEOUT, join_all(handles))
        .await
        .expect("submissions deadlocked");
    for result in results {
        assert!(result.unwrap().unwrap().is_accepted());
    }

    assert!(s.ledger.max_in_flight() > 1);
    for i in 0..ACCOUNTS {
        assert_eq!(s.store.peek(&account(0xD0 + i)), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_locks_are_released_after_each_submission() {
    let s = stack(memory_store());
    let a = account(0xC2);

    for expected in 0..3u64 {
        let outcome = s.coordinator.submit(&a, payload, |_| {}).await.unwrap();
        assert_eq!(outcome.sequence(), expected);
        assert!(!s.locks.is_locked(&a));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_form_contiguous_series() {
    const ALLOCATIONS: u64 = 500;

    let s = stack(memory_store());
    let a = account(0xC3);
    s.store.set_current(&a, 40);

    let handles: Vec<_> = (0..ALLOCATIONS)
        .map(|_| {
            let store = s.store.clone();
            tokio::spawn(async move { store.allocate(&a) })
        })
        .collect();

    let mut sequences: Vec<u64> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    sequences.sort_unstable();

    assert_eq!(sequences, (40..40 + ALLOCATIONS).collect::<Vec<_>>());
    assert_eq!(s.store.peek(&a), 40 + ALLOCATIONS);
    assert_eq!(s.store.pending(&a).len(), ALLOCATIONS as usize);
}
