#![cfg(feature = "test_utils")]

//! Session lifecycle through the public API: creation, stream-driven
//! confirmations, idle eviction and shutdown.

use gateway::nonce_manager::{DriftReconciler, MemoryBackend, NonceStore, PendingTxStore, ReconcilerConfig};
use gateway::session::{
    DerivedAccounts, RateLimitConfig, SessionConfig, SessionDeps, SessionError, SessionRegistry,
};
use gateway::streaming::{ConnectionConfig, ConnectionState, EndpointConfig, ReconnectPolicy};
use gateway::submission::AccountLocks;
use gateway::test_utils::{MockLedger, MockTransport};
use gateway::AccountId;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    registry: Arc<SessionRegistry>,
    transport: Arc<MockTransport>,
    store: Arc<NonceStore>,
    ledger: Arc<MockLedger>,
    records: Arc<PendingTxStore>,
}

fn harness(max_sessions: usize, points: u32) -> Harness {
    let store = Arc::new(NonceStore::new(Arc::new(MemoryBackend::new())));
    let ledger = Arc::new(MockLedger::new());
    let transport = Arc::new(MockTransport::new());
    let records = Arc::new(PendingTxStore::temporary().unwrap());
    let reconciler = Arc::new(
        DriftReconciler::new(store.clone(), ledger.clone(), ReconcilerConfig::default())
            .with_pending_records(records.clone()),
    );

    let config = SessionConfig {
        max_sessions_per_identity: max_sessions,
        rate_limit: RateLimitConfig {
            points,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(120),
        },
        idle_timeout: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(5),
        connection: ConnectionConfig {
            endpoints: EndpointConfig {
                primary_url: Some("http://ledger.local:8080".into()),
                fallback_port: Some(8090),
                ..Default::default()
            },
            reconnect: ReconnectPolicy::new(50, 500),
            stale_after: None,
        },
    };

    let registry = Arc::new(SessionRegistry::new(
        config,
        SessionDeps {
            transport: transport.clone(),
            store: store.clone(),
            reconciler,
            locks: Arc::new(AccountLocks::new()),
            initializer: Arc::new(DerivedAccounts::default()),
            pending_records: Some(records.clone()),
        },
    ));

    Harness {
        registry,
        transport,
        store,
        ledger,
        records,
    }
}

fn tx_event(account: &AccountId, sequence: u64) -> String {
    format!(
        r#"{{"type":"events","events":[{{"kind":"transaction","account":"{}","sequence":{}}}]}}"#,
        account, sequence
    )
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_confirmations_advance_session_account() {
    let gw = harness(2, 10);
    let account = DerivedAccounts::default().derive("carol");
    gw.ledger.set_sequence(&account, 20);

    let session = gw.registry.create("carol", "10.0.0.1").await.unwrap();
    assert!(session.connection().wait_for_state(ConnectionState::Connected, WAIT).await);
    assert_eq!(
        gw.transport.attempts()[0],
        format!("ws://ledger.local:8080/updates/account/{}", account)
    );
    assert_eq!(gw.store.peek(&account), 20);

    let first = gw.store.allocate(&account);
    let second = gw.store.allocate(&account);
    gw.records
        .record(&account, first, Bytes::from_static(b"tx-20"))
        .unwrap();
    gw.records
        .record(&account, second, Bytes::from_static(b"tx-21"))
        .unwrap();

    assert!(gw.transport.send(&tx_event(&account, 20)));
    settle().await;
    assert_eq!(gw.store.pending(&account), vec![21]);
    assert_eq!(gw.records.list(&account).len(), 1);

    // Other accounts' events are ignored
    let stranger = AccountId::new([0xEE; 32]);
    gw.transport.send(&tx_event(&stranger, 99));
    settle().await;
    assert_eq!(gw.store.peek(&account), 22);
    assert!(!gw.store.contains(&stranger));
}

#[tokio::test(start_paused = true)]
async fn test_limits_apply_per_identity_and_key() {
    let gw = harness(1, 2);

    gw.registry.create("dave", "k1").await.unwrap();
    let err = gw.registry.create("dave", "k1").await.unwrap_err();
    assert!(matches!(err, SessionError::CapacityExceeded { limit: 1, .. }));

    // Third charge against k1 trips the limiter even for a new identity
    let err = gw.registry.create("erin", "k1").await.unwrap_err();
    assert!(matches!(err, SessionError::RateLimitExceeded { .. }));
    assert!(!err.is_transient());

    gw.registry.create("erin", "k2").await.unwrap();
    assert_eq!(gw.registry.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_sessions_are_swept_in_background() {
    let gw = harness(3, 10);
    let evicted = Arc::new(AtomicUsize::new(0));
    let counter = evicted.clone();
    gw.registry.set_eviction_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let idle = gw.registry.create("frank", "k").await.unwrap();
    let busy = gw.registry.create("frank", "k").await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = gw.registry.clone().spawn_sweeper(shutdown_rx);

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(gw.registry.touch(&busy.id()));
    }

    assert!(gw.registry.get(&idle.id()).is_none());
    assert!(gw.registry.get(&busy.id()).is_some());
    assert_eq!(evicted.load(Ordering::SeqCst), 1);
    assert_eq!(idle.connection().state(), ConnectionState::Disconnected);

    shutdown_tx.send(true).unwrap();
    sweeper.await.unwrap();

    assert_eq!(gw.registry.destroy_all(), 1);
    assert!(gw.registry.is_empty());
    settle().await;
    assert_eq!(gw.transport.open_sockets(), 0);
}
