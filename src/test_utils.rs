//! Test Utilities Module
//!
//! Scripted stand-ins for the ledger and the event stream transport so
//! submission, reconciliation and connection behaviour can be tested
//! deterministically without network access.
//!
//! These utilities are only compiled when running tests or when the
//! `test_utils` feature is enabled.

#![cfg(any(test, feature = "test_utils"))]

use crate::ledger::{Ledger, LedgerAccount, LedgerError, SubmitOutcome};
use crate::streaming::{EventSocket, EventTransport, StreamError};
use crate::types::{AccountId, Sequence};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Default)]
struct MockLedgerState {
    outcomes: VecDeque<Result<SubmitOutcome, LedgerError>>,
    accounts: HashMap<AccountId, LedgerAccount>,
    submissions: Vec<Bytes>,
    fail_fetches: bool,
    latency: Option<Duration>,
}

/// Mock Ledger for testing
///
/// Submissions are accepted unless an outcome was scripted with
/// [`MockLedger::push_outcome`] or [`MockLedger::push_error`]; scripted
/// outcomes are consumed in order.
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<MockLedgerState>,
    account_fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the verdict of the next unscripted submission
    pub fn push_outcome(&self, outcome: SubmitOutcome) {
        self.state.lock().outcomes.push_back(Ok(outcome));
    }

    /// Script a transport failure for the next unscripted submission
    pub fn push_error(&self, error: LedgerError) {
        self.state.lock().outcomes.push_back(Err(error));
    }

    pub fn set_sequence(&self, account: &AccountId, sequence: Sequence) {
        self.state
            .lock()
            .accounts
            .entry(*account)
            .or_default()
            .sequence = sequence;
    }

    /// Make `get_account` fail with a transport error
    pub fn fail_account_fetches(&self, fail: bool) {
        self.state.lock().fail_fetches = fail;
    }

    /// Delay every submission by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    pub fn account_fetches(&self) -> usize {
        self.account_fetches.load(Ordering::SeqCst)
    }

    /// Payloads in the order they were submitted
    pub fn submissions(&self) -> Vec<Bytes> {
        self.state.lock().submissions.clone()
    }

    /// Highest number of submissions observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn submit(&self, payload: Bytes) -> Result<SubmitOutcome, LedgerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let (scripted, latency) = {
            let mut state = self.state.lock();
            state.submissions.push(payload);
            (state.outcomes.pop_front(), state.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        scripted.unwrap_or(Ok(SubmitOutcome::Accepted))
    }

    async fn get_account(&self, account: &AccountId) -> Result<Option<LedgerAccount>, LedgerError> {
        self.account_fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if state.fail_fetches {
            return Err(LedgerError::Transport {
                endpoint: "mock".to_string(),
                message: "account fetch disabled".to_string(),
            });
        }
        Ok(state.accounts.get(account).cloned())
    }
}

#[derive(Default)]
struct MockTransportState {
    attempts: Vec<(String, Instant)>,
    failing: HashSet<String>,
    fail_all: bool,
    peers: Vec<mpsc::UnboundedSender<String>>,
}

/// Mock EventTransport for testing
///
/// Every successful connect opens a channel-backed socket; the newest one
/// receives frames pushed with [`MockTransport::send`].
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections to `url`
    pub fn fail_url(&self, url: &str) {
        self.state.lock().failing.insert(url.to_string());
    }

    /// Refuse every connection
    pub fn fail_all(&self, fail: bool) {
        self.state.lock().fail_all = fail;
    }

    /// URLs of every connect call, in order
    pub fn attempts(&self) -> Vec<String> {
        self.state
            .lock()
            .attempts
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// When each connect call happened
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.state.lock().attempts.iter().map(|(_, at)| *at).collect()
    }

    /// Deliver a text frame to the newest open socket
    pub fn send(&self, text: &str) -> bool {
        let state = self.state.lock();
        state
            .peers
            .iter()
            .rev()
            .find(|peer| !peer.is_closed())
            .map(|peer| peer.send(text.to_string()).is_ok())
            .unwrap_or(false)
    }

    /// Close the newest socket from the server side
    pub fn close_current(&self) {
        let mut state = self.state.lock();
        state.peers.retain(|peer| !peer.is_closed());
        state.peers.pop();
    }

    /// Sockets the client has not closed yet
    pub fn open_sockets(&self) -> usize {
        self.state
            .lock()
            .peers
            .iter()
            .filter(|peer| !peer.is_closed())
            .count()
    }
}

#[async_trait]
impl EventTransport for MockTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn EventSocket>, StreamError> {
        let mut state = self.state.lock();
        state.attempts.push((url.to_string(), Instant::now()));
        if state.fail_all || state.failing.contains(url) {
            return Err(StreamError::Connect {
                url: url.to_string(),
                message: "connection refused".to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.peers.push(tx);
        Ok(Box::new(MockSocket { rx, closed: false }))
    }
}

struct MockSocket {
    rx: mpsc::UnboundedReceiver<String>,
    closed: bool,
}

#[async_trait]
impl EventSocket for MockSocket {
    async fn next_message(&mut self) -> Option<Result<String, StreamError>> {
        if self.closed {
            return None;
        }
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed = true;
        self.rx.close();
    }
}
