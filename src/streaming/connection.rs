//! Event stream connection lifecycle
//!
//! ```text
//! Disconnected --connect--> Connecting --socket open--> Connected
//!      ^                        |                          |
//!      |                        | all endpoints failed     | closed / error / stale
//!      |                        v                          v
//!      +------ backoff ---- Disconnected <-----------------+
//! ```
//!
//! `disconnect()` is terminal until the next `connect()`: it cancels the
//! reconnect timer, stops the reader and closes the socket. It is synchronous
//! and idempotent so teardown paths can call it unconditionally.

use super::backoff::ReconnectPolicy;
use super::endpoints::EndpointConfig;
use super::events::{HandlerRegistry, StreamMessage, StreamUpdate, Subscription};
use super::transport::{EventSocket, EventTransport};
use super::StreamError;
use crate::metrics::metrics;
use crate::nonce_manager::{NonceStore, PendingTxStore};
use crate::types::{AccountId, EventFilter};
use nonempty::NonEmpty;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    pub endpoints: EndpointConfig,
    pub reconnect: ReconnectPolicy,
    /// Drop the socket when nothing arrives for this long
    pub stale_after: Option<Duration>,
}

/// Counters and timestamps for the current subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Consecutive failed or dropped connections since the last successful open
    pub reconnect_attempts: u32,
    pub last_message_at: Option<Instant>,
    pub last_open_at: Option<Instant>,
    pub last_close_at: Option<Instant>,
}

/// Where confirmed sequences for the tracked account are reported
#[derive(Debug, Clone)]
struct NonceFeedback {
    account: AccountId,
    store: Arc<NonceStore>,
    records: Option<Arc<PendingTxStore>>,
}

impl NonceFeedback {
    fn apply(&self, event: &super::LedgerEvent) -> bool {
        let Some(sequence) = event.transaction_sequence_for(&self.account) else {
            return false;
        };
        self.store.confirm(&self.account, sequence);
        let advanced = self.store.set_current(&self.account, sequence.saturating_add(1));
        if let Some(records) = &self.records {
            records.confirm_through(&self.account, sequence);
        }
        metrics().stream_confirmations.inc();
        debug!(account = %self.account.short(), sequence, advanced, "Sequence confirmed by stream");
        advanced
    }
}

struct Shared {
    config: ConnectionConfig,
    transport: Arc<dyn EventTransport>,
    handlers: HandlerRegistry,
    feedback: OnceCell<NonceFeedback>,
    view: AtomicU64,
    /// Bumped on every connect/disconnect; a reader task only reports state
    /// while its generation is current.
    generation: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    stats: Mutex<ConnectionStats>,
}

#[derive(Default)]
struct Control {
    filter: Option<EventFilter>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// Resolves once `shutdown` is set or its sender is gone
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

impl Shared {
    fn set_state(&self, generation: u64, state: ConnectionState) {
        if self.generation.load(Ordering::Acquire) == generation {
            self.state_tx.send_replace(state);
        }
    }

    async fn open(&self, urls: &NonEmpty<String>) -> Option<Box<dyn EventSocket>> {
        for url in urls.iter() {
            match self.transport.connect(url).await {
                Ok(socket) => {
                    info!(url = %url, "Event stream connected");
                    return Some(socket);
                }
                Err(e) => warn!(url = %url, error = %e, "Event stream endpoint failed"),
            }
        }
        None
    }

    fn handle_text(&self, text: &str) {
        let message = match StreamMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable stream message");
                return;
            }
        };

        match message {
            StreamMessage::Head { view } => {
                let previous = self.view.fetch_max(view, Ordering::AcqRel);
                if view > previous {
                    self.handlers.dispatch(&StreamUpdate::Head { view });
                } else {
                    debug!(view, current = previous, "Ignoring stale head update");
                }
            }
            StreamMessage::Events { events } => {
                let mut advanced = false;
                for event in events {
                    metrics().stream_events.inc();
                    if let Some(feedback) = self.feedback.get() {
                        advanced |= feedback.apply(&event);
                    }
                    self.handlers.dispatch(&StreamUpdate::Event(event));
                }
                if advanced {
                    if let Some(feedback) = self.feedback.get() {
                        feedback.store.flush_or_warn();
                    }
                }
            }
        }
    }

    /// Read until the socket ends. `true` when stopped by `disconnect()`.
    async fn pump(
        &self,
        socket: &mut dyn EventSocket,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            let message = match self.config.stale_after {
                Some(limit) => tokio::select! {
                    biased;
                    _ = cancelled(shutdown) => return true,
                    next = tokio::time::timeout(limit, socket.next_message()) => match next {
                        Ok(message) => message,
                        Err(_) => {
                            warn!(stale_ms = limit.as_millis() as u64, "Event stream silent, dropping connection");
                            metrics().stream_stale.inc();
                            return false;
                        }
                    },
                },
                None => tokio::select! {
                    biased;
                    _ = cancelled(shutdown) => return true,
                    message = socket.next_message() => message,
                },
            };

            match message {
                Some(Ok(text)) => {
                    self.stats.lock().last_message_at = Some(Instant::now());
                    self.handle_text(&text)
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Event stream failed");
                    return false;
                }
                None => {
                    info!("Event stream closed by peer");
                    return false;
                }
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        urls: NonEmpty<String>,
        generation: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(generation, ConnectionState::Connecting);
            let opened = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => return,
                socket = self.open(&urls) => socket,
            };

            if let Some(mut socket) = opened {
                attempt = 0;
                {
                    let mut stats = self.stats.lock();
                    stats.reconnect_attempts = 0;
                    stats.last_open_at = Some(Instant::now());
                }
                self.set_state(generation, ConnectionState::Connected);
                metrics().stream_connections.inc();
                let stopped = self.pump(socket.as_mut(), &mut shutdown).await;
                socket.close().await;
                self.stats.lock().last_close_at = Some(Instant::now());
                metrics().stream_connections.dec();
                if stopped {
                    return;
                }
            }

            self.set_state(generation, ConnectionState::Disconnected);
            let delay = self.config.reconnect.next_delay(attempt);
            attempt = attempt.saturating_add(1);
            self.stats.lock().reconnect_attempts = attempt;
            metrics().stream_reconnects.inc();
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt,
                "Scheduling event stream reconnect"
            );

            tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// One session's connection to the ledger event stream
pub struct ConnectionManager {
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("filter", &self.filter())
            .field("view", &self.view())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn EventTransport>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                handlers: HandlerRegistry::new(),
                feedback: OnceCell::new(),
                view: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                state_tx,
                stats: Mutex::new(ConnectionStats::default()),
            }),
            control: Mutex::new(Control::default()),
        }
    }

    /// Feed transaction events for `account` back into `store`
    pub fn with_nonce_feedback(
        self,
        account: AccountId,
        store: Arc<NonceStore>,
        records: Option<Arc<PendingTxStore>>,
    ) -> Self {
        let feedback = NonceFeedback {
            account,
            store,
            records,
        };
        if self.shared.feedback.set(feedback).is_err() {
            warn!("Nonce feedback already attached");
        }
        self
    }

    /// Start streaming `filter`, replacing any current subscription
    pub fn connect(&self, filter: EventFilter) -> Result<(), StreamError> {
        let urls = self.shared.config.endpoints.urls_for(&filter)?;

        let mut control = self.control.lock();
        self.stop(&mut control);

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.shared.clone().run(urls, generation, shutdown_rx));

        debug!(filter = ?filter, generation, "Event stream starting");
        control.filter = Some(filter);
        control.shutdown = Some(shutdown_tx);
        control.task = Some(task);
        Ok(())
    }

    /// Resubscribe with a different filter. No-op when unchanged and running.
    pub fn switch_filter(&self, filter: EventFilter) -> Result<(), StreamError> {
        {
            let control = self.control.lock();
            if control.filter == Some(filter) && control.shutdown.is_some() {
                return Ok(());
            }
        }
        info!(filter = ?filter, "Switching event stream filter");
        self.connect(filter)
    }

    /// Stop streaming. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let mut control = self.control.lock();
        self.stop(&mut control);
    }

    fn stop(&self, control: &mut Control) {
        // Detach the running task before signalling it
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(shutdown) = control.shutdown.take() {
            let _ = shutdown.send(true);
            debug!("Event stream stopping");
        }
        // The task closes its socket and exits on its own
        control.task.take();
        control.filter = None;
        self.shared
            .state_tx
            .send_replace(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn stats(&self) -> ConnectionStats {
        *self.shared.stats.lock()
    }

    /// Wait until the connection reaches `target`
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut rx = self.shared.state_tx.subscribe();
        tokio::time::timeout(limit, rx.wait_for(|state| *state == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn filter(&self) -> Option<EventFilter> {
        self.control.lock().filter
    }

    /// Highest head view seen
    pub fn view(&self) -> u64 {
        self.shared.view.load(Ordering::Acquire)
    }

    /// Register a handler for `kind` ([`super::WILDCARD`] for everything)
    pub fn on_event<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&StreamUpdate) + Send + Sync + 'static,
    {
        self.shared.handlers.on(kind, handler)
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.shared.handlers
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let mut control = self.control.lock();
        if control.shutdown.is_some() {
            self.stop(&mut control);
        }
    }
}
