//! Stream message decoding and handler dispatch

use super::StreamError;
use crate::types::{AccountId, Sequence};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

/// Event kind that carries `(account, sequence)` confirmation feedback
pub const TRANSACTION_KIND: &str = "transaction";
/// Kind under which head updates are dispatched
pub const HEAD_KIND: &str = "head";
/// Handlers registered under this kind receive everything
pub const WILDCARD: &str = "*";

/// Typed domain event from the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Sequence>,
    /// Remaining kind-specific fields
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl LedgerEvent {
    /// Sequence of a transaction event signed by `account`
    pub fn transaction_sequence_for(&self, account: &AccountId) -> Option<Sequence> {
        if self.kind != TRANSACTION_KIND || self.account.as_ref() != Some(account) {
            return None;
        }
        self.sequence
    }
}

/// One decoded stream frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    /// Authoritative head/view update
    Head { view: u64 },
    /// Batch of typed events; malformed entries are dropped individually
    Events {
        #[serde(deserialize_with = "decode_events_lenient")]
        events: Vec<LedgerEvent>,
    },
}

fn decode_events_lenient<'de, D>(deserializer: D) -> Result<Vec<LedgerEvent>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    let total = raw.len();
    let events: Vec<LedgerEvent> = raw
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value(value) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(index, error = %e, "Skipping malformed event in batch");
                None
            }
        })
        .collect();
    if events.len() < total {
        warn!(kept = events.len(), total, "Event batch partially decoded");
    }
    Ok(events)
}

impl StreamMessage {
    pub fn decode(text: &str) -> Result<Self, StreamError> {
        serde_json::from_str(text).map_err(|e| StreamError::Decode(e.to_string()))
    }
}

/// What handlers receive
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Head { view: u64 },
    Event(LedgerEvent),
}

impl StreamUpdate {
    pub fn kind(&self) -> &str {
        match self {
            StreamUpdate::Head { .. } => HEAD_KIND,
            StreamUpdate::Event(event) => &event.kind,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&StreamUpdate) + Send + Sync>;

#[derive(Default)]
struct HandlerTable {
    by_kind: RwLock<HashMap<String, Vec<(u64, EventHandler)>>>,
    next_id: AtomicU64,
}

/// Handlers keyed by event kind, plus the wildcard list
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    table: Arc<HandlerTable>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind` (or [`WILDCARD`])
    pub fn on<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&StreamUpdate) + Send + Sync + 'static,
    {
        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);
        self.table
            .by_kind
            .write()
            .entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            table: Arc::downgrade(&self.table),
            kind: kind.to_string(),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Call kind-specific handlers then wildcard handlers. Returns how many ran.
    pub fn dispatch(&self, update: &StreamUpdate) -> usize {
        // Handlers run outside the lock so they may unsubscribe themselves
        let handlers: Vec<EventHandler> = {
            let by_kind = self.table.by_kind.read();
            let specific = by_kind.get(update.kind()).into_iter().flatten();
            let wildcard = by_kind.get(WILDCARD).into_iter().flatten();
            specific.chain(wildcard).map(|(_, h)| h.clone()).collect()
        };
        for handler in &handlers {
            handler(update);
        }
        handlers.len()
    }

    pub fn len(&self) -> usize {
        self.table.by_kind.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.table.by_kind.write().clear();
    }
}

/// Handle returned by [`HandlerRegistry::on`]; unsubscribes on drop
pub struct Subscription {
    table: Weak<HandlerTable>,
    kind: String,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the handler. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut by_kind = table.by_kind.write();
        if let Some(handlers) = by_kind.get_mut(&self.kind) {
            handlers.retain(|(id, _)| *id != self.id);
            if handlers.is_empty() {
                by_kind.remove(&self.kind);
            }
        }
    }

    /// Keep the handler registered for the registry's lifetime
    pub fn detach(self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}
