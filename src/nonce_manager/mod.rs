//! Nonce Manager Module
//!
//! Local sequence counters per account, their persistence, drift
//! reconciliation against the ledger and the record of unconfirmed
//! transactions.

// Submodules
pub mod nonce_errors;
pub mod nonce_persistence;
pub mod nonce_reconciler;
pub mod nonce_store;
pub mod pending_tx;

// Re-exports for convenience
pub use nonce_errors::{NonceError, NonceResult};
pub use nonce_persistence::{FileBackend, MemoryBackend, NonceBackend};
pub use nonce_reconciler::{
    resolve_drift, DriftReconciler, DriftResolution, ReconcilerConfig, DEFAULT_DRIFT_THRESHOLD,
    DEFAULT_MIN_RECONCILE_INTERVAL,
};
pub use nonce_store::{AccountNonceEntry, NonceStore};
pub use pending_tx::{PendingTxRecord, PendingTxStore};
