//! Gateway - per-account transaction sequencing for a remote ledger
//!
//! Keeps a local sequence counter per account, serializes submissions per
//! account, reconciles drift against the ledger, consumes the ledger's event
//! stream for confirmations, and manages per-caller sessions.

pub mod config;
pub mod endpoints;
pub mod ledger;
pub mod metrics;
pub mod nonce_manager;
pub mod observability;
pub mod session;
pub mod streaming;
pub mod submission;
pub mod types;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::GatewayConfig;
pub use ledger::{Ledger, RejectReason, SubmitOutcome};
pub use nonce_manager::{DriftReconciler, NonceStore, PendingTxStore};
pub use session::{Session, SessionRegistry};
pub use streaming::{ConnectionManager, ConnectionState};
pub use submission::{SubmissionCoordinator, SubmissionOutcome};
pub use types::{AccountId, EventFilter, Sequence};
