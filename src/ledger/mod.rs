//! Ledger Module
//!
//! The ledger's submit/query surface as consumed by the gateway. The wire
//! format is owned by the ledger; everything here is the typed contract the
//! rest of the crate programs against.

use async_trait::async_trait;
use bytes::Bytes;
use crate::types::{AccountId, Sequence};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod classify;
pub mod http;

pub use classify::classify_rejection;
pub use http::HttpLedger;

/// Why the ledger refused a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Sequence did not match the ledger's expectation (stale, replayed, out of order)
    SequenceMismatch(String),
    /// Anything else: balance, malformed payload, validation failure
    Other(String),
}

impl RejectReason {
    pub fn is_sequence_mismatch(&self) -> bool {
        matches!(self, RejectReason::SequenceMismatch(_))
    }

    pub fn message(&self) -> &str {
        match self {
            RejectReason::SequenceMismatch(m) | RejectReason::Other(m) => m,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::SequenceMismatch(m) => write!(f, "sequence mismatch: {}", m),
            RejectReason::Other(m) => write!(f, "rejected: {}", m),
        }
    }
}

/// Result of handing a signed transaction to the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(RejectReason),
}

/// Account state as reported by the ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    /// Next sequence the ledger expects
    #[serde(alias = "nonce")]
    pub sequence: Sequence,
    #[serde(default)]
    pub balance: u64,
}

/// Transport-level ledger errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    /// Network/connection failure
    #[error("Transport error: {message} (endpoint: {endpoint})")]
    Transport { endpoint: String, message: String },

    /// Request timed out
    #[error("Timeout after {timeout_ms}ms (endpoint: {endpoint})")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// Unexpected HTTP status or body
    #[error("Unexpected response from {endpoint}: status {status}: {body}")]
    UnexpectedResponse {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// Response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

impl LedgerError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Transport { .. } => true,
            LedgerError::Timeout { .. } => true,
            LedgerError::UnexpectedResponse { status, .. } => *status >= 500 || *status == 429,
            LedgerError::Decode(_) => false,
        }
    }
}

/// Submit/query surface of the ledger
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Submit opaque signed transaction bytes
    async fn submit(&self, payload: Bytes) -> Result<SubmitOutcome, LedgerError>;

    /// Fetch account state; `None` when the ledger has never seen the account
    async fn get_account(&self, account: &AccountId) -> Result<Option<LedgerAccount>, LedgerError>;
}
