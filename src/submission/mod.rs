//! Submission Module
//!
//! Serialized, self-correcting transaction submission per account

use crate::ledger::LedgerError;
use crate::types::Sequence;
use thiserror::Error;

pub mod coordinator;
pub mod locks;
pub mod resubmitter;

pub use coordinator::{SubmissionCoordinator, SubmissionOutcome};
pub use locks::AccountLocks;
pub use resubmitter::{ResubmitConfig, ResubmitStats, Resubmitter};

/// Failures that end a submission without a ledger verdict
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// The caller's builder could not produce a transaction for the sequence
    #[error("Failed to build transaction for sequence {sequence}: {message}")]
    Build { sequence: Sequence, message: String },

    /// The ledger could not be reached. The sequence stays pending for resubmission.
    #[error("Transport failure submitting sequence {sequence}: {source}")]
    Transport {
        sequence: Sequence,
        #[source]
        source: LedgerError,
    },
}

impl SubmissionError {
    /// Check if the caller may retry later
    pub fn is_transient(&self) -> bool {
        match self {
            SubmissionError::Build { .. } => false,
            SubmissionError::Transport { source, .. } => source.is_retryable(),
        }
    }
}
