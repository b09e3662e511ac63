use crate::types::AccountId;
use thiserror::Error;

/// Nonce store / reconciliation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NonceError {
    /// Reading or writing the backing store failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A persisted record could not be parsed
    #[error("Corrupt persisted record {key:?}: {reason}")]
    CorruptRecord { key: String, reason: String },

    /// The ledger could not be queried for an account's sequence
    #[error("Ledger fetch failed for {account}: {message}")]
    LedgerFetch { account: AccountId, message: String },

    /// Serialization of the store snapshot failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl NonceError {
    /// Check if this error is transient and retryable
    pub fn is_transient(&self) -> bool {
        match self {
            NonceError::LedgerFetch { .. } => true,
            NonceError::Persistence(_) => true,

            NonceError::CorruptRecord { .. } => false,
            NonceError::Serialization(_) => false,
            NonceError::Configuration(_) => false,
        }
    }
}

impl From<std::io::Error> for NonceError {
    fn from(err: std::io::Error) -> Self {
        NonceError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for NonceError {
    fn from(err: serde_json::Error) -> Self {
        NonceError::Serialization(err.to_string())
    }
}

impl From<sled::Error> for NonceError {
    fn from(err: sled::Error) -> Self {
        NonceError::Persistence(err.to_string())
    }
}

/// Result type for nonce operations
pub type NonceResult<T> = Result<T, NonceError>;
