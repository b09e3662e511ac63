//! Core identifiers shared by every gateway component

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Per-account sequence number ("nonce") expected by the ledger
pub type Sequence = u64;

/// Length of an account public key in bytes
pub const ACCOUNT_ID_LEN: usize = 32;

/// Account identifier: a fixed-length public key, shown as lowercase hex
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId([u8; ACCOUNT_ID_LEN]);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccountIdError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

impl AccountId {
    pub const fn new(bytes: [u8; ACCOUNT_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, AccountIdError> {
        let array: [u8; ACCOUNT_ID_LEN] = bytes
            .try_into()
            .map_err(|_| AccountIdError::InvalidLength(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; ACCOUNT_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for AccountId {
    type Err = AccountIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches("0x");
        let bytes = hex::decode(trimmed).map_err(|e| AccountIdError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.to_hex())
    }
}

impl Serialize for AccountId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AccountId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Subscription filter for the ledger event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    /// Every event the ledger emits
    All,
    /// Events touching a single account
    Account(AccountId),
    /// Events for a single logical game session
    Session(u64),
}

impl EventFilter {
    /// Path segment appended to an endpoint base address
    pub fn path(&self) -> String {
        match self {
            EventFilter::All => "updates/all".to_string(),
            EventFilter::Account(account) => format!("updates/account/{}", account),
            EventFilter::Session(id) => format!("updates/session/{}", id),
        }
    }
}
