//! Streaming Module
//!
//! Ledger event stream: endpoint fallback, reconnect with backoff, message
//! decoding, handler dispatch and sequence confirmation feedback.

pub mod backoff;
pub mod connection;
pub mod endpoints;
pub mod events;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStats};
pub use endpoints::EndpointConfig;
pub use events::{
    HandlerRegistry, LedgerEvent, StreamMessage, StreamUpdate, Subscription, HEAD_KIND,
    TRANSACTION_KIND, WILDCARD,
};
pub use transport::{EventSocket, EventTransport};

#[cfg(feature = "ws-stream")]
pub use transport::WsTransport;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("No event stream endpoints configured")]
    NoEndpoints,

    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Stream transport error: {0}")]
    Transport(String),

    #[error("Undecodable stream message: {0}")]
    Decode(String),
}

impl StreamError {
    /// Check if reconnecting may help
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::Connect { .. } | StreamError::Transport(_))
    }
}
