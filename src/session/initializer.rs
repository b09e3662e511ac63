//! Session setup hooks

use super::{Session, SessionError};
use crate::types::AccountId;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Supplies a session's account and performs post-connect registration.
///
/// A `register` failure unwinds the whole session.
#[async_trait]
pub trait SessionInitializer: Send + Sync {
    async fn account_for(&self, identity: &str) -> Result<AccountId, SessionError>;

    async fn register(&self, _session: &Session) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Namespace prefix used when none is configured
pub const DEFAULT_ACCOUNT_NAMESPACE: &[u8] = b"gateway-session-account";

/// Account id = SHA-256(namespace || identity)
#[derive(Debug, Clone)]
pub struct DerivedAccounts {
    namespace: Vec<u8>,
}

impl DerivedAccounts {
    pub fn new(namespace: impl Into<Vec<u8>>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn derive(&self, identity: &str) -> AccountId {
        let mut hasher = Sha256::new();
        hasher.update(&self.namespace);
        hasher.update(identity.as_bytes());
        AccountId::new(hasher.finalize().into())
    }
}

impl Default for DerivedAccounts {
    fn default() -> Self {
        Self::new(DEFAULT_ACCOUNT_NAMESPACE)
    }
}

#[async_trait]
impl SessionInitializer for DerivedAccounts {
    async fn account_for(&self, identity: &str) -> Result<AccountId, SessionError> {
        if identity.is_empty() {
            return Err(SessionError::Initialization("empty identity".to_string()));
        }
        Ok(self.derive(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_stable_and_namespaced() {
        let a = DerivedAccounts::default();
        assert_eq!(a.derive("alice"), a.derive("alice"));
        assert_ne!(a.derive("alice"), a.derive("bob"));
        assert_ne!(a.derive("alice"), DerivedAccounts::new("other").derive("alice"));
    }

    #[tokio::test]
    async fn test_empty_identity_refused() {
        let accounts = DerivedAccounts::default();
        assert!(matches!(
            accounts.account_for("").await,
            Err(SessionError::Initialization(_))
        ));
    }
}
