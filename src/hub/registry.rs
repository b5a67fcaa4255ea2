//! Registry of live share sessions.

use std::collections::BTreeMap;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::protocol::ShareId;

use super::session::SessionHandle;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Hub is at capacity ({0} shares)")]
    AtCapacity(usize),

    #[error("Share {0} is already connected")]
    AlreadyRegistered(ShareId),
}

/// Live sessions keyed by share id
///
/// Created once by the hub and passed to the tunnel server, the HTTP routes
/// and the locator. Iteration is in share id order.
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<ShareId, SessionHandle>>,
    max_shares: usize,
}

impl SessionRegistry {
    pub fn new(max_shares: usize) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            max_shares,
        }
    }

    /// Add a session. An existing session under the same id is left untouched.
    pub async fn register(&self, handle: SessionHandle) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let share_id = handle.share_id().clone();

        if sessions.contains_key(&share_id) {
            return Err(RegistryError::AlreadyRegistered(share_id));
        }
        if sessions.len() >= self.max_shares {
            return Err(RegistryError::AtCapacity(self.max_shares));
        }

        sessions.insert(share_id.clone(), handle);
        info!(share_id = %share_id, shares = sessions.len(), "Share registered");
        Ok(())
    }

    /// Remove a session. Returns false if it was not registered.
    pub async fn unregister(&self, share_id: &ShareId) -> bool {
        let removed = self.sessions.write().await.remove(share_id).is_some();
        if removed {
            info!(share_id = %share_id, "Share unregistered");
        }
        removed
    }

    pub async fn get(&self, share_id: &ShareId) -> Option<SessionHandle> {
        self.sessions.read().await.get(share_id).cloned()
    }

    /// Snapshot of all live sessions.
    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::session::{open_session, ShareInfo};

    fn handle(id: &str) -> SessionHandle {
        open_session(
            ShareInfo {
                share_id: ShareId::new(id),
                protocol: "http".to_string(),
                host: "localhost".to_string(),
                port: 12000,
                public_key: String::new(),
            },
            10,
        )
        .handle
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = SessionRegistry::new(10);
        registry.register(handle("one")).await.unwrap();

        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&ShareId::new("one")).await.is_some());
        assert!(registry.get(&ShareId::new("two")).await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_first() {
        let registry = SessionRegistry::new(10);
        let first = handle("one");
        registry.register(first.clone()).await.unwrap();

        let result = registry.register(handle("one")).await;
        assert_eq!(
            result,
            Err(RegistryError::AlreadyRegistered(ShareId::new("one")))
        );
        assert_eq!(registry.len().await, 1);
        let kept = registry.get(&ShareId::new("one")).await.unwrap();
        assert_eq!(kept.info(), first.info());
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let registry = SessionRegistry::new(2);
        registry.register(handle("a")).await.unwrap();
        registry.register(handle("b")).await.unwrap();
        assert_eq!(
            registry.register(handle("c")).await,
            Err(RegistryError::AtCapacity(2))
        );

        assert!(registry.unregister(&ShareId::new("a")).await);
        registry.register(handle("c")).await.unwrap();
    }

    #[tokio::test]
    async fn test_handles_in_id_order() {
        let registry = SessionRegistry::new(10);
        for id in ["c", "a", "b"] {
            registry.register(handle(id)).await.unwrap();
        }
        let ids: Vec<String> = registry
            .handles()
            .await
            .iter()
            .map(|h| h.share_id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(!registry.unregister(&ShareId::new("zzz")).await);
    }
}
