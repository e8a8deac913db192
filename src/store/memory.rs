//! In-process shared store
//!
//! Every context holding a clone of the same `MemoryStore` sees the same keys.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use super::SharedStore;
use crate::types::{Result, TetherError};

/// Capacity of the change notification channel
const CHANGE_CAPACITY: usize = 256;

/// In-memory store with change notifications
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, String>>,
    changes: broadcast::Sender<String>,
    available: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            entries: Arc::new(DashMap::new()),
            changes,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the backing store going away (every operation fails) or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TetherError::Store("memory store unavailable".into()))
        }
    }

    fn notify(&self, key: &str) {
        // Ignore send errors (no subscribers)
        let _ = self.changes.send(key.to_string());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        self.entries.insert(key.to_string(), value.to_string());
        trace!(key, "memory store set");
        self.notify(key);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check_available()?;
        if self.entries.remove(key).is_some() {
            trace!(key, "memory store remove");
            self.notify(key);
        }
        Ok(())
    }

    fn changes(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v1").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v1".to_string()));

        store.set("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));

        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.set("shared", "1").await.unwrap();
        assert_eq!(b.get("shared").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_change_notifications() {
        let store = MemoryStore::new();
        let mut rx = store.changes().unwrap();

        store.set("a", "1").await.unwrap();
        store.remove("a").await.unwrap();
        // absent key: no notification
        store.remove("a").await.unwrap();
        store.set("b", "2").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "a");
        assert_eq!(rx.recv().await.unwrap(), "a");
        assert_eq!(rx.recv().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        store.set_available(false);

        assert!(matches!(store.get("k").await, Err(TetherError::Store(_))));
        assert!(store.set("k", "x").await.is_err());
        assert!(store.remove("k").await.is_err());

        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }
}
