//! Shared key-value store adapters
//!
//! The election keeps its leader claim in a store shared by every context in a
//! scope. Contexts share the store but not memory, so the only coordination
//! primitives are plain get/set/remove plus an optional "key changed" feed.
//!
//! - [`MemoryStore`]: in-process store for tests and single-process use
//! - [`NatsKvStore`]: NATS JetStream key-value bucket for cross-process use

pub mod memory;
pub mod nats_kv;

pub use memory::MemoryStore;
pub use nats_kv::NatsKvStore;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::types::Result;

/// Namespaced string store shared by all contexts
///
/// No operation is atomic across contexts; callers must tolerate lost updates.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a value, `None` when the key is absent
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value unconditionally
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key (removing an absent key is not an error)
    async fn remove(&self, key: &str) -> Result<()>;

    /// Subscribe to change notifications carrying the changed key
    ///
    /// Returns `None` when the backend cannot notify; consumers then rely on polling.
    fn changes(&self) -> Option<broadcast::Receiver<String>> {
        None
    }
}
