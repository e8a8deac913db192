//! In-process bus transport
//!
//! All links created from clones of one `MemoryTransport` share its channels.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{BusLink, BusTransport};
use crate::types::{Result, TetherError};

struct Member {
    id: u64,
    inbound: mpsc::UnboundedSender<Bytes>,
}

type Hub = DashMap<String, Vec<Member>>;

/// In-memory hub of named channels
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
    next_id: Arc<AtomicU64>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live members on a channel
    pub fn member_count(&self, channel: &str) -> usize {
        self.hub
            .get(channel)
            .map(|members| members.iter().filter(|m| !m.inbound.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BusTransport for MemoryTransport {
    async fn join(
        &self,
        channel: &str,
        inbound: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Arc<dyn BusLink>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.hub
            .entry(channel.to_string())
            .or_default()
            .push(Member { id, inbound });

        Ok(Arc::new(MemoryLink {
            id,
            channel: channel.to_string(),
            hub: Arc::clone(&self.hub),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryLink {
    id: u64,
    channel: String,
    hub: Arc<Hub>,
    closed: AtomicBool,
}

impl BusLink for MemoryLink {
    fn publish(&self, payload: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TetherError::Bus(format!("link on {} is closed", self.channel)));
        }

        if let Some(mut members) = self.hub.get_mut(&self.channel) {
            members.retain(|m| !m.inbound.is_closed());
            for member in members.iter().filter(|m| m.id != self.id) {
                // A member mid-teardown may miss the message
                let _ = member.inbound.send(payload.clone());
            }
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut members) = self.hub.get_mut(&self.channel) {
            members.retain(|m| m.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_skips_sender() {
        let transport = MemoryTransport::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = transport.join("c", tx_a).await.unwrap();
        let _b = transport.join("c", tx_b).await.unwrap();

        a.publish(Bytes::from_static(b"hi")).unwrap();

        assert_eq!(rx_b.recv().await.unwrap(), Bytes::from_static(b"hi"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_leaves_channel() {
        let transport = MemoryTransport::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let a = transport.join("c", tx_a).await.unwrap();
        let b = transport.join("c", tx_b).await.unwrap();
        assert_eq!(transport.member_count("c"), 2);

        b.close();
        assert_eq!(transport.member_count("c"), 1);
        assert!(b.publish(Bytes::from_static(b"x")).is_err());
        assert!(a.publish(Bytes::from_static(b"x")).is_ok());
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let transport = MemoryTransport::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = transport.join("c", tx_a).await.unwrap();
        let _b = transport.join("c", tx_b).await.unwrap();

        drop(rx_b);
        a.publish(Bytes::from_static(b"x")).unwrap();
        assert_eq!(transport.member_count("c"), 1);
    }
}
