//! Pub/sub bus between the contexts of one scope
//!
//! The bus is best-effort fan-out: no acknowledgement, no retry, and no
//! ordering across publishers. A context never receives its own posts; the
//! transport link filters them before delivery.
//!
//! - [`MemoryTransport`]: in-process hub
//! - [`NatsTransport`]: core NATS subjects

pub mod memory;
pub mod messages;
pub mod nats;

pub use memory::MemoryTransport;
pub use messages::{BusMessage, SysNotice};
pub use nats::NatsTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::types::Result;
use crate::util::bus_channel;

/// Factory for channel links
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Join a named channel
    ///
    /// Payloads published by other links on the channel are delivered to `inbound`.
    async fn join(
        &self,
        channel: &str,
        inbound: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Arc<dyn BusLink>>;
}

/// One context's membership in a channel
pub trait BusLink: Send + Sync {
    /// Queue a payload for every other member (fire-and-forget)
    fn publish(&self, payload: Bytes) -> Result<()>;

    /// Leave the channel; later publishes fail and nothing more is delivered
    fn close(&self);
}

type Handler = Arc<dyn Fn(BusMessage) + Send + Sync>;
type Handlers = Mutex<Vec<(u64, Handler)>>;

/// Typed bus for one scope
pub struct Bus {
    channel: String,
    link: Arc<dyn BusLink>,
    handlers: Arc<Handlers>,
    next_handler: AtomicU64,
    dispatcher: JoinHandle<()>,
}

impl Bus {
    /// Join `bus:<scope>` on the given transport
    pub async fn open(transport: &dyn BusTransport, scope: &str) -> Result<Self> {
        let channel = bus_channel(scope);
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let link = transport.join(&channel, tx).await?;

        let handlers: Arc<Handlers> = Arc::new(Mutex::new(Vec::new()));
        let dispatch_to = Arc::clone(&handlers);
        let dispatch_channel = channel.clone();

        let dispatcher = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                let message = match BusMessage::from_bytes(&data) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!("Dropping malformed message on {}: {}", dispatch_channel, e);
                        continue;
                    }
                };

                // Snapshot so handlers may unsubscribe while running
                let snapshot: Vec<Handler> = match dispatch_to.lock() {
                    Ok(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                    Err(_) => break,
                };
                for handler in snapshot {
                    handler(message.clone());
                }
            }
            trace!("Bus dispatcher for {} ended", dispatch_channel);
        });

        debug!("Joined bus channel {}", channel);

        Ok(Self {
            channel,
            link,
            handlers,
            next_handler: AtomicU64::new(0),
            dispatcher,
        })
    }

    /// Channel name (`bus:<scope>`)
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Broadcast a message to every other context; failures are dropped
    pub fn post(&self, message: &BusMessage) {
        let payload = match message.to_bytes() {
            Ok(p) => p,
            Err(e) => {
                debug!("Failed to encode {} message: {}", message.kind(), e);
                return;
            }
        };

        if let Err(e) = self.link.publish(payload) {
            debug!("Dropped {} message on {}: {}", message.kind(), self.channel, e);
        }
    }

    /// Register a handler for every received message
    ///
    /// The handler runs on the bus dispatcher task and must not block.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(BusMessage) + Send + Sync + 'static,
    {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut list) = self.handlers.lock() {
            list.push((id, Arc::new(handler)));
        }
        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Leave the channel and drop every handler
    pub fn close(&self) {
        self.link.close();
        self.dispatcher.abort();
        if let Ok(mut list) = self.handlers.lock() {
            list.clear();
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle returned by [`Bus::subscribe`]; dropping it unsubscribes
pub struct Subscription {
    id: u64,
    handlers: Weak<Handlers>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            if let Ok(mut list) = handlers.lock() {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
