//! Bus transport over core NATS subjects
//!
//! Channel `bus:<scope>` maps to subject `<prefix>.<token>`. Several contexts
//! may share one NATS connection, so connection-level `no_echo` cannot filter
//! a context's own posts; each link stamps an origin header instead and drops
//! deliveries that carry it.

use async_nats::{HeaderMap, HeaderValue};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BusLink, BusTransport};
use crate::nats::{encode_token, NatsClient};
use crate::types::{Result, TetherError};

/// Subject prefix for bus channels
pub const DEFAULT_SUBJECT_PREFIX: &str = "TETHER.BUS";

/// Header carrying the publishing link's token
pub const ORIGIN_HEADER: &str = "Tether-Origin";

/// NATS implementation of [`BusTransport`]
#[derive(Clone)]
pub struct NatsTransport {
    client: NatsClient,
    prefix: String,
}

impl NatsTransport {
    pub fn new(client: NatsClient) -> Self {
        Self {
            client,
            prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
        }
    }

    /// Use a custom subject prefix
    pub fn with_prefix(mut self, prefix: String) -> Self {
        self.prefix = prefix;
        self
    }

    /// Subject used for a channel name
    pub fn subject(&self, channel: &str) -> String {
        format!("{}.{}", self.prefix, encode_token(channel))
    }
}

#[async_trait]
impl BusTransport for NatsTransport {
    async fn join(
        &self,
        channel: &str,
        inbound: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Arc<dyn BusLink>> {
        let subject = self.subject(channel);
        let origin = Uuid::new_v4().simple().to_string();
        let origin_value = HeaderValue::from_str(&origin)
            .map_err(|e| TetherError::Bus(format!("Invalid origin header: {}", e)))?;

        let mut subscriber = self.client.subscribe(&subject).await?;

        // Single publisher task keeps this link's posts in order
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        let client = self.client.clone();
        let publish_subject = subject.clone();
        tokio::spawn(async move {
            while let Some(payload) = out_rx.recv().await {
                let mut headers = HeaderMap::new();
                headers.insert(ORIGIN_HEADER, origin_value.clone());
                if let Err(e) = client
                    .publish_with_headers(&publish_subject, headers, payload)
                    .await
                {
                    debug!("Bus publish on {} failed: {}", publish_subject, e);
                }
            }
        });

        let own_origin = origin.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let is_own = message
                    .headers
                    .as_ref()
                    .and_then(|h| h.get(ORIGIN_HEADER))
                    .map(|v| v.as_str() == own_origin)
                    .unwrap_or(false);
                if is_own {
                    continue;
                }
                if inbound.send(message.payload).is_err() {
                    break;
                }
            }
        });

        info!(
            "{} joined NATS bus subject {} for {}",
            self.client.name(),
            subject,
            channel
        );

        Ok(Arc::new(NatsLink {
            subject,
            out: Mutex::new(Some(out_tx)),
            reader,
        }))
    }
}

struct NatsLink {
    subject: String,
    out: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    reader: JoinHandle<()>,
}

impl BusLink for NatsLink {
    fn publish(&self, payload: Bytes) -> Result<()> {
        let out = self
            .out
            .lock()
            .map_err(|_| TetherError::Internal("bus link lock poisoned".into()))?;
        match out.as_ref() {
            Some(tx) => tx
                .send(payload)
                .map_err(|_| TetherError::Bus(format!("publisher for {} stopped", self.subject))),
            None => Err(TetherError::Bus(format!("link on {} is closed", self.subject))),
        }
    }

    fn close(&self) {
        // Dropping the sender lets the publisher drain queued posts and exit
        if let Ok(mut out) = self.out.lock() {
            out.take();
        }
        self.reader.abort();
    }
}

impl Drop for NatsLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
