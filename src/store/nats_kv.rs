//! Shared store backed by a NATS JetStream key-value bucket
//!
//! Keys are token-encoded because KV keys only allow `[-/_=.a-zA-Z0-9]`.
//! A background watcher turns bucket updates into change notifications.

use async_nats::jetstream::kv;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SharedStore;
use crate::nats::{decode_token, encode_token, NatsClient};
use crate::types::{Result, TetherError};

/// Capacity of the change notification channel
const CHANGE_CAPACITY: usize = 256;

/// JetStream KV implementation of [`SharedStore`]
pub struct NatsKvStore {
    kv: kv::Store,
    bucket: String,
    changes: broadcast::Sender<String>,
    watcher: JoinHandle<()>,
}

impl NatsKvStore {
    /// Open (or create) the bucket and start watching it
    pub async fn open(client: &NatsClient, bucket: &str) -> Result<Self> {
        let kv = client.key_value(bucket).await?;
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);

        let mut watch = kv
            .watch_all()
            .await
            .map_err(|e| TetherError::Store(format!("Failed to watch bucket {}: {}", bucket, e)))?;

        let tx = changes.clone();
        let bucket_name = bucket.to_string();
        let watcher = tokio::spawn(async move {
            while let Some(entry) = watch.next().await {
                match entry {
                    Ok(entry) => match decode_token(&entry.key) {
                        Some(key) => {
                            // Ignore send errors (no subscribers)
                            let _ = tx.send(key);
                        }
                        None => debug!("Ignoring foreign key {} in {}", entry.key, bucket_name),
                    },
                    Err(e) => {
                        warn!("KV watcher error on {}: {}", bucket_name, e);
                    }
                }
            }
            debug!("KV watcher for {} ended", bucket_name);
        });

        info!("Shared store opened on KV bucket {} for {}", bucket, client.name());

        Ok(Self {
            kv,
            bucket: bucket.to_string(),
            changes,
            watcher,
        })
    }

    /// Name of the backing bucket
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

impl Drop for NatsKvStore {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[async_trait]
impl SharedStore for NatsKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .kv
            .get(encode_token(key))
            .await
            .map_err(|e| TetherError::Store(format!("KV get failed: {}", e)))?;

        match value {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| TetherError::Store(format!("KV value is not UTF-8: {}", e))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.kv
            .put(encode_token(key), Bytes::from(value.to_string()))
            .await
            .map(|_| ())
            .map_err(|e| TetherError::Store(format!("KV put failed: {}", e)))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.kv
            .delete(encode_token(key))
            .await
            .map_err(|e| TetherError::Store(format!("KV delete failed: {}", e)))
    }

    fn changes(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.changes.subscribe())
    }
}
