//! Small shared helpers: context identities, clocks and scope derivation

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::types::{Result, TetherError};

/// Number of random bytes in a context identity (hex encoded to twice as many chars)
pub const CONTEXT_ID_BYTES: usize = 8;

/// Generate a random opaque hex token of `len` bytes
pub fn random_id(len: usize) -> String {
    let bytes: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
    hex::encode(bytes)
}

/// Generate a fresh context identity
pub fn context_id() -> String {
    random_id(CONTEXT_ID_BYTES)
}

/// Millisecond wall clock used for claim timestamps
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

/// Wall clock backed by chrono
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for deterministic staleness tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Derive the default coordination scope from an endpoint URL: its origin
///
/// `ws://localhost:8787/chat?room=1` becomes `ws://localhost:8787`.
pub fn scope_from_url(endpoint: &str) -> Result<String> {
    let parsed = url::Url::parse(endpoint)
        .map_err(|e| TetherError::Config(format!("Invalid endpoint URL {}: {}", endpoint, e)))?;

    let origin = parsed.origin();
    if !origin.is_tuple() {
        return Err(TetherError::Config(format!(
            "Endpoint URL {} has no origin",
            endpoint
        )));
    }
    Ok(origin.ascii_serialization())
}

/// Shared-store key holding the leader claim for a scope
pub fn leader_key(scope: &str) -> String {
    format!("leader:{scope}")
}

/// Pub/sub channel name for a scope
pub fn bus_channel(scope: &str) -> String {
    format!("bus:{scope}")
}
