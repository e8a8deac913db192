//! Persisted leader claim
//!
//! Stored string-encoded under `leader:<scope>` as `{"id":"<context>","ts":<epoch-ms>}`.

use serde::{Deserialize, Serialize};

/// The record naming the believed leader and its last heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderClaim {
    pub id: String,
    pub ts: i64,
}

impl LeaderClaim {
    pub fn new(id: impl Into<String>, ts: i64) -> Self {
        Self { id: id.into(), ts }
    }

    /// Parse a stored claim; anything that is not `{id: string, ts: number}` is `None`
    pub fn parse(raw: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        let id = value.get("id")?.as_str()?;
        let ts = value.get("ts")?;
        // JS writers may store fractional timestamps
        let ts = ts.as_i64().or_else(|| ts.as_f64().map(|f| f as i64))?;
        Some(Self::new(id, ts))
    }

    /// A claim is valid while `now - ts <= timeout_ms`
    pub fn is_valid(&self, now_ms: i64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.ts) <= i64::try_from(timeout_ms).unwrap_or(i64::MAX)
    }

    pub fn to_json(&self) -> String {
        // A struct of a String and an i64 always serializes
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }
}
