//! Bus message wire format
//!
//! Every relayed event travels as a small JSON object on channel `bus:<scope>`:
//! `{"kind":"out"|"in"|"sys"|"sent","payload"?:string,"type"?:"open"|"close"}`

use serde::{Deserialize, Serialize};

/// Connection-level notice relayed by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SysNotice {
    Open,
    Close,
}

/// Transient envelope broadcast between contexts of one scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BusMessage {
    /// Follower to leader: payload to send on the real connection
    Out { payload: String },

    /// Leader to followers: payload received from the real connection
    In { payload: String },

    /// Leader to followers: the real connection opened or closed
    Sys {
        #[serde(rename = "type")]
        notice: SysNotice,
    },

    /// Leader to all: a payload was transmitted on the real connection
    Sent { payload: String },
}

impl BusMessage {
    pub fn out(payload: impl Into<String>) -> Self {
        Self::Out {
            payload: payload.into(),
        }
    }

    pub fn inbound(payload: impl Into<String>) -> Self {
        Self::In {
            payload: payload.into(),
        }
    }

    pub fn sys(notice: SysNotice) -> Self {
        Self::Sys { notice }
    }

    pub fn sent(payload: impl Into<String>) -> Self {
        Self::Sent {
            payload: payload.into(),
        }
    }

    /// Wire name of the message kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Out { .. } => "out",
            Self::In { .. } => "in",
            Self::Sys { .. } => "sys",
            Self::Sent { .. } => "sent",
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<bytes::Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Into::into)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
