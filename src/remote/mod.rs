//! The real remote connection held by the leader
//!
//! A [`Connector`] opens connections; each connection reports its lifecycle
//! through a [`ConnectionSink`] stamped with the generation the facade
//! assigned to it, so events from a connection the facade already discarded
//! can be recognised and ignored.
//!
//! - [`WsConnector`]: WebSocket over tokio-tungstenite
//! - [`LoopbackConnector`]: in-process endpoint for tests and demos

pub mod loopback;
pub mod websocket;

pub use loopback::LoopbackConnector;
pub use websocket::WsConnector;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::Result;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Closed without a status code
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Closed without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Details of a closed connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseInfo {
    pub fn clean(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean: true,
        }
    }

    /// Connection dropped without a closing handshake
    pub fn abnormal() -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: String::new(),
            was_clean: false,
        }
    }
}

/// Lifecycle of one real connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    Message(String),
    Error(String),
    Close(CloseInfo),
}

/// A connection event tagged with its connection generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: ConnectionEvent,
}

/// Where a connection reports its events
#[derive(Debug, Clone)]
pub struct ConnectionSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl ConnectionSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    /// Sink plus the receiving end, for driving a connector directly
    pub fn channel(generation: u64) -> (Self, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(generation, tx), rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event; false once the owner has gone away
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Opens real connections to a remote endpoint
///
/// `connect` must not block: the connection opens in the background and
/// reports `Open` (or `Error` then `Close`) through the sink.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str, sink: ConnectionSink) -> Box<dyn RemoteConnection>;
}

/// Handle to one real connection
pub trait RemoteConnection: Send {
    /// Queue a text payload
    fn send(&mut self, payload: &str) -> Result<()>;

    /// Start the closing handshake; the final `Close` arrives through the sink
    fn close(&mut self, code: Option<u16>, reason: Option<String>);

    /// Bytes queued but not yet written
    fn buffered_amount(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_tags_generation() {
        let (sink, mut rx) = ConnectionSink::channel(7);
        assert!(sink.emit(ConnectionEvent::Open));
        assert_eq!(
            rx.recv().await,
            Some(TaggedEvent {
                generation: 7,
                event: ConnectionEvent::Open
            })
        );

        drop(rx);
        assert!(!sink.emit(ConnectionEvent::Message("late".into())));
    }

    #[test]
    fn test_close_info_serializes_camel_case() {
        let json = serde_json::to_string(&CloseInfo::clean(CLOSE_NORMAL, "bye")).unwrap();
        assert_eq!(json, r#"{"code":1000,"reason":"bye","wasClean":true}"#);
        assert!(!CloseInfo::abnormal().was_clean);
    }
}
