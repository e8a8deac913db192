//! In-process remote endpoint
//!
//! Stands in for a real server: records what each connection sends, can echo
//! it back, and lets a test push inbound messages, errors and server-side
//! closes into every open connection.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{CloseInfo, ConnectionEvent, ConnectionSink, Connector, RemoteConnection, CLOSE_NORMAL};
use crate::types::{Result, TetherError};

#[derive(Default)]
struct Endpoint {
    received: Mutex<Vec<String>>,
    live: Mutex<Vec<(u64, ConnectionSink)>>,
    next_id: AtomicU64,
    connects: AtomicUsize,
    echo: AtomicBool,
    refuse: AtomicBool,
    buffered: AtomicUsize,
}

impl Endpoint {
    fn live_sinks(&self) -> Vec<ConnectionSink> {
        self.live
            .lock()
            .map(|live| live.iter().map(|(_, sink)| sink.clone()).collect())
            .unwrap_or_default()
    }

    fn forget(&self, id: u64) -> bool {
        match self.live.lock() {
            Ok(mut live) => {
                let before = live.len();
                live.retain(|(conn, _)| *conn != id);
                live.len() != before
            }
            Err(_) => false,
        }
    }
}

/// Cloneable in-memory [`Connector`]; clones share one endpoint
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    endpoint: Arc<Endpoint>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo every payload back to the connection that sent it
    pub fn echoing() -> Self {
        let connector = Self::new();
        connector.endpoint.echo.store(true, Ordering::SeqCst);
        connector
    }

    /// Fail new connections with `Error` then an abnormal `Close`
    pub fn set_refuse(&self, refuse: bool) {
        self.endpoint.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Bytes every live connection reports as queued but unwritten
    pub fn set_buffered_amount(&self, bytes: usize) {
        self.endpoint.buffered.store(bytes, Ordering::SeqCst);
    }

    /// Every payload received, across all connections, in arrival order
    pub fn received(&self) -> Vec<String> {
        self.endpoint
            .received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Total connection attempts so far
    pub fn connection_count(&self) -> usize {
        self.endpoint.connects.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.endpoint.live.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Deliver a server-originated message to every open connection
    pub fn push_message(&self, payload: &str) {
        for sink in self.endpoint.live_sinks() {
            sink.emit(ConnectionEvent::Message(payload.to_string()));
        }
    }

    pub fn push_error(&self, description: &str) {
        for sink in self.endpoint.live_sinks() {
            sink.emit(ConnectionEvent::Error(description.to_string()));
        }
    }

    /// Close every open connection from the server side
    pub fn close_all(&self, code: u16, reason: &str) {
        let sinks = match self.endpoint.live.lock() {
            Ok(mut live) => std::mem::take(&mut *live),
            Err(_) => return,
        };
        for (_, sink) in sinks {
            sink.emit(ConnectionEvent::Close(CloseInfo::clean(code, reason)));
        }
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self, _url: &str, sink: ConnectionSink) -> Box<dyn RemoteConnection> {
        let id = self.endpoint.next_id.fetch_add(1, Ordering::SeqCst);
        self.endpoint.connects.fetch_add(1, Ordering::SeqCst);

        if self.endpoint.refuse.load(Ordering::SeqCst) {
            sink.emit(ConnectionEvent::Error("connection refused".into()));
            sink.emit(ConnectionEvent::Close(CloseInfo::abnormal()));
        } else {
            if let Ok(mut live) = self.endpoint.live.lock() {
                live.push((id, sink.clone()));
            }
            // Queued, so the owner observes it asynchronously
            sink.emit(ConnectionEvent::Open);
        }

        Box::new(LoopbackConnection {
            id,
            sink,
            endpoint: Arc::clone(&self.endpoint),
        })
    }
}

struct LoopbackConnection {
    id: u64,
    sink: ConnectionSink,
    endpoint: Arc<Endpoint>,
}

impl LoopbackConnection {
    fn is_live(&self) -> bool {
        self.endpoint
            .live
            .lock()
            .map(|live| live.iter().any(|(id, _)| *id == self.id))
            .unwrap_or(false)
    }
}

impl RemoteConnection for LoopbackConnection {
    fn send(&mut self, payload: &str) -> Result<()> {
        if !self.is_live() {
            return Err(TetherError::InvalidState("loopback connection is closed".into()));
        }
        if let Ok(mut received) = self.endpoint.received.lock() {
            received.push(payload.to_string());
        }
        if self.endpoint.echo.load(Ordering::SeqCst) {
            self.sink.emit(ConnectionEvent::Message(payload.to_string()));
        }
        Ok(())
    }

    fn close(&mut self, code: Option<u16>, reason: Option<String>) {
        if self.endpoint.forget(self.id) {
            self.sink.emit(ConnectionEvent::Close(CloseInfo::clean(
                code.unwrap_or(CLOSE_NORMAL),
                reason.unwrap_or_default(),
            )));
        }
    }

    fn buffered_amount(&self) -> usize {
        if self.is_live() {
            self.endpoint.buffered.load(Ordering::SeqCst)
        } else {
            0
        }
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        self.endpoint.forget(self.id);
    }
}
