//! One logical socket shared by every context in a scope
//!
//! [`SharedSocket`] is a thin handle. The work happens on an actor task (see
//! `orchestrator`) that owns the election, the bus membership and, while this
//! context leads, the real connection. Handle calls are commands to that
//! task: they return once the command is processed and never wait on the
//! network.
//!
//! ```ignore
//! let deps = SocketDeps::new(store, Some(transport), Arc::new(WsConnector::new()));
//! let socket = SharedSocket::connect("ws://localhost:8787", SocketOptions::default(), deps).await?;
//! let mut events = socket.subscribe();
//! socket.send("hello").await?;
//! ```

mod orchestrator;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use crate::bus::{Bus, BusTransport};
use crate::election::{Election, ElectionConfig, DEFAULT_HEARTBEAT_MS, DEFAULT_TIMEOUT_MS};
use crate::remote::{CloseInfo, Connector};
use crate::store::SharedStore;
use crate::types::{Result, TetherError};
use crate::util::{context_id, scope_from_url, Clock, SystemClock};

use orchestrator::{Command, Orchestrator};

/// Default event broadcast buffer
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

const COMMAND_QUEUE: usize = 64;

/// Connection state as observed by this context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<ReadyState> for u8 {
    fn from(state: ReadyState) -> Self {
        state as u8
    }
}

impl TryFrom<u8> for ReadyState {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Connecting),
            1 => Ok(Self::Open),
            2 => Ok(Self::Closing),
            3 => Ok(Self::Closed),
            other => Err(format!("invalid ready state {}", other)),
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Events surfaced to subscribers of a [`SharedSocket`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    Message(String),
    /// Local-only, never relayed to other contexts
    Error(String),
    Close(CloseInfo),
    /// A payload was written to the real connection by the leader
    Sent(String),
}

/// Point-in-time view of a socket, recomputed on every call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub id: String,
    pub url: String,
    pub is_leader: bool,
    pub leader_id: Option<String>,
    pub ready_state: ReadyState,
    pub buffered_amount: usize,
}

fn default_heartbeat_ms() -> u64 {
    DEFAULT_HEARTBEAT_MS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

/// Per-socket options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketOptions {
    /// Coordination scope; defaults to the endpoint's origin
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            scope: None,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SocketOptions {
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_heartbeat_ms(mut self, heartbeat_ms: u64) -> Self {
        self.heartbeat_ms = heartbeat_ms;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity;
        self
    }

    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            heartbeat_ms: self.heartbeat_ms,
            timeout_ms: self.timeout_ms,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.election_config().validate()?;
        if self.event_capacity == 0 {
            return Err(TetherError::Config("event_capacity must be positive".into()));
        }
        if matches!(&self.scope, Some(scope) if scope.is_empty()) {
            return Err(TetherError::Config("scope must not be empty".into()));
        }
        Ok(())
    }

    /// Scope to coordinate in for a given endpoint
    pub fn resolve_scope(&self, url: &str) -> Result<String> {
        match &self.scope {
            Some(scope) => Ok(scope.clone()),
            None => scope_from_url(url),
        }
    }
}

/// Collaborators a socket coordinates through
#[derive(Clone)]
pub struct SocketDeps {
    pub store: Arc<dyn SharedStore>,
    /// `None` runs the socket isolated, without cross-context relay
    pub bus: Option<Arc<dyn BusTransport>>,
    pub connector: Arc<dyn Connector>,
    pub clock: Arc<dyn Clock>,
}

impl SocketDeps {
    pub fn new(
        store: Arc<dyn SharedStore>,
        bus: Option<Arc<dyn BusTransport>>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            store,
            bus,
            connector,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Handle to a shared logical socket
///
/// Cloning shares the same socket. Dropping every clone disposes it.
#[derive(Clone)]
pub struct SharedSocket {
    id: String,
    url: String,
    scope: String,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SocketEvent>,
}

impl SharedSocket {
    /// Join the scope for `url` and start competing for leadership
    ///
    /// A missing or failing bus transport is not fatal: the socket runs
    /// isolated and logs a warning.
    pub async fn connect(url: &str, options: SocketOptions, deps: SocketDeps) -> Result<Self> {
        options.validate()?;
        let scope = options.resolve_scope(url)?;
        let id = context_id();

        let bus = match &deps.bus {
            Some(transport) => match Bus::open(transport.as_ref(), &scope).await {
                Ok(bus) => Some(bus),
                Err(e) => {
                    warn!("Bus unavailable for scope {}, running isolated: {}", scope, e);
                    None
                }
            },
            None => {
                warn!("No bus transport for scope {}, running isolated", scope);
                None
            }
        };

        let election = Election::new(
            id.clone(),
            &scope,
            options.election_config(),
            deps.store,
            deps.clock,
        );

        let (events, _) = broadcast::channel(options.event_capacity);
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);

        let orchestrator = Orchestrator::new(
            id.clone(),
            url.to_string(),
            election,
            bus,
            deps.connector,
            events.clone(),
            command_rx,
        );
        tokio::spawn(orchestrator.run());

        info!(id = %id, url = %url, scope = %scope, "Shared socket created");

        Ok(Self {
            id,
            url: url.to_string(),
            scope,
            commands,
            events,
        })
    }

    /// This context's identity
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Receive every event surfaced from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.events.subscribe()
    }

    /// Send a text payload
    ///
    /// Leaders write directly and need an open connection
    /// ([`TetherError::InvalidState`] otherwise). Followers hand the payload
    /// to the leader and return without confirmation.
    pub async fn send(&self, payload: impl Into<String>) -> Result<()> {
        let payload = payload.into();
        self.request(|reply| Command::Send { payload, reply }).await?
    }

    /// Close the socket
    ///
    /// A follower closes only its own view; the shared connection is untouched.
    pub async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<()> {
        self.request(|reply| Command::Close {
            code,
            reason,
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn ready_state(&self) -> Result<ReadyState> {
        Ok(self.status().await?.ready_state)
    }

    /// Release the connection and the claim; later calls fail with `Disposed`
    pub async fn dispose(&self) -> Result<()> {
        self.request(|reply| Command::Dispose { reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| TetherError::Disposed)?;
        response.await.map_err(|_| TetherError::Disposed)
    }
}

impl fmt::Debug for SharedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSocket")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_state_numbers() {
        assert_eq!(u8::from(ReadyState::Connecting), 0);
        assert_eq!(u8::from(ReadyState::Closed), 3);
        assert_eq!(ReadyState::try_from(1), Ok(ReadyState::Open));
        assert!(ReadyState::try_from(4).is_err());
        assert_eq!(ReadyState::Closing.to_string(), "CLOSING");
    }

    #[test]
    fn test_status_snapshot_shape() {
        let status = StatusSnapshot {
            id: "abc".into(),
            url: "ws://h".into(),
            is_leader: true,
            leader_id: Some("abc".into()),
            ready_state: ReadyState::Open,
            buffered_amount: 0,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["isLeader"], true);
        assert_eq!(value["leaderId"], "abc");
        assert_eq!(value["readyState"], 1);
        assert_eq!(value["bufferedAmount"], 0);
    }

    #[test]
    fn test_options_defaults_and_validation() {
        let options: SocketOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, SocketOptions::default());
        assert_eq!(options.heartbeat_ms, 3_000);
        assert_eq!(options.timeout_ms, 9_000);
        assert!(options.validate().is_ok());

        let bad = SocketOptions::default().with_heartbeat_ms(100).with_timeout_ms(50);
        assert!(matches!(bad.validate(), Err(TetherError::Config(_))));
        assert!(SocketOptions::default().with_event_capacity(0).validate().is_err());
        assert!(SocketOptions::default().with_scope("").validate().is_err());
    }

    #[test]
    fn test_scope_resolution() {
        let options = SocketOptions::default();
        assert_eq!(
            options.resolve_scope("ws://localhost:8787/chat").unwrap(),
            "ws://localhost:8787"
        );
        let options = options.with_scope("room-1");
        assert_eq!(options.resolve_scope("ws://localhost:8787").unwrap(), "room-1");
    }
}
