//! Tether - one logical WebSocket shared by many contexts
//!
//! Contexts that share a key-value store and a pub/sub bus, but not memory,
//! elect one leader per scope. Only the leader holds the real connection;
//! followers relay sends through it and see its traffic and lifecycle as if
//! they owned the connection themselves.
//!
//! ## Components
//!
//! - **Store**: shared get/set/remove with change notifications (`leader:<scope>` claim)
//! - **Bus**: best-effort fan-out on `bus:<scope>`
//! - **Election**: lease-based leader election over the store
//! - **Socket**: the facade composing election, bus and the real connection
//!
//! In-process adapters (`MemoryStore`, `MemoryTransport`, `LoopbackConnector`)
//! run everything inside one process; the NATS adapters and `WsConnector`
//! span processes.

pub mod bus;
pub mod config;
pub mod election;
pub mod nats;
pub mod remote;
pub mod server;
pub mod socket;
pub mod store;
pub mod types;
pub mod util;

pub use bus::{Bus, BusMessage, BusTransport, MemoryTransport, NatsTransport};
pub use election::{Election, ElectionConfig, ElectionEvent, ElectionState, LeaderClaim};
pub use remote::{CloseInfo, Connector, LoopbackConnector, WsConnector};
pub use socket::{ReadyState, SharedSocket, SocketDeps, SocketEvent, SocketOptions, StatusSnapshot};
pub use store::{MemoryStore, NatsKvStore, SharedStore};
pub use types::{Result, TetherError};
