//! Local servers used by the CLI and the integration tests

pub mod echo;

pub use echo::{EchoServer, ServerMessage};
