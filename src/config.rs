//! Configuration for the tether binary
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;

use crate::bus::nats::DEFAULT_SUBJECT_PREFIX;
use crate::socket::SocketOptions;

/// Tether - one logical WebSocket shared by many processes
#[derive(Parser, Debug, Clone)]
#[command(name = "tether")]
#[command(about = "Share one WebSocket connection across processes via leader election over NATS")]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false", global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the local echo/broadcast WebSocket server
    EchoServer(EchoServerArgs),
    /// Join a scope and share its connection, sending stdin lines as payloads
    Client(ClientArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct EchoServerArgs {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "127.0.0.1:8787")]
    pub listen: SocketAddr,
}

#[derive(Parser, Debug, Clone)]
pub struct ClientArgs {
    /// Remote WebSocket endpoint
    #[arg(long, env = "TETHER_URL", default_value = "ws://127.0.0.1:8787")]
    pub url: String,

    /// Coordination scope (defaults to the endpoint origin)
    #[arg(long, env = "TETHER_SCOPE")]
    pub scope: Option<String>,

    /// Label for this process in logs and the NATS connection name
    #[arg(long)]
    pub name: Option<String>,

    /// Leader heartbeat and follower poll interval in milliseconds
    #[arg(long, env = "HEARTBEAT_MS", default_value = "3000")]
    pub heartbeat_ms: u64,

    /// Claim staleness threshold in milliseconds
    #[arg(long, env = "TIMEOUT_MS", default_value = "9000")]
    pub timeout_ms: u64,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,

    /// JetStream key-value bucket holding leader claims
    #[arg(long, env = "NATS_KV_BUCKET", default_value = "tether")]
    pub nats_kv_bucket: String,

    /// Subject prefix for bus channels
    #[arg(long, env = "NATS_SUBJECT_PREFIX", default_value = DEFAULT_SUBJECT_PREFIX)]
    pub nats_subject_prefix: String,
}

impl ClientArgs {
    /// Socket options these arguments describe
    pub fn socket_options(&self) -> SocketOptions {
        let options = SocketOptions::default()
            .with_heartbeat_ms(self.heartbeat_ms)
            .with_timeout_ms(self.timeout_ms);
        match &self.scope {
            Some(scope) => options.with_scope(scope.clone()),
            None => options,
        }
    }

    /// Name used for the NATS connection
    pub fn client_name(&self) -> String {
        match &self.name {
            Some(name) => format!("tether-{}", name),
            None => format!("tether-{}", std::process::id()),
        }
    }
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if let Command::Client(client) = &self.command {
            client.socket_options().validate().map_err(|e| e.to_string())?;

            if client.nats.nats_user.is_some() != client.nats.nats_password.is_some() {
                return Err("NATS_USER and NATS_PASSWORD must be set together".to_string());
            }
            if client.nats.nats_kv_bucket.is_empty() {
                return Err("NATS_KV_BUCKET must not be empty".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let args = Args::try_parse_from(["tether", "client"]).unwrap();
        let Command::Client(client) = &args.command else {
            panic!("expected client command");
        };
        assert_eq!(client.url, "ws://127.0.0.1:8787");
        assert_eq!(client.heartbeat_ms, 3000);
        assert_eq!(client.timeout_ms, 9000);
        assert_eq!(client.nats.nats_subject_prefix, DEFAULT_SUBJECT_PREFIX);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_client_overrides() {
        let args = Args::try_parse_from([
            "tether",
            "--log-level",
            "debug",
            "client",
            "--url",
            "ws://example.com/feed",
            "--scope",
            "room",
            "--name",
            "one",
            "--heartbeat-ms",
            "100",
            "--timeout-ms",
            "400",
        ])
        .unwrap();
        assert_eq!(args.log_level, "debug");
        let Command::Client(client) = &args.command else {
            panic!("expected client command");
        };
        let options = client.socket_options();
        assert_eq!(options.scope.as_deref(), Some("room"));
        assert_eq!(options.heartbeat_ms, 100);
        assert_eq!(client.client_name(), "tether-one");
    }

    #[test]
    fn test_rejects_timeout_below_heartbeat() {
        let args = Args::try_parse_from([
            "tether",
            "client",
            "--heartbeat-ms",
            "500",
            "--timeout-ms",
            "500",
        ])
        .unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_echo_server_listen() {
        let args = Args::try_parse_from(["tether", "echo-server", "--listen", "0.0.0.0:9000"]).unwrap();
        let Command::EchoServer(server) = &args.command else {
            panic!("expected echo-server command");
        };
        assert_eq!(server.listen.port(), 9000);
        assert!(args.validate().is_ok());
    }
}
