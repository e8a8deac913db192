//! Tether - one logical WebSocket shared by many processes

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether::{
    config::{Args, ClientArgs, Command, EchoServerArgs},
    nats::NatsClient,
    server::EchoServer,
    NatsKvStore, NatsTransport, SharedSocket, SocketDeps, SocketEvent, StatusSnapshot,
    WsConnector,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Logs go to stderr so socket events on stdout stay readable
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("tether={},info", args.log_level).into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    match args.command {
        Command::EchoServer(server) => run_echo_server(server).await,
        Command::Client(client) => run_client(client).await,
    }
}

async fn run_echo_server(args: EchoServerArgs) -> anyhow::Result<()> {
    let server = EchoServer::bind(args.listen).await?;
    info!("Echo server ready at {}", server.url());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    server.shutdown().await;
    Ok(())
}

async fn run_client(args: ClientArgs) -> anyhow::Result<()> {
    info!("======================================");
    info!("  Tether client");
    info!("======================================");
    info!("Endpoint: {}", args.url);
    info!("Scope: {}", args.scope.as_deref().unwrap_or("(endpoint origin)"));
    info!("Heartbeat: {}ms, timeout: {}ms", args.heartbeat_ms, args.timeout_ms);
    info!("NATS: {}", args.nats.nats_url);
    info!("======================================");

    let nats = NatsClient::new(&args.nats, &args.client_name()).await?;
    let store = NatsKvStore::open(&nats, &args.nats.nats_kv_bucket).await?;
    let transport = NatsTransport::new(nats.clone()).with_prefix(args.nats.nats_subject_prefix.clone());

    let deps = SocketDeps::new(
        Arc::new(store),
        Some(Arc::new(transport)),
        Arc::new(WsConnector::new()),
    );
    let socket = SharedSocket::connect(&args.url, args.socket_options(), deps).await?;
    info!("Context {} joined scope {}", socket.id(), socket.scope());

    let mut events = socket.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} socket events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let watcher = tokio::spawn(watch_role(
        socket.clone(),
        Duration::from_millis(args.heartbeat_ms),
    ));

    println!("Type a line to send it, /status for status, /close to close, Ctrl-D to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => handle_line(&socket, line.trim()).await,
                None => break,
            }
        }
    }

    socket.dispose().await?;
    watcher.abort();
    printer.abort();
    nats.flush().await?;
    info!("Client stopped");
    Ok(())
}

async fn handle_line(socket: &SharedSocket, line: &str) {
    let result = match line {
        "" => Ok(()),
        "/status" => match socket.status().await {
            Ok(status) => {
                match serde_json::to_string_pretty(&status) {
                    Ok(json) => println!("{}", json),
                    Err(e) => println!("[status] {:?} ({})", status, e),
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        "/close" => socket.close(None, None).await,
        payload => socket.send(payload).await,
    };
    if let Err(e) = result {
        println!("[error] {}", e);
    }
}

/// Print the role whenever leadership moves; ends once the socket is disposed
async fn watch_role(socket: SharedSocket, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    let mut last = None;
    loop {
        ticker.tick().await;
        let Ok(status) = socket.status().await else {
            break;
        };
        if let Some(line) = role_change(&mut last, &status) {
            println!("{}", line);
        }
    }
}

type Role = (bool, Option<String>);

/// Describe the role in `status` if it differs from `last`
fn role_change(last: &mut Option<Role>, status: &StatusSnapshot) -> Option<String> {
    let role = (status.is_leader, status.leader_id.clone());
    if last.as_ref() == Some(&role) {
        return None;
    }
    *last = Some(role);
    Some(if status.is_leader {
        format!("[role] leader ({})", status.id)
    } else {
        format!(
            "[role] follower, leader={}",
            status.leader_id.as_deref().unwrap_or("none")
        )
    })
}

fn print_event(event: &SocketEvent) {
    match event {
        SocketEvent::Open => println!("[open]"),
        SocketEvent::Message(payload) => println!("[message] {}", payload),
        SocketEvent::Error(description) => println!("[error] {}", description),
        SocketEvent::Close(info) => println!(
            "[close] code={} reason={:?} clean={}",
            info.code, info.reason, info.was_clean
        ),
        SocketEvent::Sent(payload) => println!("[sent] {}", payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether::ReadyState;

    fn status(is_leader: bool, leader_id: Option<&str>) -> StatusSnapshot {
        StatusSnapshot {
            id: "me".into(),
            url: "ws://x".into(),
            is_leader,
            leader_id: leader_id.map(str::to_string),
            ready_state: ReadyState::Open,
            buffered_amount: 0,
        }
    }

    #[test]
    fn test_role_printed_only_on_change() {
        let mut last = None;
        assert_eq!(
            role_change(&mut last, &status(false, None)),
            Some("[role] follower, leader=none".to_string())
        );
        assert_eq!(role_change(&mut last, &status(false, None)), None);
        assert_eq!(
            role_change(&mut last, &status(false, Some("other"))),
            Some("[role] follower, leader=other".to_string())
        );
        assert_eq!(
            role_change(&mut last, &status(true, Some("me"))),
            Some("[role] leader (me)".to_string())
        );
        assert_eq!(role_change(&mut last, &status(true, Some("me"))), None);
    }
}
