//! WebSocket connector and shared socket against the local echo server

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

use tether::remote::{ConnectionEvent, ConnectionSink, TaggedEvent};
use tether::server::{EchoServer, ServerMessage};
use tether::{
    CloseInfo, Connector, MemoryStore, MemoryTransport, SharedSocket, SocketDeps, SocketEvent,
    SocketOptions, WsConnector,
};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> EchoServer {
    EchoServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
}

async fn next_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<TaggedEvent>) -> ConnectionEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for connection event")
        .expect("connection event stream ended")
        .event
}

fn parse(payload: &str) -> ServerMessage {
    serde_json::from_str(payload).expect("server sent an unknown envelope")
}

/// Wait for a message event whose envelope satisfies `check`
async fn expect_envelope(
    rx: &mut broadcast::Receiver<SocketEvent>,
    check: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(SocketEvent::Message(payload)) => {
                    let envelope = parse(&payload);
                    if check(&envelope) {
                        return envelope;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for server envelope")
}

// ============================================================================
// Connector
// ============================================================================

#[tokio::test]
async fn test_connector_open_echo_close() {
    let server = start_server().await;
    let (sink, mut rx) = ConnectionSink::channel(1);
    let mut conn = WsConnector::new().connect(&server.url(), sink);

    assert_eq!(next_event(&mut rx).await, ConnectionEvent::Open);
    let ConnectionEvent::Message(hello) = next_event(&mut rx).await else {
        panic!("expected hello");
    };
    assert!(matches!(parse(&hello), ServerMessage::Hello { .. }));

    conn.send("ping").unwrap();
    let ConnectionEvent::Message(reply) = next_event(&mut rx).await else {
        panic!("expected echo");
    };
    match parse(&reply) {
        ServerMessage::Message { data, response, .. } => {
            assert_eq!(data, serde_json::json!("ping"));
            assert_eq!(response, "response to ping");
        }
        other => panic!("unexpected envelope {:?}", other),
    }

    conn.close(Some(1000), Some("done".into()));
    assert_eq!(
        next_event(&mut rx).await,
        ConnectionEvent::Close(CloseInfo::clean(1000, "done"))
    );
    assert_eq!(conn.buffered_amount(), 0);
}

#[tokio::test]
async fn test_connector_sees_server_shutdown() {
    let server = start_server().await;
    let (sink, mut rx) = ConnectionSink::channel(1);
    let _conn = WsConnector::new().connect(&server.url(), sink);

    assert_eq!(next_event(&mut rx).await, ConnectionEvent::Open);
    // hello
    next_event(&mut rx).await;

    server.shutdown().await;
    let closed = timeout(WAIT, async {
        loop {
            if let ConnectionEvent::Close(info) = next_event(&mut rx).await {
                return info;
            }
        }
    })
    .await
    .unwrap();
    assert!(closed.was_clean);
}

#[tokio::test]
async fn test_server_broadcasts_between_clients() {
    let server = start_server().await;
    let (sink_a, mut rx_a) = ConnectionSink::channel(1);
    let (sink_b, mut rx_b) = ConnectionSink::channel(2);
    let mut a = WsConnector::new().connect(&server.url(), sink_a);
    let _b = WsConnector::new().connect(&server.url(), sink_b);

    assert_eq!(next_event(&mut rx_a).await, ConnectionEvent::Open);
    assert_eq!(next_event(&mut rx_b).await, ConnectionEvent::Open);

    // wait until both are registered so the broadcast reaches b
    timeout(WAIT, async {
        while server.client_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    a.send(r#"{"n":1}"#).unwrap();
    let relayed = timeout(WAIT, async {
        loop {
            if let ConnectionEvent::Message(payload) = next_event(&mut rx_b).await {
                if let ServerMessage::Message { data, .. } = parse(&payload) {
                    return data;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(relayed, serde_json::json!({"n": 1}));
}

// ============================================================================
// Shared socket end to end
// ============================================================================

#[tokio::test]
async fn test_shared_socket_relays_through_real_server() {
    let server = start_server().await;
    let store = MemoryStore::new();
    let bus = MemoryTransport::new();
    let deps = SocketDeps::new(
        Arc::new(store.clone()),
        Some(Arc::new(bus.clone())),
        Arc::new(WsConnector::new()),
    );
    let options = SocketOptions::default()
        .with_heartbeat_ms(100)
        .with_timeout_ms(400);

    let leader = SharedSocket::connect(&server.url(), options.clone(), deps.clone())
        .await
        .unwrap();
    let mut leader_events = leader.subscribe();
    expect_envelope(&mut leader_events, |m| matches!(m, ServerMessage::Hello { .. })).await;

    let follower = SharedSocket::connect(&server.url(), options, deps).await.unwrap();
    let mut follower_events = follower.subscribe();
    assert_eq!(follower.scope(), leader.scope());

    follower.send("relay me").await.unwrap();

    let echoed = expect_envelope(&mut follower_events, |m| {
        matches!(m, ServerMessage::Message { response, .. } if response == "response to relay me")
    })
    .await;
    assert!(matches!(echoed, ServerMessage::Message { .. }));
    expect_envelope(&mut leader_events, |m| {
        matches!(m, ServerMessage::Message { response, .. } if response == "response to relay me")
    })
    .await;

    // only the leader connected to the server
    assert_eq!(server.client_count(), 1);

    leader.dispose().await.unwrap();
    follower.dispose().await.unwrap();
    server.shutdown().await;
}
