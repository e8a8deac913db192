//! Local WebSocket echo/broadcast server
//!
//! Every text a client sends is echoed back to it and broadcast to every
//! other client wrapped in a `message` envelope. Joins and leaves are
//! announced to the other clients.

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::types::Result;
use crate::util::random_id;

const WELCOME_NOTE: &str = "Welcome to the tether echo server";

/// Envelopes sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello {
        id: String,
        ts: i64,
        note: String,
    },
    Join {
        id: String,
        ts: i64,
    },
    Message {
        from: String,
        ts: i64,
        /// The client's text, parsed as JSON when it is JSON
        data: serde_json::Value,
        response: String,
    },
    Leave {
        id: String,
        ts: i64,
    },
}

impl ServerMessage {
    /// Envelope for a text received from `from`
    pub fn reply_to(from: &str, text: &str) -> Self {
        let data = serde_json::from_str(text)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string()));
        Self::Message {
            from: from.to_string(),
            ts: now_ms(),
            data,
            response: format!("response to {}", text),
        }
    }

    fn to_text(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

type Clients = DashMap<String, mpsc::UnboundedSender<Message>>;

/// Running echo server; dropping it stops accepting connections
pub struct EchoServer {
    local_addr: SocketAddr,
    clients: Arc<Clients>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EchoServer {
    /// Bind and start serving; port 0 picks a free port
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Echo server listening on ws://{}", local_addr);

        let clients: Arc<Clients> = Arc::new(DashMap::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&clients), shutdown_rx));

        Ok(Self {
            local_addr,
            clients,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients can connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Stop accepting and disconnect every client
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("Echo server on {} stopped", self.local_addr);
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Dropping the senders ends every writer, which closes its socket
        self.clients.clear();
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    clients: Arc<Clients>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("Echo server accept loop shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_client(stream, peer, Arc::clone(&clients)));
                }
                Err(e) => {
                    warn!("Echo server accept failed: {}", e);
                }
            }
        }
    }
}

fn send_to(clients: &Clients, id: &str, message: &ServerMessage) {
    if let (Some(tx), Some(text)) = (clients.get(id), message.to_text()) {
        let _ = tx.send(Message::Text(text));
    }
}

fn broadcast(clients: &Clients, except: Option<&str>, message: &ServerMessage) {
    let Some(text) = message.to_text() else {
        return;
    };
    for entry in clients.iter() {
        if Some(entry.key().as_str()) != except {
            let _ = entry.value().send(Message::Text(text.clone()));
        }
    }
}

async fn serve_client(stream: TcpStream, peer: SocketAddr, clients: Arc<Clients>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let id = random_id(3);
    info!("Client {} connected from {}", id, peer);

    let (mut ws_sink, mut ws_stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    clients.insert(id.clone(), tx);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    send_to(
        &clients,
        &id,
        &ServerMessage::Hello {
            id: id.clone(),
            ts: now_ms(),
            note: WELCOME_NOTE.to_string(),
        },
    );
    broadcast(
        &clients,
        Some(&id),
        &ServerMessage::Join {
            id: id.clone(),
            ts: now_ms(),
        },
    );

    while let Some(frame) = ws_stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
            // Keep reading so the close reply is flushed; the stream ends after it
            Ok(_) => continue,
            Err(e) => {
                warn!("Client {} error: {}", id, e);
                break;
            }
        };
        debug!("<- {}: {}", id, text);

        let reply = ServerMessage::reply_to(&id, &text);
        send_to(&clients, &id, &reply);
        broadcast(&clients, Some(&id), &reply);
    }

    clients.remove(&id);
    writer.abort();
    info!("Client {} disconnected", id);
    broadcast(
        &clients,
        None,
        &ServerMessage::Leave {
            id,
            ts: now_ms(),
        },
    );
}
