//! WebSocket connector
//!
//! Each connection runs on its own task. The handle talks to the task over a
//! command queue and never blocks; `buffered_amount` counts bytes queued on
//! that queue but not yet written to the socket.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::{debug, info, warn};

use super::{
    CloseInfo, ConnectionEvent, ConnectionSink, Connector, RemoteConnection, CLOSE_NORMAL,
    CLOSE_NO_STATUS,
};
use crate::types::{Result, TetherError};

enum Command {
    Send(String),
    Close(Option<u16>, Option<String>),
}

/// [`Connector`] for `ws://` and `wss://` endpoints
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str, sink: ConnectionSink) -> Box<dyn RemoteConnection> {
        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        let buffered = Arc::new(AtomicUsize::new(0));

        let task_url = url.to_string();
        let task_buffered = Arc::clone(&buffered);
        tokio::spawn(async move {
            connection_task(task_url, rx, task_buffered, sink).await;
        });

        Box::new(WsConnection {
            commands: tx,
            buffered,
            closing: false,
        })
    }
}

struct WsConnection {
    commands: mpsc::UnboundedSender<Command>,
    buffered: Arc<AtomicUsize>,
    closing: bool,
}

impl RemoteConnection for WsConnection {
    fn send(&mut self, payload: &str) -> Result<()> {
        if self.closing {
            return Err(TetherError::InvalidState("WebSocket is closing".into()));
        }
        self.buffered.fetch_add(payload.len(), Ordering::SeqCst);
        self.commands
            .send(Command::Send(payload.to_string()))
            .map_err(|_| {
                self.buffered.fetch_sub(payload.len(), Ordering::SeqCst);
                TetherError::WebSocket("Connection task has stopped".into())
            })
    }

    fn close(&mut self, code: Option<u16>, reason: Option<String>) {
        if self.closing {
            return;
        }
        self.closing = true;
        // Task already gone means the connection is already closed
        let _ = self.commands.send(Command::Close(code, reason));
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}

fn fail(sink: &ConnectionSink, description: String) {
    sink.emit(ConnectionEvent::Error(description));
    sink.emit(ConnectionEvent::Close(CloseInfo::abnormal()));
}

async fn connection_task(
    url: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    buffered: Arc<AtomicUsize>,
    sink: ConnectionSink,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!("Failed to connect to {}: {}", url, e);
            fail(&sink, e.to_string());
            return;
        }
    };

    info!("Connected to {}", url);
    sink.emit(ConnectionEvent::Open);

    let (mut ws_sink, mut ws_stream) = stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    let len = text.len();
                    let sent = ws_sink.send(Message::Text(text)).await;
                    buffered.fetch_sub(len, Ordering::SeqCst);
                    if let Err(e) = sent {
                        warn!("WebSocket send to {} failed: {}", url, e);
                        fail(&sink, e.to_string());
                        return;
                    }
                }
                Some(Command::Close(code, reason)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code.unwrap_or(CLOSE_NORMAL)),
                        reason: reason.unwrap_or_default().into(),
                    };
                    if let Err(e) = ws_sink.send(Message::Close(Some(frame))).await {
                        debug!("Close handshake with {} failed: {}", url, e);
                        sink.emit(ConnectionEvent::Close(CloseInfo::abnormal()));
                        return;
                    }
                    // Keep reading until the peer answers the close
                }
                None => {
                    // Handle dropped: nobody is listening for events any more
                    let _ = ws_sink.close().await;
                    debug!("Connection handle for {} dropped", url);
                    return;
                }
            },
            frame = ws_stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    sink.emit(ConnectionEvent::Message(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    sink.emit(ConnectionEvent::Message(
                        String::from_utf8_lossy(&data).into_owned(),
                    ));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                        debug!("Failed to answer ping from {}: {}", url, e);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let info = match frame {
                        Some(frame) => CloseInfo::clean(u16::from(frame.code), frame.reason.to_string()),
                        None => CloseInfo::clean(CLOSE_NO_STATUS, ""),
                    };
                    info!("Connection to {} closed ({})", url, info.code);
                    // Flush the queued close reply
                    let _ = ws_sink.flush().await;
                    sink.emit(ConnectionEvent::Close(info));
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error from {}: {}", url, e);
                    fail(&sink, e.to_string());
                    return;
                }
                None => {
                    debug!("Stream from {} ended without a close frame", url);
                    sink.emit(ConnectionEvent::Close(CloseInfo::abnormal()));
                    return;
                }
            }
        }
    }
}
