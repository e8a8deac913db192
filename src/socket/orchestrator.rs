//! Actor behind a [`SharedSocket`](super::SharedSocket)
//!
//! Owns the election, the bus membership and the real connection. Every
//! input (handle commands, election triggers, connection events, bus
//! messages) is processed one at a time on this task.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::{ReadyState, SocketEvent, StatusSnapshot};
use crate::bus::{Bus, BusMessage, Subscription, SysNotice};
use crate::election::{Election, ElectionEvent, Trigger};
use crate::remote::{
    CloseInfo, ConnectionEvent, ConnectionSink, Connector, RemoteConnection, TaggedEvent,
    CLOSE_NORMAL, CLOSE_NO_STATUS,
};
use crate::types::{Result, TetherError};

pub(crate) enum Command {
    Send {
        payload: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        code: Option<u16>,
        reason: Option<String>,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct Orchestrator {
    id: String,
    url: String,
    election: Election,
    bus: Option<Bus>,
    subscription: Option<Subscription>,
    bus_rx: mpsc::UnboundedReceiver<BusMessage>,
    // Keeps bus_rx open when running isolated
    _bus_tx: mpsc::UnboundedSender<BusMessage>,
    connector: Arc<dyn Connector>,
    connection: Option<Box<dyn RemoteConnection>>,
    generation: u64,
    conn_tx: mpsc::UnboundedSender<TaggedEvent>,
    conn_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    ready_state: ReadyState,
    // Follower closed its own view; relayed opens are ignored until the leader changes
    locally_closed: bool,
    events: broadcast::Sender<SocketEvent>,
    commands: mpsc::Receiver<Command>,
}

impl Orchestrator {
    pub(crate) fn new(
        id: String,
        url: String,
        election: Election,
        bus: Option<Bus>,
        connector: Arc<dyn Connector>,
        events: broadcast::Sender<SocketEvent>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let subscription = bus.as_ref().map(|bus| {
            let forward = bus_tx.clone();
            bus.subscribe(move |message| {
                let _ = forward.send(message);
            })
        });
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        Self {
            id,
            url,
            election,
            bus,
            subscription,
            bus_rx,
            _bus_tx: bus_tx,
            connector,
            connection: None,
            generation: 0,
            conn_tx,
            conn_rx,
            ready_state: ReadyState::Connecting,
            locally_closed: false,
            events,
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        let events = self.election.start().await;
        self.on_election(events);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Dispose { reply }) => {
                        self.dispose().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        debug!(id = %self.id, "All socket handles dropped");
                        self.dispose().await;
                        return;
                    }
                },
                Some(tagged) = self.conn_rx.recv() => self.on_connection_event(tagged),
                Some(message) = self.bus_rx.recv() => self.on_bus_message(message),
                trigger = self.election.next_trigger() => {
                    let events = self.election.handle(trigger).await;
                    self.on_election(events);
                    if trigger == Trigger::Tick {
                        self.announce();
                    }
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { payload, reply } => {
                let _ = reply.send(self.send(payload));
            }
            Command::Close {
                code,
                reason,
                reply,
            } => {
                self.close(code, reason);
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled by the run loop
            Command::Dispose { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn send(&mut self, payload: String) -> Result<()> {
        if !self.election.is_leader() {
            if self.bus.is_none() {
                debug!(id = %self.id, "No bus, dropping delegated send");
            }
            self.post(BusMessage::out(payload));
            return Ok(());
        }

        if self.ready_state != ReadyState::Open {
            return Err(TetherError::InvalidState(format!(
                "cannot send while {}",
                self.ready_state
            )));
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(TetherError::InvalidState("no live connection".into()));
        };
        connection.send(&payload)?;
        self.confirm_sent(payload);
        Ok(())
    }

    fn close(&mut self, code: Option<u16>, reason: Option<String>) {
        if !self.election.is_leader() || self.connection.is_none() {
            // Local view only: passes through Closing straight to Closed
            self.ready_state = ReadyState::Closed;
            self.locally_closed = !self.election.is_leader();
            self.emit(SocketEvent::Close(CloseInfo::clean(
                code.unwrap_or(CLOSE_NORMAL),
                reason.unwrap_or_default(),
            )));
            return;
        }

        if matches!(self.ready_state, ReadyState::Closing | ReadyState::Closed) {
            return;
        }
        self.ready_state = ReadyState::Closing;
        if let Some(connection) = self.connection.as_mut() {
            connection.close(code, reason);
        }
    }

    fn status(&self) -> StatusSnapshot {
        let is_leader = self.election.is_leader();
        let buffered_amount = match (&self.connection, is_leader) {
            (Some(connection), true) => connection.buffered_amount(),
            _ => 0,
        };
        StatusSnapshot {
            id: self.id.clone(),
            url: self.url.clone(),
            is_leader,
            leader_id: self.election.leader_id().map(str::to_string),
            ready_state: self.ready_state,
            buffered_amount,
        }
    }

    fn on_election(&mut self, events: Vec<ElectionEvent>) {
        for event in events {
            match event {
                ElectionEvent::LeadershipChanged { leader_id } => {
                    debug!(id = %self.id, leader = ?leader_id, "Leadership changed");
                    self.locally_closed = false;
                }
                ElectionEvent::LeaderAcquired { .. } => self.open_connection(),
                ElectionEvent::LeaderLost { .. } => self.release_connection(),
            }
        }
    }

    fn open_connection(&mut self) {
        if let Some(mut stale) = self.connection.take() {
            stale.close(None, None);
        }
        self.generation += 1;
        self.ready_state = ReadyState::Connecting;

        info!(id = %self.id, url = %self.url, generation = self.generation, "Opening real connection");
        let sink = ConnectionSink::new(self.generation, self.conn_tx.clone());
        self.connection = Some(self.connector.connect(&self.url, sink));
    }

    fn release_connection(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        info!(id = %self.id, url = %self.url, "Releasing real connection");
        connection.close(None, None);
        // Events still queued from it are now stale
        self.generation += 1;
        self.ready_state = ReadyState::Connecting;
    }

    fn on_connection_event(&mut self, tagged: TaggedEvent) {
        if tagged.generation != self.generation || self.connection.is_none() {
            trace!(generation = tagged.generation, "Ignoring event from discarded connection");
            return;
        }

        match tagged.event {
            ConnectionEvent::Open => {
                info!(id = %self.id, url = %self.url, "Real connection open");
                self.ready_state = ReadyState::Open;
                self.post(BusMessage::sys(SysNotice::Open));
                self.emit(SocketEvent::Open);
            }
            ConnectionEvent::Message(payload) => {
                self.emit(SocketEvent::Message(payload.clone()));
                self.post(BusMessage::inbound(payload));
            }
            ConnectionEvent::Error(description) => {
                warn!(id = %self.id, url = %self.url, "Real connection error: {}", description);
                self.emit(SocketEvent::Error(description));
            }
            ConnectionEvent::Close(info) => {
                info!(id = %self.id, url = %self.url, code = info.code, "Real connection closed");
                self.ready_state = ReadyState::Closed;
                self.emit(SocketEvent::Close(info));
                self.post(BusMessage::sys(SysNotice::Close));
            }
        }
    }

    fn on_bus_message(&mut self, message: BusMessage) {
        let is_leader = self.election.is_leader();

        match message {
            BusMessage::Out { payload } => {
                if !is_leader || self.ready_state != ReadyState::Open {
                    trace!(id = %self.id, "Dropping delegated send");
                    return;
                }
                let Some(connection) = self.connection.as_mut() else {
                    return;
                };
                match connection.send(&payload) {
                    Ok(()) => self.confirm_sent(payload),
                    Err(e) => debug!(id = %self.id, "Delegated send failed: {}", e),
                }
            }
            BusMessage::In { payload } => {
                if !is_leader {
                    self.emit(SocketEvent::Message(payload));
                }
            }
            BusMessage::Sys { notice } => {
                if is_leader {
                    return;
                }
                match notice {
                    SysNotice::Open if self.locally_closed => {
                        trace!(id = %self.id, "Closed locally, ignoring relayed open");
                    }
                    SysNotice::Open if self.ready_state != ReadyState::Open => {
                        self.ready_state = ReadyState::Open;
                        self.emit(SocketEvent::Open);
                    }
                    SysNotice::Close if self.ready_state != ReadyState::Closed => {
                        self.ready_state = ReadyState::Closed;
                        self.emit(SocketEvent::Close(CloseInfo {
                            code: CLOSE_NO_STATUS,
                            reason: String::new(),
                            was_clean: false,
                        }));
                    }
                    _ => {}
                }
            }
            BusMessage::Sent { payload } => {
                // Own posts are never reflected, so this is another context's send
                self.emit(SocketEvent::Sent(payload));
            }
        }
    }

    /// Leader re-announces an open connection so late joiners converge
    fn announce(&self) {
        if self.election.is_leader()
            && self.connection.is_some()
            && self.ready_state == ReadyState::Open
        {
            self.post(BusMessage::sys(SysNotice::Open));
        }
    }

    fn confirm_sent(&self, payload: String) {
        self.post(BusMessage::sent(payload.clone()));
        self.emit(SocketEvent::Sent(payload));
    }

    fn post(&self, message: BusMessage) {
        if let Some(bus) = &self.bus {
            bus.post(&message);
        }
    }

    fn emit(&self, event: SocketEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn dispose(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close(None, None);
            self.generation += 1;
            if self.election.is_leader() && self.ready_state != ReadyState::Closed {
                self.post(BusMessage::sys(SysNotice::Close));
                self.emit(SocketEvent::Close(CloseInfo::clean(CLOSE_NORMAL, "")));
            }
        }
        self.ready_state = ReadyState::Closed;

        self.election.stop().await;
        self.subscription.take();
        if let Some(bus) = self.bus.take() {
            bus.close();
        }
        info!(id = %self.id, url = %self.url, "Shared socket disposed");
    }
}
