//! Channel membership for one open conversation.
//!
//! [`RoomSubscription::join`] spawns a small task that owns the membership:
//! it emits the join on the current link, re-emits it on every new link, and
//! emits exactly one leave when the handle is released. The handle only ever
//! yields events for its own conversation.

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::api::events::{ClientEvent, ServerEvent};
use crate::api::models::Message;
use crate::realtime::connection::{ConnectionManager, ConnectionSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Closed,
    Joining,
    Open,
    Disconnected,
    Rejoining,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Received(Message),
    Updated(Message),
    Deleted { message_id: String },
    /// Pushed events may have been missed; refetch history to catch up.
    Resync,
}

pub struct RoomSubscription {
    conversation_id: String,
    events: mpsc::UnboundedReceiver<RoomEvent>,
    state: watch::Receiver<RoomState>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RoomSubscription {
    /// Join the conversation's channel now if a link is up, otherwise as soon
    /// as one is. Dropping the handle leaves the channel.
    pub fn join(manager: &ConnectionManager, conversation_id: impl Into<String>) -> Self {
        let conversation_id = conversation_id.into();
        // Subscribe before looking at the connection so no signal slips by.
        let signals = manager.signals();
        let pushed = manager.events();
        let (out, events) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(RoomState::Joining);
        let (stop, stop_rx) = oneshot::channel();

        let member = Membership {
            manager: manager.clone(),
            conversation_id: conversation_id.clone(),
            joined: None,
            missed_pushes: false,
            state: state_tx,
            out,
        };
        let task = tokio::spawn(member.run(signals, pushed, stop_rx));
        Self {
            conversation_id,
            events,
            state,
            stop,
            task,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn recv(&mut self) -> Option<RoomEvent> {
        self.events.recv().await
    }

    pub fn state(&self) -> RoomState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RoomState> {
        self.state.clone()
    }

    /// Leave the channel and wait until the leave has been handed to the
    /// connection manager.
    pub async fn leave(self) {
        let RoomSubscription {
            conversation_id,
            stop,
            task,
            ..
        } = self;
        let _ = stop.send(());
        if let Err(e) = task.await {
            log::warn!("Room task for {conversation_id} ended abnormally: {e}");
        }
    }
}

struct Membership {
    manager: ConnectionManager,
    conversation_id: String,
    /// Generation of the link we last joined on.
    joined: Option<u64>,
    missed_pushes: bool,
    state: watch::Sender<RoomState>,
    out: mpsc::UnboundedSender<RoomEvent>,
}

impl Membership {
    async fn run(
        mut self,
        mut signals: broadcast::Receiver<ConnectionSignal>,
        mut pushed: broadcast::Receiver<ServerEvent>,
        mut stop: oneshot::Receiver<()>,
    ) {
        if self.manager.get_connection().is_none() {
            self.missed_pushes = true;
        }
        self.sync_with_connection();

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                signal = signals.recv() => match signal {
                    Ok(signal) => self.on_signal(signal),
                    Err(RecvError::Lagged(_)) => self.sync_with_connection(),
                    Err(RecvError::Closed) => break,
                },
                event = pushed.recv() => match event {
                    Ok(event) => self.forward(event),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Room {} skipped {skipped} pushed events", self.conversation_id);
                        let _ = self.out.send(RoomEvent::Resync);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        self.finish();
    }

    fn on_signal(&mut self, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::Connected { .. } | ConnectionSignal::Reconnected { .. } => {
                self.sync_with_connection()
            }
            ConnectionSignal::Dropped | ConnectionSignal::Unavailable => {
                self.missed_pushes = true;
                if self.joined.is_some() {
                    self.state.send_replace(RoomState::Disconnected);
                }
            }
        }
    }

    /// Join the live link unless we already did.
    fn sync_with_connection(&mut self) {
        let Some(conn) = self.manager.get_connection() else {
            if self.joined.is_some() {
                self.state.send_replace(RoomState::Disconnected);
            }
            return;
        };
        if self.joined == Some(conn.generation()) {
            return;
        }
        if self.joined.is_some() {
            // Membership does not survive a new link, and neither do pushes in between.
            self.missed_pushes = true;
            self.state.send_replace(RoomState::Rejoining);
        }
        let join = ClientEvent::JoinConversation {
            conversation_id: self.conversation_id.clone(),
        };
        match conn.emit(join) {
            Ok(()) => {
                log::debug!(
                    "Joined {} on connection {}",
                    self.conversation_id,
                    conn.generation()
                );
                self.joined = Some(conn.generation());
                self.state.send_replace(RoomState::Open);
                if std::mem::take(&mut self.missed_pushes) {
                    let _ = self.out.send(RoomEvent::Resync);
                }
            }
            Err(e) => log::debug!("Join of {} deferred: {e}", self.conversation_id),
        }
    }

    fn forward(&self, event: ServerEvent) {
        if event.conversation_id() != Some(self.conversation_id.as_str()) {
            return;
        }
        let event = match event {
            ServerEvent::MessageReceived(m) => RoomEvent::Received(m),
            ServerEvent::MessageUpdated(m) => RoomEvent::Updated(m),
            ServerEvent::MessageDeleted { message_id, .. } => RoomEvent::Deleted { message_id },
            ServerEvent::Authenticated { .. } | ServerEvent::AuthRejected { .. } => return,
        };
        let _ = self.out.send(event);
    }

    fn finish(&mut self) {
        if self.joined.is_some() {
            self.manager.emit_or_queue(ClientEvent::LeaveConversation {
                conversation_id: self.conversation_id.clone(),
            });
            log::debug!("Left {}", self.conversation_id);
        }
        self.state.send_replace(RoomState::Closed);
    }
}
