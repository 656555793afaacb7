//! One shared realtime connection per session.
//!
//! The manager owns the link, the authentication handshake and the reconnect
//! loop. Consumers never see the socket: they get broadcast receivers for
//! pushed events and connection signals, and a cheap [`Connection`] handle to
//! emit client events on the live link.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::api::events::{ClientEvent, ServerEvent};
use crate::error::{ChatError, ChatResult};
use crate::realtime::backoff::{Backoff, ReconnectPolicy};
use crate::realtime::transport::{Link, Transport};

const EVENT_BUFFER: usize = 512;
const SIGNAL_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    Reconnecting { attempt: u32 },
    Unavailable,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    Connected { generation: u64 },
    /// A new link replaced one that dropped. Channel membership did not survive.
    Reconnected { generation: u64 },
    Dropped,
    Unavailable,
}

/// Handle on one authenticated link. Each link gets a fresh generation number.
#[derive(Debug, Clone)]
pub struct Connection {
    generation: u64,
    outgoing: mpsc::UnboundedSender<ClientEvent>,
}

impl Connection {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        !self.outgoing.is_closed()
    }

    pub fn emit(&self, event: ClientEvent) -> ChatResult<()> {
        self.try_emit(event).map_err(|_| {
            ChatError::Transport(format!("connection {} is closed", self.generation))
        })
    }

    fn try_emit(&self, event: ClientEvent) -> Result<(), ClientEvent> {
        self.outgoing.send(event).map_err(|e| e.0)
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    token: String,
    policy: ReconnectPolicy,
    handshake_timeout: Duration,
    live: Mutex<Option<Connection>>,
    // Lock order: `pending` before `live`.
    pending: Mutex<Vec<ClientEvent>>,
    connecting: tokio::sync::Mutex<()>,
    state: watch::Sender<ConnectionState>,
    signals: broadcast::Sender<ConnectionSignal>,
    events: broadcast::Sender<ServerEvent>,
    generation: AtomicU64,
    // Either the pump of the live link or a running reconnect loop.
    background: Mutex<Option<JoinHandle<()>>>,
    reconnecting: AtomicBool,
    disposed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        token: impl Into<String>,
        policy: ReconnectPolicy,
        handshake_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (signals, _) = broadcast::channel(SIGNAL_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                transport,
                token: token.into(),
                policy,
                handshake_timeout,
                live: Mutex::new(None),
                pending: Mutex::new(Vec::new()),
                connecting: tokio::sync::Mutex::new(()),
                state,
                signals,
                events,
                generation: AtomicU64::new(0),
                background: Mutex::new(None),
                reconnecting: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// The live connection, if there is one. Never connects.
    pub fn get_connection(&self) -> Option<Connection> {
        self.inner.live_connection()
    }

    /// Return the live connection, connecting and authenticating first if
    /// needed. Concurrent callers share a single connection attempt.
    pub async fn ensure_connection(&self) -> ChatResult<Connection> {
        if let Some(conn) = self.get_connection() {
            return Ok(conn);
        }
        let _guard = self.inner.connecting.lock().await;
        if let Some(conn) = self.get_connection() {
            return Ok(conn);
        }
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(ChatError::Closed);
        }

        self.inner.state.send_replace(ConnectionState::Connecting);
        match self.inner.establish().await {
            Ok(link) => Inner::install(&self.inner, link, false),
            Err(err) => {
                log::warn!("Realtime connection unavailable: {err}");
                self.inner.state.send_replace(ConnectionState::Unavailable);
                let _ = self.inner.signals.send(ConnectionSignal::Unavailable);
                if !matches!(err, ChatError::AuthRejected(_))
                    && !self.inner.reconnecting.load(Ordering::SeqCst)
                {
                    let task = tokio::spawn(reconnect(self.inner.clone()));
                    *self.inner.background.lock() = Some(task);
                }
                Err(err)
            }
        }
    }

    /// Start connecting without waiting for the outcome. Failures degrade to
    /// the background reconnect loop.
    pub fn connect_in_background(&self) {
        if self.get_connection().is_some() || self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.ensure_connection().await {
                log::info!("Continuing without realtime updates: {e}");
            }
        });
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready && self.get_connection().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn signals(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.inner.signals.subscribe()
    }

    /// Every event pushed on any live link, across reconnects.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Send on the live link, or hold the event until the next link is up.
    pub fn emit_or_queue(&self, event: ClientEvent) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            log::debug!("Dropping {event:?}: connection manager disposed");
            return;
        }
        let mut pending = self.inner.pending.lock();
        let event = match self.inner.live_connection() {
            Some(conn) => match conn.try_emit(event) {
                Ok(()) => return,
                Err(event) => event,
            },
            None => event,
        };
        log::debug!("No live connection, queueing {event:?}");
        pending.push(event);
    }

    /// End of session: close the link and stop reconnecting.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inner.background.lock().take() {
            task.abort();
        }
        self.inner.pending.lock().clear();
        self.inner.live.lock().take();
        self.inner.state.send_replace(ConnectionState::Closed);
        log::info!("Realtime connection closed");
    }
}

impl Inner {
    fn live_connection(&self) -> Option<Connection> {
        self.live.lock().as_ref().filter(|c| c.is_live()).cloned()
    }

    /// Open a link and authenticate it, all within the handshake timeout.
    async fn establish(&self) -> ChatResult<Link> {
        tokio::time::timeout(self.handshake_timeout, self.open_authenticated())
            .await
            .map_err(|_| ChatError::Transport("connection handshake timed out".into()))?
    }

    async fn open_authenticated(&self) -> ChatResult<Link> {
        let mut link = self.transport.open().await?;
        link.outgoing
            .send(ClientEvent::Authenticate {
                token: self.token.clone(),
            })
            .map_err(|_| ChatError::Transport("link closed before handshake".into()))?;

        match link.incoming.recv().await {
            Some(ServerEvent::Authenticated { user_id }) => {
                log::info!("Realtime session authenticated as {user_id}");
                Ok(link)
            }
            Some(ServerEvent::AuthRejected { reason }) => Err(ChatError::AuthRejected(reason)),
            Some(other) => Err(ChatError::Protocol(format!(
                "expected authentication reply, got {other:?}"
            ))),
            None => Err(ChatError::Transport("link closed during handshake".into())),
        }
    }

    /// Make `link` the live connection. Queued events go out before anyone
    /// hears about the new link.
    fn install(inner: &Arc<Inner>, link: Link, reconnected: bool) -> ChatResult<Connection> {
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(ChatError::Closed);
        }
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = Connection {
            generation,
            outgoing: link.outgoing,
        };
        {
            let mut pending = inner.pending.lock();
            for event in pending.drain(..) {
                if let Err(event) = conn.try_emit(event) {
                    log::warn!("Lost queued {event:?}: link closed during flush");
                }
            }
            *inner.live.lock() = Some(conn.clone());
        }

        let pump = tokio::spawn(pump(inner.clone(), generation, link.incoming));
        *inner.background.lock() = Some(pump);

        inner.state.send_replace(ConnectionState::Ready);
        let signal = if reconnected {
            ConnectionSignal::Reconnected { generation }
        } else {
            ConnectionSignal::Connected { generation }
        };
        let _ = inner.signals.send(signal);
        log::info!("Realtime connection {generation} ready");
        Ok(conn)
    }
}

async fn pump(
    inner: Arc<Inner>,
    generation: u64,
    mut incoming: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = incoming.recv().await {
        match event {
            ServerEvent::Authenticated { .. } => {
                log::debug!("Ignoring repeated authentication reply on connection {generation}")
            }
            ServerEvent::AuthRejected { reason } => {
                log::warn!("Broker revoked session on connection {generation}: {reason}")
            }
            event => {
                // No receivers just means nothing is listening right now.
                let _ = inner.events.send(event);
            }
        }
    }

    if inner.disposed.load(Ordering::SeqCst) {
        return;
    }
    {
        let mut live = inner.live.lock();
        if live.as_ref().map(|c| c.generation) != Some(generation) {
            return;
        }
        *live = None;
    }
    log::warn!("Realtime connection {generation} dropped, reconnecting");
    inner
        .state
        .send_replace(ConnectionState::Reconnecting { attempt: 0 });
    let _ = inner.signals.send(ConnectionSignal::Dropped);
    reconnect(inner).await;
}

async fn reconnect(inner: Arc<Inner>) {
    if inner.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }
    let mut backoff = Backoff::new(inner.policy.clone());
    let recovered = loop {
        let Some(delay) = backoff.next_delay() else {
            break false;
        };
        let attempt = backoff.attempt();
        inner
            .state
            .send_replace(ConnectionState::Reconnecting { attempt });
        log::info!("Reconnect attempt {attempt} in {delay:?}");
        tokio::time::sleep(delay).await;
        if inner.disposed.load(Ordering::SeqCst) {
            inner.reconnecting.store(false, Ordering::SeqCst);
            return;
        }

        let _guard = inner.connecting.lock().await;
        if inner.live_connection().is_some() {
            break true;
        }
        match inner.establish().await {
            Ok(link) => match Inner::install(&inner, link, true) {
                Ok(_) => break true,
                Err(_) => {
                    inner.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
            },
            Err(ChatError::AuthRejected(reason)) => {
                log::error!("Realtime authentication rejected: {reason}");
                break false;
            }
            Err(e) => log::warn!("Reconnect attempt {attempt} failed: {e}"),
        }
    };
    inner.reconnecting.store(false, Ordering::SeqCst);
    if !recovered {
        log::warn!("Realtime connection unavailable, falling back to manual reload");
        inner.state.send_replace(ConnectionState::Unavailable);
        let _ = inner.signals.send(ConnectionSignal::Unavailable);
    }
}
