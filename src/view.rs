//! Controller for one mounted conversation.
//!
//! Mounting joins the room, marks the conversation read and starts the first
//! history fetch; pushed events are merged into the stream by a pump task.
//! Teardown cancels outstanding fetches and leaves the room exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::api::ChatApi;
use crate::api::models::Message;
use crate::conversations::ConversationService;
use crate::error::{ChatError, ChatResult};
use crate::realtime::{ConnectionManager, RoomEvent, RoomState, RoomSubscription};
use crate::send::{Draft, SendPipeline};
use crate::stream::{MessageStream, StreamEntry};

/// Everything a view borrows from the session.
#[derive(Clone)]
pub struct ViewContext {
    pub connection: ConnectionManager,
    pub api: Arc<dyn ChatApi>,
    pub conversations: ConversationService,
    pub sender: Arc<SendPipeline>,
}

#[derive(Debug, Default)]
struct HistoryCursor {
    loaded_latest: bool,
    next: Option<String>,
}

struct ViewShared {
    conversation_id: String,
    api: Arc<dyn ChatApi>,
    stream: Mutex<MessageStream>,
    draft: Draft,
    error: Mutex<Option<String>>,
    cursor: Mutex<HistoryCursor>,
    fetches: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    revision: watch::Sender<u64>,
}

impl ViewShared {
    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    fn set_error(&self, err: Option<&ChatError>) {
        *self.error.lock() = err.map(ToString::to_string);
    }

    /// Fetch one page (latest when `cursor` is `None`) and merge it.
    async fn fetch_page(&self, cursor: Option<String>) -> ChatResult<usize> {
        let result = self
            .api
            .fetch_messages(&self.conversation_id, cursor.as_deref())
            .await;
        if self.closed.load(Ordering::SeqCst) {
            log::debug!("Discarding history for closed view {}", self.conversation_id);
            return Err(ChatError::Closed);
        }
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                self.set_error(Some(&err));
                self.bump();
                return Err(err);
            }
        };

        {
            let mut state = self.cursor.lock();
            if cursor.is_some() || !state.loaded_latest {
                state.next = page.next_cursor.clone();
                state.loaded_latest = true;
            }
        }
        let changed = self.stream.lock().hydrate(page.messages);
        self.set_error(None);
        self.bump();
        Ok(changed)
    }

    fn spawn_fetch(self: &Arc<Self>, cursor: Option<String>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            if let Err(e) = shared.fetch_page(cursor).await {
                if !matches!(e, ChatError::Closed) {
                    log::warn!("History fetch for {} failed: {e}", shared.conversation_id);
                }
            }
        });
        let mut fetches = self.fetches.lock();
        fetches.retain(|t| !t.is_finished());
        fetches.push(task);
    }

    fn apply(&self, event: RoomEvent) -> bool {
        let mut stream = self.stream.lock();
        match event {
            RoomEvent::Received(m) => stream.apply_received(m),
            RoomEvent::Updated(m) => stream.apply_updated(m),
            RoomEvent::Deleted { message_id } => {
                stream.apply_deleted(&self.conversation_id, &message_id)
            }
            RoomEvent::Resync => false,
        }
    }
}

pub struct ConversationView {
    conversation_id: String,
    ctx: ViewContext,
    shared: Arc<ViewShared>,
    room_state: watch::Receiver<RoomState>,
    stop: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

impl ConversationView {
    /// Open a conversation. History loads right away; the room joins once
    /// the realtime connection is up. Without one the view can still be
    /// reloaded by hand.
    pub async fn mount(ctx: ViewContext, conversation_id: impl Into<String>) -> ChatResult<Self> {
        let conversation_id = conversation_id.into();
        if conversation_id.trim().is_empty() {
            return Err(ChatError::Validation("conversation id is empty".into()));
        }

        let room = RoomSubscription::join(&ctx.connection, conversation_id.clone());
        let room_state = room.watch_state();
        ctx.conversations.activate(&conversation_id);

        let (revision, _) = watch::channel(0);
        let shared = Arc::new(ViewShared {
            conversation_id: conversation_id.clone(),
            api: ctx.api.clone(),
            stream: Mutex::new(MessageStream::new(conversation_id.clone())),
            draft: Draft::new(),
            error: Mutex::new(None),
            cursor: Mutex::new(HistoryCursor::default()),
            fetches: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            revision,
        });
        shared.spawn_fetch(None);

        let (stop, stop_rx) = oneshot::channel();
        let pump = tokio::spawn(pump(shared.clone(), room, stop_rx));
        ctx.connection.connect_in_background();
        log::info!("Opened conversation {conversation_id}");

        Ok(Self {
            conversation_id,
            ctx,
            shared,
            room_state,
            stop: Some(stop),
            pump: Some(pump),
        })
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Confirmed messages in order, then pending placeholders.
    pub fn messages(&self) -> Vec<StreamEntry> {
        self.shared.stream.lock().entries()
    }

    pub fn confirmed(&self) -> Vec<Message> {
        self.shared.stream.lock().messages().to_vec()
    }

    /// Nothing to show: render the empty state.
    pub fn is_empty(&self) -> bool {
        self.shared.stream.lock().is_empty()
    }

    pub fn state(&self) -> RoomState {
        *self.room_state.borrow()
    }

    pub fn is_realtime(&self) -> bool {
        self.ctx.connection.is_ready()
    }

    /// Last request error, cleared by the next successful fetch.
    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().clone()
    }

    /// Bumped whenever the rendered content may have changed.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn draft(&self) -> String {
        self.shared.draft.text()
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        self.shared.draft.set(text);
    }

    pub async fn send(&self) -> ChatResult<()> {
        let result = self
            .ctx
            .sender
            .send(&self.conversation_id, &self.shared.draft, &self.shared.stream)
            .await;
        self.shared.bump();
        match &result {
            Ok(()) if !self.ctx.connection.is_ready() => {
                // No echo is coming; pick the message up from history instead.
                self.shared.spawn_fetch(None);
            }
            Ok(()) => {}
            Err(err) => self.shared.set_error(Some(err)),
        }
        result
    }

    /// Manual reload: retry realtime and refetch the latest page.
    pub async fn reload(&self) -> ChatResult<usize> {
        if !self.ctx.connection.is_ready() {
            if let Err(e) = self.ctx.connection.ensure_connection().await {
                log::info!("Realtime still unavailable for {}: {e}", self.conversation_id);
            }
        }
        self.shared.fetch_page(None).await
    }

    /// Fetch the next older page. Returns 0 once history is exhausted.
    pub async fn load_older(&self) -> ChatResult<usize> {
        let next = {
            let cursor = self.shared.cursor.lock();
            if cursor.loaded_latest {
                match &cursor.next {
                    Some(next) => Some(next.clone()),
                    None => return Ok(0),
                }
            } else {
                None
            }
        };
        self.shared.fetch_page(next).await
    }

    /// Close the view and wait until its leave has been handed off.
    pub async fn teardown(mut self) {
        self.close();
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                log::warn!("View pump for {} ended abnormally: {e}", self.conversation_id);
            }
        }
    }

    fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.shared.fetches.lock().drain(..) {
            task.abort();
        }
        self.ctx.conversations.deactivate(&self.conversation_id);
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        log::info!("Closed conversation {}", self.conversation_id);
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump(shared: Arc<ViewShared>, mut room: RoomSubscription, mut stop: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            event = room.recv() => match event {
                Some(RoomEvent::Resync) => shared.spawn_fetch(None),
                Some(event) => {
                    if shared.apply(event) {
                        shared.bump();
                    }
                }
                None => break,
            },
        }
    }
    room.leave().await;
}
