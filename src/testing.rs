//! In-process fakes of the broker and the REST backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::ChatApi;
use crate::api::events::{ClientEvent, ServerEvent};
use crate::api::models::{Conversation, Message, MessagePage, OutgoingMessage, SenderType};
use crate::error::{ChatError, ChatResult};
use crate::realtime::backoff::ReconnectPolicy;
use crate::realtime::transport::{Link, Transport};

pub(crate) fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_backoff_ms: 10,
        max_backoff_ms: 100,
        multiplier: 2.0,
        jitter: 0.0,
        max_attempts: 5,
    }
}

/// Poll `check` until it holds, sleeping a little between tries.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub(crate) fn message(conversation_id: &str, id: &str, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_type: SenderType::Candidate,
        sender_id: "cand-1".to_string(),
        body: format!("body of {id}"),
        is_deleted: false,
        created_at: at(secs),
        updated_at: at(secs),
        client_nonce: None,
    }
}

pub(crate) fn received(conversation_id: &str, id: &str, secs: i64) -> ServerEvent {
    ServerEvent::MessageReceived(message(conversation_id, id, secs))
}

pub(crate) fn conversation(id: &str, candidate_id: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        recruiter_id: "rec-1".to_string(),
        candidate_id: candidate_id.to_string(),
        counterpart: None,
        last_message: None,
        last_message_at: None,
        last_message_id: None,
        unread_count: 0,
    }
}

#[derive(Default)]
struct BrokerState {
    sent: Vec<ClientEvent>,
    to_client: Option<mpsc::UnboundedSender<ServerEvent>>,
    server_task: Option<JoinHandle<()>>,
    refuse: u32,
    reject_auth: bool,
    silent: bool,
    stall_open: bool,
    opens: u32,
}

/// Broker double: acknowledges authentication, records every client event,
/// and lets tests push events or cut the link.
#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    pub(crate) fn refuse_next(&self, n: u32) {
        self.state.lock().refuse = n;
    }

    pub(crate) fn reject_auth(&self) {
        self.state.lock().reject_auth = true;
    }

    /// Accept links but never answer authentication.
    pub(crate) fn silence_auth(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Make `open` hang, like a black-holed broker address.
    pub(crate) fn stall_open(&self, stall: bool) {
        self.state.lock().stall_open = stall;
    }

    pub(crate) fn opens(&self) -> u32 {
        self.state.lock().opens
    }

    pub(crate) fn sent(&self) -> Vec<ClientEvent> {
        self.state.lock().sent.clone()
    }

    pub(crate) fn joins(&self, conversation: &str) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|e| matches!(e, ClientEvent::JoinConversation { conversation_id } if conversation_id == conversation))
            .count()
    }

    pub(crate) fn leaves(&self, conversation: &str) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|e| matches!(e, ClientEvent::LeaveConversation { conversation_id } if conversation_id == conversation))
            .count()
    }

    pub(crate) fn push(&self, event: ServerEvent) -> bool {
        match &self.state.lock().to_client {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub(crate) fn drop_connection(&self) {
        let mut state = self.state.lock();
        state.to_client = None;
        if let Some(task) = state.server_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for FakeBroker {
    async fn open(&self) -> ChatResult<Link> {
        let stalled = self.state.lock().stall_open;
        if stalled {
            std::future::pending::<()>().await;
        }
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();
        {
            let mut state = self.state.lock();
            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(ChatError::Transport("connection refused".into()));
            }
            state.opens += 1;
            state.to_client = Some(in_tx);
            if let Some(old) = state.server_task.take() {
                old.abort();
            }
        }

        let shared = self.state.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let mut state = shared.lock();
                if let (ClientEvent::Authenticate { .. }, false) = (&event, state.silent) {
                    let reply = if state.reject_auth {
                        ServerEvent::AuthRejected {
                            reason: "invalid token".into(),
                        }
                    } else {
                        ServerEvent::Authenticated {
                            user_id: "rec-1".into(),
                        }
                    };
                    if let Some(tx) = &state.to_client {
                        let _ = tx.send(reply);
                    }
                }
                state.sent.push(event);
            }
        });
        self.state.lock().server_task = Some(task);

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[derive(Default)]
struct ApiState {
    conversations: Vec<Conversation>,
    pages: HashMap<String, Vec<MessagePage>>,
    sent: Vec<(String, OutgoingMessage)>,
    fail_list: bool,
    fail_send: bool,
    fail_create: bool,
    fetches: usize,
    creates: usize,
}

/// REST double with scripted responses.
#[derive(Clone, Default)]
pub(crate) struct FakeApi {
    state: Arc<Mutex<ApiState>>,
    latency: Duration,
}

impl FakeApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub(crate) fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.state.lock().conversations = conversations;
    }

    /// Pages are served in order for successive fetches; the last one repeats.
    pub(crate) fn set_pages(&self, conversation_id: &str, pages: Vec<MessagePage>) {
        self.state
            .lock()
            .pages
            .insert(conversation_id.to_string(), pages);
    }

    pub(crate) fn fail_list(&self, fail: bool) {
        self.state.lock().fail_list = fail;
    }

    pub(crate) fn fail_send(&self, fail: bool) {
        self.state.lock().fail_send = fail;
    }

    pub(crate) fn fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    pub(crate) fn sent(&self) -> Vec<(String, OutgoingMessage)> {
        self.state.lock().sent.clone()
    }

    pub(crate) fn fetches(&self) -> usize {
        self.state.lock().fetches
    }

    pub(crate) fn creates(&self) -> usize {
        self.state.lock().creates
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_conversations(&self) -> ChatResult<Vec<Conversation>> {
        self.delay().await;
        let state = self.state.lock();
        if state.fail_list {
            return Err(ChatError::Status { status: 503 });
        }
        Ok(state.conversations.clone())
    }

    async fn create_conversation(&self, candidate_id: &str) -> ChatResult<Conversation> {
        self.delay().await;
        let mut state = self.state.lock();
        if state.fail_create {
            return Err(ChatError::Status { status: 503 });
        }
        state.creates += 1;
        if let Some(existing) = state
            .conversations
            .iter()
            .find(|c| c.candidate_id == candidate_id)
        {
            return Ok(existing.clone());
        }
        let created = conversation(&format!("conv-{candidate_id}"), candidate_id);
        state.conversations.push(created.clone());
        Ok(created)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        _cursor: Option<&str>,
    ) -> ChatResult<MessagePage> {
        self.delay().await;
        let mut state = self.state.lock();
        state.fetches += 1;
        let page = match state.pages.get_mut(conversation_id) {
            Some(pages) if pages.len() > 1 => pages.remove(0),
            Some(pages) => pages.first().cloned().unwrap_or_default(),
            None => MessagePage::default(),
        };
        Ok(page)
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        message: &OutgoingMessage,
    ) -> ChatResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        if state.fail_send {
            return Err(ChatError::Status { status: 500 });
        }
        state
            .sent
            .push((conversation_id.to_string(), message.clone()));
        Ok(())
    }
}
