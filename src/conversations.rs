//! The recruiter's conversation list, kept current from pushed events.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::api::ChatApi;
use crate::api::events::ServerEvent;
use crate::api::models::{Conversation, Message, SenderType};
use crate::error::{ChatError, ChatResult};
use crate::storage::ConversationCache;

/// How many message ids we remember to keep redeliveries out of the unread count.
const SEEN_CAPACITY: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListUpdate {
    Applied,
    Ignored,
    /// The message belongs to a conversation we have not loaded.
    UnknownConversation,
}

#[derive(Debug, Default)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    /// Returns false if the id was already recorded.
    fn insert(&mut self, key: String) -> bool {
        if !self.ids.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct ConversationList {
    entries: HashMap<String, Conversation>,
    active: Option<String>,
    seen: SeenIds,
}

impl ConversationList {
    pub fn new(conversations: Vec<Conversation>) -> Self {
        let mut list = Self::default();
        list.replace(conversations);
        list
    }

    /// Swap in a freshly fetched list. The active conversation stays read.
    pub fn replace(&mut self, conversations: Vec<Conversation>) {
        self.entries = conversations
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        if let Some(active) = self.active.clone() {
            self.mark_read(&active);
        }
    }

    pub fn upsert(&mut self, conversation: Conversation) {
        self.entries.insert(conversation.id.clone(), conversation);
    }

    pub fn get(&self, conversation_id: &str) -> Option<&Conversation> {
        self.entries.get(conversation_id)
    }

    pub fn find_by_candidate(&self, candidate_id: &str) -> Option<&Conversation> {
        self.entries.values().find(|c| c.candidate_id == candidate_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn set_active(&mut self, conversation_id: Option<&str>) {
        self.active = conversation_id.map(str::to_string);
    }

    pub fn on_message_received(&mut self, msg: &Message) -> ListUpdate {
        let is_active = self.active.as_deref() == Some(msg.conversation_id.as_str());
        let Some(conv) = self.entries.get_mut(&msg.conversation_id) else {
            log::debug!(
                "message {} for unknown conversation {}",
                msg.id,
                msg.conversation_id
            );
            return ListUpdate::UnknownConversation;
        };
        if !self.seen.insert(seen_key(msg)) {
            log::debug!("redelivered message {} not counted again", msg.id);
            return ListUpdate::Ignored;
        }

        let newer = conv.last_message_at.is_none_or(|at| msg.created_at >= at);
        if newer {
            conv.last_message = Some(msg.body.clone());
            conv.last_message_at = Some(msg.created_at);
            conv.last_message_id = Some(msg.id.clone());
        }
        if !is_active && msg.sender_type == SenderType::Candidate {
            conv.unread_count = conv.unread_count.saturating_add(1);
        }
        ListUpdate::Applied
    }

    /// Refresh the preview if it was taken from this message.
    pub fn on_message_updated(&mut self, msg: &Message) -> ListUpdate {
        match self.entries.get_mut(&msg.conversation_id) {
            Some(conv) if conv.last_message_id.as_deref() == Some(msg.id.as_str()) => {
                conv.last_message = Some(msg.body.clone());
                ListUpdate::Applied
            }
            Some(_) => ListUpdate::Ignored,
            None => ListUpdate::UnknownConversation,
        }
    }

    pub fn on_message_deleted(&mut self, conversation_id: &str, message_id: &str) -> ListUpdate {
        match self.entries.get_mut(conversation_id) {
            Some(conv) if conv.last_message_id.as_deref() == Some(message_id) => {
                conv.last_message = Some(String::new());
                ListUpdate::Applied
            }
            Some(_) => ListUpdate::Ignored,
            None => ListUpdate::UnknownConversation,
        }
    }

    pub fn mark_read(&mut self, conversation_id: &str) {
        if let Some(conv) = self.entries.get_mut(conversation_id) {
            conv.unread_count = 0;
        }
    }

    pub fn total_unread(&self) -> u32 {
        self.entries
            .values()
            .fold(0u32, |total, c| total.saturating_add(c.unread_count))
    }

    /// Most recent activity first; conversations without messages last; ties by id.
    pub fn sorted(&self) -> Vec<Conversation> {
        let mut out: Vec<Conversation> = self.entries.values().cloned().collect();
        out.sort_by(compare_activity);
        out
    }

    /// Apply an event that arrived before its conversation was loaded. A
    /// freshly fetched summary that already reflects the message is left as
    /// is, so the message is not counted twice.
    fn apply_refetched(&mut self, event: &ServerEvent) -> ListUpdate {
        if let ServerEvent::MessageReceived(msg) = event {
            let covered = self.entries.get(&msg.conversation_id).is_some_and(|conv| {
                conv.last_message_id.as_deref() == Some(msg.id.as_str())
                    || conv.last_message_at.is_some_and(|at| at >= msg.created_at)
            });
            if covered {
                self.seen.insert(seen_key(msg));
                return ListUpdate::Ignored;
            }
        }
        self.apply(event)
    }

    fn apply(&mut self, event: &ServerEvent) -> ListUpdate {
        match event {
            ServerEvent::MessageReceived(m) => self.on_message_received(m),
            ServerEvent::MessageUpdated(m) => self.on_message_updated(m),
            ServerEvent::MessageDeleted {
                conversation_id,
                message_id,
            } => self.on_message_deleted(conversation_id, message_id),
            ServerEvent::Authenticated { .. } | ServerEvent::AuthRejected { .. } => {
                ListUpdate::Ignored
            }
        }
    }
}

fn seen_key(msg: &Message) -> String {
    format!("{}/{}", msg.conversation_id, msg.id)
}

fn compare_activity(a: &Conversation, b: &Conversation) -> Ordering {
    match (a.last_message_at, b.last_message_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}

/// Shared handle over the list plus the fetch, cache and feed around it.
#[derive(Clone)]
pub struct ConversationService {
    api: Arc<dyn ChatApi>,
    list: Arc<Mutex<ConversationList>>,
    cache: Option<Arc<Mutex<ConversationCache>>>,
    feed: Arc<Mutex<Option<JoinHandle<()>>>>,
    recruiter_id: Option<String>,
}

impl ConversationService {
    pub fn new(api: Arc<dyn ChatApi>, cache: Option<ConversationCache>) -> Self {
        Self {
            api,
            list: Arc::new(Mutex::new(ConversationList::default())),
            cache: cache.map(|c| Arc::new(Mutex::new(c))),
            feed: Arc::new(Mutex::new(None)),
            recruiter_id: None,
        }
    }

    /// Only keep conversations owned by this recruiter.
    pub fn for_recruiter(mut self, recruiter_id: Option<String>) -> Self {
        self.recruiter_id = recruiter_id.filter(|id| !id.trim().is_empty());
        self
    }

    fn owned(&self, mut items: Vec<Conversation>) -> Vec<Conversation> {
        if let Some(recruiter) = &self.recruiter_id {
            let before = items.len();
            items.retain(|c| &c.recruiter_id == recruiter);
            if items.len() != before {
                log::debug!("Dropped {} conversations of other recruiters", before - items.len());
            }
        }
        items
    }

    /// Show whatever the cache has before the first fetch lands.
    pub fn load_cached(&self) -> usize {
        let Some(cache) = &self.cache else {
            return 0;
        };
        let loaded = cache.lock().load(None);
        match loaded.map(|cached| self.owned(cached)) {
            Ok(cached) if !cached.is_empty() => {
                let n = cached.len();
                self.list.lock().replace(cached);
                n
            }
            Ok(_) => 0,
            Err(e) => {
                log::warn!("Failed to read conversation cache: {e}");
                0
            }
        }
    }

    /// Fetch the recruiter's conversations. Falls back to the cache when the
    /// request fails and the cache has something to show.
    pub async fn list(&self) -> ChatResult<Vec<Conversation>> {
        match self.api.list_conversations().await {
            Ok(items) => {
                let items = self.owned(items);
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.lock().upsert(&items) {
                        log::warn!("Failed to cache conversations: {e}");
                    }
                }
                let mut list = self.list.lock();
                list.replace(items);
                Ok(list.sorted())
            }
            Err(err) => {
                log::warn!("Failed to load conversations: {err}");
                if self.load_cached() > 0 {
                    Ok(self.snapshot())
                } else {
                    Err(err)
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Conversation> {
        self.list.lock().sorted()
    }

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.list.lock().get(conversation_id).cloned()
    }

    pub fn total_unread(&self) -> u32 {
        self.list.lock().total_unread()
    }

    /// The conversation is now on screen: stop counting and clear its badge.
    pub fn activate(&self, conversation_id: &str) {
        let mut list = self.list.lock();
        list.set_active(Some(conversation_id));
        list.mark_read(conversation_id);
    }

    pub fn deactivate(&self, conversation_id: &str) {
        let mut list = self.list.lock();
        if list.active() == Some(conversation_id) {
            list.set_active(None);
        }
    }

    /// Conversation id for a candidate, creating the conversation if needed.
    pub async fn resolve(&self, candidate_id: &str) -> ChatResult<String> {
        let candidate_id = candidate_id.trim();
        if candidate_id.is_empty() {
            return Err(ChatError::Validation("candidate id is empty".into()));
        }
        if let Some(existing) = self.list.lock().find_by_candidate(candidate_id) {
            return Ok(existing.id.clone());
        }
        let conversation = match self.api.create_conversation(candidate_id).await {
            Ok(conversation) => conversation,
            Err(err) => return self.cached_for(candidate_id).ok_or(err),
        };
        let id = conversation.id.clone();
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.lock().upsert(std::slice::from_ref(&conversation)) {
                log::warn!("Failed to cache conversation {id}: {e}");
            }
        }
        self.list.lock().upsert(conversation);
        Ok(id)
    }

    fn cached_for(&self, candidate_id: &str) -> Option<String> {
        let cache = self.cache.as_ref()?;
        match cache.lock().find_by_candidate(candidate_id) {
            Ok(Some(id)) => {
                log::warn!("Resolved candidate {candidate_id} from the cache");
                Some(id)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Failed to read conversation cache: {e}");
                None
            }
        }
    }

    /// Apply pushed events in the background until stopped.
    pub fn start_feed(&self, events: broadcast::Receiver<ServerEvent>) {
        let task = tokio::spawn(self.clone().run_feed(events));
        if let Some(old) = self.feed.lock().replace(task) {
            old.abort();
        }
    }

    pub fn stop_feed(&self) {
        if let Some(task) = self.feed.lock().take() {
            task.abort();
        }
    }

    async fn run_feed(self, mut events: broadcast::Receiver<ServerEvent>) {
        let mut refreshing = false;
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Conversation feed skipped {skipped} events, refetching");
                    refreshing = true;
                    self.refresh().await;
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let update = self.list.lock().apply(&event);
            if update == ListUpdate::UnknownConversation && !refreshing {
                refreshing = true;
                self.refresh().await;
                self.list.lock().apply_refetched(&event);
            } else if update == ListUpdate::Applied {
                refreshing = false;
            }
        }
    }

    async fn refresh(&self) {
        if let Err(e) = self.list().await {
            log::warn!("Conversation list refresh failed: {e}");
        }
    }
}
