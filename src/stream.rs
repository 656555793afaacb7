//! Client-side projection of one conversation's messages.
//!
//! Messages are kept sorted by `(created_at, id)` with at most one entry per
//! id. Every mutation is idempotent, so history pages and pushed events can be
//! merged in any order.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::api::models::{Message, SenderType};

/// Local stand-in for a message we sent but have not seen echoed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub nonce: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEntry {
    Message(Message),
    Pending(PendingMessage),
}

#[derive(Debug)]
pub struct MessageStream {
    conversation_id: String,
    messages: Vec<Message>,
    ids: HashSet<String>,
    pending: Vec<PendingMessage>,
}

impl MessageStream {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
            ids: HashSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Merge a page of history. Either page order is fine. Returns how many
    /// records were added or replaced.
    pub fn hydrate(&mut self, history: Vec<Message>) -> usize {
        let mut changed = 0;
        for msg in history {
            if msg.conversation_id != self.conversation_id {
                log::debug!(
                    "history for {} contained message {} of {}",
                    self.conversation_id,
                    msg.id,
                    msg.conversation_id
                );
                continue;
            }
            if self.ids.contains(&msg.id) {
                if self.replace(msg) {
                    changed += 1;
                }
            } else {
                self.retire_pending(&msg, true);
                self.insert(msg);
                changed += 1;
            }
        }
        changed
    }

    pub fn apply_received(&mut self, msg: Message) -> bool {
        if msg.conversation_id != self.conversation_id {
            return false;
        }
        if self.ids.contains(&msg.id) {
            log::debug!("duplicate delivery of message {} ignored", msg.id);
            return false;
        }
        self.retire_pending(&msg, false);
        self.insert(msg);
        true
    }

    pub fn apply_updated(&mut self, msg: Message) -> bool {
        if msg.conversation_id != self.conversation_id {
            return false;
        }
        if !self.ids.contains(&msg.id) {
            log::debug!("update for unknown message {} dropped", msg.id);
            return false;
        }
        self.replace(msg)
    }

    pub fn apply_deleted(&mut self, conversation_id: &str, message_id: &str) -> bool {
        if conversation_id != self.conversation_id {
            return false;
        }
        match self.messages.iter_mut().find(|m| m.id == message_id) {
            Some(existing) => {
                existing.is_deleted = true;
                existing.body.clear();
                true
            }
            None => {
                log::debug!("delete for unknown message {} dropped", message_id);
                false
            }
        }
    }

    pub fn push_pending(&mut self, pending: PendingMessage) {
        self.pending.push(pending);
    }

    pub fn discard_pending(&mut self, nonce: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.nonce != nonce);
        self.pending.len() != before
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    /// Confirmed messages in order, then placeholders in send order.
    pub fn entries(&self) -> Vec<StreamEntry> {
        self.messages
            .iter()
            .cloned()
            .map(StreamEntry::Message)
            .chain(self.pending.iter().cloned().map(StreamEntry::Pending))
            .collect()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.ids.contains(message_id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when there is nothing to render, not even a placeholder.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.pending.is_empty()
    }

    fn insert(&mut self, msg: Message) {
        let idx = self
            .messages
            .partition_point(|m| (m.created_at, m.id.as_str()) <= (msg.created_at, msg.id.as_str()));
        self.ids.insert(msg.id.clone());
        self.messages.insert(idx, msg);
    }

    /// Swap in a newer copy of a known message. Stale copies lose, and a
    /// deleted message stays deleted.
    fn replace(&mut self, mut msg: Message) -> bool {
        let Some(idx) = self.messages.iter().position(|m| m.id == msg.id) else {
            return false;
        };
        let existing = &self.messages[idx];
        if msg.updated_at < existing.updated_at {
            log::debug!("stale copy of message {} ignored", msg.id);
            return false;
        }
        if existing.is_deleted {
            msg.is_deleted = true;
            msg.body.clear();
        }
        if msg == *existing {
            return false;
        }
        if msg.created_at == existing.created_at {
            self.messages[idx] = msg;
        } else {
            self.messages.remove(idx);
            self.ids.remove(&msg.id);
            self.insert(msg);
        }
        true
    }

    /// Drop the placeholder `msg` confirms. Without a nonce match, the oldest
    /// placeholder with the same body is taken; a history record only counts
    /// if it is not older than the placeholder.
    fn retire_pending(&mut self, msg: &Message, from_history: bool) {
        if self.pending.is_empty() {
            return;
        }
        let by_nonce = msg
            .client_nonce
            .as_deref()
            .and_then(|nonce| self.pending.iter().position(|p| p.nonce == nonce));
        let idx = by_nonce.or_else(|| {
            if msg.sender_type != SenderType::Recruiter {
                return None;
            }
            self.pending
                .iter()
                .position(|p| p.body == msg.body && (!from_history || msg.created_at >= p.created_at))
        });
        if let Some(idx) = idx {
            self.pending.remove(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "conv".to_string(),
            sender_type: SenderType::Candidate,
            sender_id: "cand".to_string(),
            body: format!("body of {id}"),
            is_deleted: false,
            created_at: at(secs),
            updated_at: at(secs),
            client_nonce: None,
        }
    }

    fn ids(stream: &MessageStream) -> Vec<&str> {
        stream.messages().iter().map(|m| m.id.as_str()).collect()
    }

    fn assert_sorted(stream: &MessageStream) {
        for pair in stream.messages().windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[test]
    fn hydrate_empty_history_is_empty() {
        let mut stream = MessageStream::new("conv");
        assert_eq!(stream.hydrate(vec![]), 0);
        assert!(stream.is_empty());
    }

    #[test]
    fn duplicate_received_is_noop() {
        let mut stream = MessageStream::new("conv");
        assert!(stream.apply_received(msg("m1", 1)));
        assert!(!stream.apply_received(msg("m1", 1)));
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn repeated_ids_in_any_order_collapse() {
        let orders: [&[usize]; 4] = [
            &[0, 1, 2, 0, 1, 2],
            &[2, 2, 2, 1, 0],
            &[1, 0, 1, 2, 0, 2, 1],
            &[0, 0, 0, 0, 2, 1],
        ];
        let pool = [msg("a", 5), msg("b", 1), msg("c", 3)];
        for order in orders {
            let mut stream = MessageStream::new("conv");
            for &i in order {
                stream.apply_received(pool[i].clone());
                assert_sorted(&stream);
            }
            assert_eq!(ids(&stream), vec!["b", "c", "a"]);
        }
    }

    #[test]
    fn hydrate_normalizes_newest_first_pages() {
        let mut stream = MessageStream::new("conv");
        stream.apply_received(msg("m3", 30));
        stream.hydrate(vec![msg("m3", 30), msg("m2", 20), msg("m1", 10)]);
        assert_eq!(ids(&stream), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn equal_timestamps_order_by_id() {
        let mut stream = MessageStream::new("conv");
        stream.apply_received(msg("b", 1));
        stream.apply_received(msg("a", 1));
        assert_eq!(ids(&stream), vec!["a", "b"]);
    }

    #[test]
    fn update_replaces_known_message_only() {
        let mut stream = MessageStream::new("conv");
        assert!(!stream.apply_updated(msg("m1", 1)));
        assert!(stream.is_empty());

        stream.apply_received(msg("m1", 1));
        let mut edited = msg("m1", 1);
        edited.body = "edited".into();
        edited.updated_at = at(9);
        assert!(stream.apply_updated(edited));
        assert_eq!(stream.messages()[0].body, "edited");

        let stale = msg("m1", 1);
        assert!(!stream.apply_updated(stale));
        assert_eq!(stream.messages()[0].body, "edited");
    }

    #[test]
    fn delete_redacts_in_place() {
        let mut stream = MessageStream::new("conv");
        stream.hydrate(vec![msg("m1", 1), msg("m2", 2), msg("m3", 3)]);
        assert!(stream.apply_deleted("conv", "m2"));
        assert_eq!(ids(&stream), vec!["m1", "m2", "m3"]);
        assert!(stream.messages()[1].is_deleted);
        assert!(stream.messages()[1].body.is_empty());

        let mut late = msg("m2", 2);
        late.updated_at = at(50);
        stream.hydrate(vec![late]);
        assert!(stream.messages()[1].is_deleted);
    }

    #[test]
    fn delete_of_unknown_message_on_empty_stream() {
        let mut stream = MessageStream::new("conv");
        assert!(!stream.apply_deleted("conv", "unknown-id"));
        assert!(stream.is_empty());
    }

    #[test]
    fn events_for_other_conversations_are_ignored() {
        let mut stream = MessageStream::new("conv");
        let mut foreign = msg("x", 1);
        foreign.conversation_id = "other".into();
        assert!(!stream.apply_received(foreign));
        assert!(!stream.apply_deleted("other", "x"));
        assert!(stream.is_empty());
    }

    #[test]
    fn echo_retires_pending_placeholder() {
        let mut stream = MessageStream::new("conv");
        stream.push_pending(PendingMessage {
            nonce: "n1".into(),
            body: "Hello".into(),
            created_at: at(0),
        });
        stream.push_pending(PendingMessage {
            nonce: "n2".into(),
            body: "Hello".into(),
            created_at: at(1),
        });
        assert!(!stream.is_empty());

        let mut echo = msg("m1", 2);
        echo.sender_type = SenderType::Recruiter;
        echo.body = "Hello".into();
        echo.client_nonce = Some("n2".into());
        stream.apply_received(echo);
        assert_eq!(stream.pending().len(), 1);
        assert_eq!(stream.pending()[0].nonce, "n1");

        let mut history_copy = msg("m0", 1);
        history_copy.sender_type = SenderType::Recruiter;
        history_copy.body = "Hello".into();
        stream.hydrate(vec![history_copy]);
        assert!(stream.pending().is_empty());
        assert_eq!(stream.entries().len(), 2);
    }

    #[test]
    fn older_history_with_same_text_keeps_placeholder() {
        let mut stream = MessageStream::new("conv");
        stream.push_pending(PendingMessage {
            nonce: "n1".into(),
            body: "Thanks".into(),
            created_at: at(100),
        });
        let mut earlier = msg("m-old", 10);
        earlier.sender_type = SenderType::Recruiter;
        earlier.body = "Thanks".into();
        stream.hydrate(vec![earlier]);
        assert_eq!(stream.pending().len(), 1);

        let mut echo = msg("m-new", 100);
        echo.sender_type = SenderType::Recruiter;
        echo.body = "Thanks".into();
        stream.apply_received(echo);
        assert!(stream.pending().is_empty());
    }

    #[test]
    fn update_with_new_created_at_moves_message() {
        let mut stream = MessageStream::new("conv");
        stream.hydrate(vec![msg("m1", 1), msg("m2", 2), msg("m3", 3)]);
        let mut moved = msg("m1", 5);
        moved.updated_at = at(6);
        assert!(stream.apply_updated(moved));
        assert_eq!(ids(&stream), vec!["m2", "m3", "m1"]);
        assert_sorted(&stream);
        assert_eq!(stream.len(), 3);
        assert!(stream.contains("m1"));
    }
}
