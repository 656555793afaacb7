//! Outgoing messages.
//!
//! A send never inserts the message into the stream. The server's echo on the
//! room channel does that, so a message can't show up twice when the echo
//! and the HTTP response race. Until the echo lands the stream shows a pending
//! placeholder keyed by a client nonce.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::api::ChatApi;
use crate::api::models::OutgoingMessage;
use crate::error::{ChatError, ChatResult};
use crate::stream::{MessageStream, PendingMessage};

/// The compose box of one conversation view.
#[derive(Debug, Default)]
pub struct Draft {
    text: Mutex<String>,
}

impl Draft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        self.text.lock().clone()
    }

    pub fn set(&self, text: impl Into<String>) {
        *self.text.lock() = text.into();
    }

    fn take(&self) -> String {
        std::mem::take(&mut *self.text.lock())
    }

    /// Put back text from a failed send. Anything typed since goes after it.
    fn restore(&self, text: String) {
        let mut current = self.text.lock();
        if current.is_empty() {
            *current = text;
        } else {
            *current = format!("{text}{current}");
        }
    }
}

pub struct SendPipeline {
    api: Arc<dyn ChatApi>,
    in_flight: Mutex<HashSet<String>>,
}

/// Releases the per-conversation send slot, even if the send future is dropped.
struct InFlight<'a> {
    pipeline: &'a SendPipeline,
    conversation_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.pipeline.in_flight.lock().remove(&self.conversation_id);
    }
}

impl SendPipeline {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self {
            api,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_sending(&self, conversation_id: &str) -> bool {
        self.in_flight.lock().contains(conversation_id)
    }

    /// Submit the draft. The draft is cleared up front and restored if the
    /// request fails.
    pub async fn send(
        &self,
        conversation_id: &str,
        draft: &Draft,
        stream: &Mutex<MessageStream>,
    ) -> ChatResult<()> {
        if conversation_id.trim().is_empty() {
            return Err(ChatError::Validation("conversation id is empty".into()));
        }
        let body = draft.text().trim().to_string();
        if body.is_empty() {
            return Err(ChatError::Validation("message body is empty".into()));
        }
        if !self.in_flight.lock().insert(conversation_id.to_string()) {
            return Err(ChatError::SendInFlight(conversation_id.to_string()));
        }
        let _slot = InFlight {
            pipeline: self,
            conversation_id: conversation_id.to_string(),
        };

        let entered = draft.take();
        let nonce = Uuid::new_v4().to_string();
        stream.lock().push_pending(PendingMessage {
            nonce: nonce.clone(),
            body: body.clone(),
            created_at: Utc::now(),
        });

        let outgoing = OutgoingMessage {
            body,
            client_nonce: Some(nonce.clone()),
        };
        match self.api.send_message(conversation_id, &outgoing).await {
            Ok(()) => {
                log::debug!("Message accepted for {conversation_id}, waiting for echo");
                Ok(())
            }
            Err(err) => {
                log::warn!("Send to {conversation_id} failed: {err}");
                stream.lock().discard_pending(&nonce);
                draft.restore(entered);
                Err(err)
            }
        }
    }
}
