pub mod client;
pub mod events;
pub mod models;

use async_trait::async_trait;

use crate::error::ChatResult;
use models::{Conversation, MessagePage, OutgoingMessage};

/// Request/response side of the messaging backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self) -> ChatResult<Vec<Conversation>>;

    /// Create-or-get: returns the existing conversation for the candidate if there is one.
    async fn create_conversation(&self, candidate_id: &str) -> ChatResult<Conversation>;

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> ChatResult<MessagePage>;

    /// Only acknowledges acceptance. The message itself arrives over the realtime channel.
    async fn send_message(&self, conversation_id: &str, message: &OutgoingMessage)
    -> ChatResult<()>;
}
