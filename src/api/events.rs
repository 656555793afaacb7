use serde::{Deserialize, Serialize};

use crate::api::models::Message;

/// Frames the broker pushes to us. Wire shape is `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Authenticated { user_id: String },
    AuthRejected { reason: String },
    MessageReceived(Message),
    MessageUpdated(Message),
    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        message_id: String,
        conversation_id: String,
    },
}

impl ServerEvent {
    /// The conversation channel this event belongs to, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            ServerEvent::MessageReceived(m) | ServerEvent::MessageUpdated(m) => {
                Some(&m.conversation_id)
            }
            ServerEvent::MessageDeleted {
                conversation_id, ..
            } => Some(conversation_id),
            ServerEvent::Authenticated { .. } | ServerEvent::AuthRejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate { token: String },
    #[serde(rename_all = "camelCase")]
    JoinConversation { conversation_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveConversation { conversation_id: String },
}

/// Decode one text frame. Unknown event names come back as a protocol error
/// so the caller can log and skip them.
pub fn parse_frame(text: &str) -> Result<ServerEvent, serde_json::Error> {
    serde_json::from_str(text)
}
