use crate::entity::Sender;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single stored chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub session_id: String,
    pub sender: Sender,
    pub content: String,
    /// Telegram chat the bot notification was posted to. Message ids are
    /// only unique within a chat, so the two are set together.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_chat_id: Option<i64>,
    /// Telegram message id of the bot notification, set once after relay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A message that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub sender: Sender,
    pub content: String,
}

impl NewMessage {
    pub fn visitor(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            sender: Sender::Visitor,
            content: content.into(),
        }
    }

    pub fn operator(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            sender: Sender::Operator,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Row of the operator dashboard's conversation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_message_content: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}
