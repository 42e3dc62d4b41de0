use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, ConversationKind, FileMeta, MessageId, MessageKind, UserId},
    error::ApiError,
};

/// Canonical server-side message record. Carried verbatim by
/// `message.new` / `message.sent` pushes and by the REST message
/// endpoints, so both delivery paths feed the same merge functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_meta: Option<FileMeta>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_recalled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub members: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

/// One backward page of a conversation's history, newest page first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessagePayload>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    #[serde(rename = "message.send")]
    SendMessage {
        conversation_id: ConversationId,
        kind: MessageKind,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_meta: Option<FileMeta>,
    },
    #[serde(rename = "message.read")]
    MarkRead { conversation_id: ConversationId },
    #[serde(rename = "typing")]
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    #[serde(rename = "message.recall")]
    RecallMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename = "message.new")]
    MessageNew { message: MessagePayload },
    #[serde(rename = "message.sent")]
    MessageSent { message: MessagePayload },
    #[serde(rename = "message.read")]
    MessageRead {
        conversation_id: ConversationId,
        user_id: UserId,
        read_up_to_message_id: MessageId,
    },
    #[serde(rename = "typing")]
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    #[serde(rename = "message.recalled")]
    MessageRecalled {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    #[serde(rename = "recall.rejected")]
    RecallRejected {
        conversation_id: ConversationId,
        message_id: MessageId,
        reason: String,
    },
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "disconnected")]
    Disconnected,
    #[serde(rename = "error")]
    Error(ApiError),
}
