//! Conversation list state: ordered summaries, unread counters, and
//! activity-driven reordering. Pure reducers; the engine applies them
//! under its single lock and owns all transport calls.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, MessageKind, UserId},
    protocol::ConversationSummary,
};

use crate::{
    timeline::{Message, RECALLED_CONTENT},
    transport::ChannelStatus,
};

/// Preview cap keeps the summary line bounded regardless of content.
const PREVIEW_MAX_CHARS: usize = 60;

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub name: String,
    pub avatar_ref: Option<String>,
    pub members: Vec<UserId>,
    pub last_message_preview: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_message_id: Option<MessageId>,
    pub unread_count: u32,
}

impl From<ConversationSummary> for Conversation {
    fn from(summary: ConversationSummary) -> Self {
        Self {
            id: summary.conversation_id,
            kind: summary.kind,
            name: summary.name,
            avatar_ref: summary.avatar_ref,
            members: summary.members,
            last_message_preview: summary.last_message_preview,
            last_message_time: summary.last_message_time,
            last_message_id: None,
            unread_count: summary.unread_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    Applied,
    /// The message referenced a conversation this client has never
    /// seen; the caller must trigger a full list refresh.
    UnknownConversation,
}

#[derive(Debug, Default)]
pub struct ConversationListState {
    items: Vec<Conversation>,
    channel_status: ChannelStatus,
}

impl ConversationListState {
    /// Sorted descending by last activity; ties keep their prior order.
    pub fn items(&self) -> &[Conversation] {
        &self.items
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.items.iter().find(|c| &c.id == id)
    }

    /// Connectivity indicator mirrored from the channel client so the
    /// UI layer can read it off the same snapshot.
    pub fn channel_status(&self) -> ChannelStatus {
        self.channel_status
    }

    pub fn set_channel_status(&mut self, status: ChannelStatus) {
        self.channel_status = status;
    }

    pub fn replace_all(&mut self, items: Vec<Conversation>) {
        self.items = items;
        self.resort();
    }

    /// Applies a confirmed message to the list: preview, activity
    /// timestamp, unread accounting, and descending re-sort. Unread
    /// increments by exactly one, and only when the conversation is
    /// not the active one and the message is not the local user's own.
    pub fn on_message_activity(
        &mut self,
        message: &Message,
        active: Option<&ConversationId>,
        local_user: &UserId,
    ) -> ActivityOutcome {
        let Some(conversation) = self
            .items
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        else {
            return ActivityOutcome::UnknownConversation;
        };

        conversation.last_message_preview = Some(preview_for(message));
        conversation.last_message_time = Some(message.created_at);
        conversation.last_message_id = Some(message.id.clone());
        if active != Some(&conversation.id) && &message.sender_id != local_user {
            conversation.unread_count += 1;
        }

        self.resort();
        ActivityOutcome::Applied
    }

    pub fn mark_read(&mut self, id: &ConversationId) -> bool {
        match self.items.iter_mut().find(|c| &c.id == id) {
            Some(conversation) => {
                conversation.unread_count = 0;
                true
            }
            None => false,
        }
    }

    /// Rewrites the preview, but only while it still reflects the
    /// given message. Used when that message is recalled after the
    /// fact (or a recall of it is reverted).
    pub fn set_preview_for(
        &mut self,
        id: &ConversationId,
        message_id: &MessageId,
        preview: String,
    ) -> bool {
        match self.items.iter_mut().find(|c| &c.id == id) {
            Some(conversation) if conversation.last_message_id.as_ref() == Some(message_id) => {
                conversation.last_message_preview = Some(preview);
                true
            }
            _ => false,
        }
    }

    fn resort(&mut self) {
        // Stable sort: conversations with equal (or absent) activity
        // keep their prior relative order.
        self.items
            .sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
    }
}

/// Preview string for the conversation list. Image, file, and recalled
/// messages show a redacted form instead of raw content.
pub fn preview_for(message: &Message) -> String {
    if message.is_recalled {
        return RECALLED_CONTENT.to_string();
    }
    match message.kind {
        MessageKind::Text => truncate_preview(&message.content),
        MessageKind::Image => "[image]".to_string(),
        MessageKind::File => match &message.file_meta {
            Some(meta) => format!("[file] {}", meta.filename),
            None => "[file]".to_string(),
        },
    }
}

fn truncate_preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_MAX_CHARS {
        return content.to_string();
    }
    let truncated: String = content.chars().take(PREVIEW_MAX_CHARS).collect();
    format!("{truncated}…")
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
