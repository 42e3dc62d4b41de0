//! Per-conversation message timeline: an ordered, paginated buffer that
//! owns deduplication, pending-to-confirmed reconciliation, and recall
//! redaction. `TimelineState` is a pure state type; all I/O happens in
//! the engine, which calls these reducers under its single lock.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, FileMeta, MessageId, MessageKind, UserId},
    protocol::MessagePayload,
};

/// Redaction marker substituted for the content of a recalled message.
pub const RECALLED_CONTENT: &str = "[message recalled]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Error,
}

/// Local message record. Unlike the wire payload it tracks the
/// optimistic delivery state of locally originated messages.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub file_meta: Option<FileMeta>,
    pub created_at: DateTime<Utc>,
    pub is_recalled: bool,
    pub delivery: DeliveryState,
}

impl Message {
    /// Builds a local record from a canonical server payload.
    pub fn confirmed(payload: MessagePayload) -> Self {
        let content = if payload.is_recalled {
            RECALLED_CONTENT.to_string()
        } else {
            payload.content
        };
        Self {
            id: payload.message_id,
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            kind: payload.kind,
            content,
            file_meta: payload.file_meta,
            created_at: payload.created_at,
            is_recalled: payload.is_recalled,
            delivery: DeliveryState::Confirmed,
        }
    }

    /// Whether this entry is the optimistic counterpart of `incoming`.
    /// Matches by logical payload, not id: the server assigns the
    /// canonical id only on confirmation. Entries in the error state
    /// still match, so a late echo of a send the client gave up on is
    /// reconciled instead of duplicated.
    fn matches_pending(&self, incoming: &Message) -> bool {
        matches!(self.delivery, DeliveryState::Pending | DeliveryState::Error)
            && self.conversation_id == incoming.conversation_id
            && self.sender_id == incoming.sender_id
            && self.kind == incoming.kind
            && self.content == incoming.content
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New entry appended at its ordered position.
    Inserted,
    /// A pending optimistic entry was replaced in place by its
    /// confirmation.
    ReplacedPending,
    /// An existing entry with the same id was mutated (recall applied).
    Updated,
    /// Duplicate delivery; nothing changed.
    Unchanged,
}

#[derive(Debug, Default, Clone)]
pub struct TimelineState {
    messages: Vec<Message>,
    has_more: bool,
    cursor: Option<MessageId>,
}

impl TimelineState {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Pagination cursor: id of the oldest message loaded through a
    /// page request. Exclusive upper bound for the next older page.
    pub fn cursor(&self) -> Option<&MessageId> {
        self.cursor.as_ref()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    /// `load_initial` merge: replaces the timeline wholesale with the
    /// newest page and resets the cursor to the oldest loaded id.
    pub fn replace_with_page(&mut self, page: Vec<Message>, has_more: bool) {
        let mut seen = HashSet::new();
        let mut messages: Vec<Message> = page
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        sort_ascending(&mut messages);
        self.cursor = messages.first().map(|m| m.id.clone());
        self.messages = messages;
        self.has_more = has_more;
    }

    /// `load_more` merge: prepends a strictly-older page. Idempotent —
    /// any id already present is dropped from the incoming page before
    /// prepending, so overlapping deliveries cannot duplicate entries.
    pub fn prepend_older(&mut self, page: Vec<Message>, has_more: bool) {
        let mut incoming: Vec<Message> = page
            .into_iter()
            .filter(|m| !self.contains(&m.id))
            .collect();
        sort_ascending(&mut incoming);
        incoming.append(&mut self.messages);
        self.messages = incoming;
        self.cursor = self.messages.first().map(|m| m.id.clone());
        self.has_more = has_more;
    }

    /// Inserts or replaces by id. The pending-to-confirmed replacement
    /// is the dedup rule that prevents a double bubble when the
    /// optimistic send and the server echo race.
    pub fn ingest(&mut self, incoming: Message) -> IngestOutcome {
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == incoming.id) {
            // Recall is one-way; a stale non-recalled copy never
            // reverts an already redacted entry.
            if incoming.is_recalled && !existing.is_recalled {
                existing.is_recalled = true;
                existing.content = RECALLED_CONTENT.to_string();
                return IngestOutcome::Updated;
            }
            return IngestOutcome::Unchanged;
        }

        if incoming.delivery == DeliveryState::Confirmed {
            if let Some(pos) = self.messages.iter().position(|m| m.matches_pending(&incoming)) {
                self.messages[pos] = incoming;
                sort_ascending(&mut self.messages);
                return IngestOutcome::ReplacedPending;
            }
        }

        self.messages.push(incoming);
        sort_ascending(&mut self.messages);
        IngestOutcome::Inserted
    }

    /// One-way recall mutation; a no-op when the message is unknown
    /// locally or already recalled.
    pub fn apply_recall(&mut self, id: &MessageId) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) if !message.is_recalled => {
                message.is_recalled = true;
                message.content = RECALLED_CONTENT.to_string();
                true
            }
            _ => false,
        }
    }

    /// Restores a snapshot taken before an optimistic recall. The only
    /// path that un-recalls a message.
    pub fn restore(&mut self, snapshot: Message) -> bool {
        match self.messages.iter_mut().find(|m| m.id == snapshot.id) {
            Some(slot) => {
                *slot = snapshot;
                true
            }
            None => false,
        }
    }

    pub fn mark_delivery(&mut self, id: &MessageId, delivery: DeliveryState) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) => {
                message.delivery = delivery;
                true
            }
            None => false,
        }
    }
}

fn sort_ascending(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
