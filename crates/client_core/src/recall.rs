//! Recall coordination: client-side permission check, optimistic
//! redaction with a revert snapshot, finalize on the server's
//! `message.recalled`, revert on the explicit rejection event. The
//! authoritative window check is server-side; the client enforces the
//! same window so it never offers an action guaranteed to fail.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::ClientRequest,
};
use tracing::{debug, warn};

use crate::{
    conversations::preview_for,
    error::EngineError,
    timeline::{Message, RECALLED_CONTENT},
    EngineEvent, SyncEngine,
};

/// Messages older than this are no longer recallable.
pub const RECALL_WINDOW_SECS: i64 = 120;

pub(crate) fn recall_permitted(
    message: &Message,
    local_user: &UserId,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    if &message.sender_id != local_user {
        return Err(EngineError::RecallRejected {
            message_id: message.id.clone(),
            reason: "only the sender can recall a message".to_string(),
        });
    }
    if now.signed_duration_since(message.created_at).num_seconds() > RECALL_WINDOW_SECS {
        return Err(EngineError::RecallRejected {
            message_id: message.id.clone(),
            reason: "recall window expired".to_string(),
        });
    }
    Ok(())
}

impl SyncEngine {
    /// Optimistically redacts the message, then dispatches the recall.
    /// A dispatch failure reverts immediately; a server rejection
    /// event reverts later through `handle_recall_rejected`.
    pub async fn recall_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<(), EngineError> {
        let preview_redacted = {
            let mut state = self.inner.lock().await;
            let timeline = state
                .timelines
                .get_mut(&conversation_id)
                .ok_or_else(|| EngineError::UnknownConversation(conversation_id.clone()))?;
            let message = timeline
                .get(&message_id)
                .ok_or_else(|| EngineError::UnknownMessage(message_id.clone()))?
                .clone();
            recall_permitted(&message, &self.config.local_user, Utc::now())?;
            timeline.apply_recall(&message_id);
            state.recall_snapshots.insert(message_id.clone(), message);
            state.conversations.set_preview_for(
                &conversation_id,
                &message_id,
                RECALLED_CONTENT.to_string(),
            )
        };
        self.emit(EngineEvent::TimelineUpdated {
            conversation_id: conversation_id.clone(),
        });
        if preview_redacted {
            self.emit(EngineEvent::ConversationsUpdated);
        }

        let request = ClientRequest::RecallMessage {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        };
        match self.channel.send(request).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    conversation_id = %conversation_id,
                    message_id = %message_id,
                    "recall dispatch failed, reverting: {err}"
                );
                self.revert_recall(&conversation_id, &message_id, "dispatch failed")
                    .await;
                Err(err)
            }
        }
    }

    /// Inbound `message.recalled`: idempotent redaction, local or
    /// remote origin. Finalizes any optimistic recall of the same
    /// message by dropping its revert snapshot.
    pub(crate) async fn handle_message_recalled(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) {
        let (changed, preview_redacted) = {
            let mut state = self.inner.lock().await;
            state.recall_snapshots.remove(&message_id);
            let changed = state
                .timelines
                .get_mut(&conversation_id)
                .is_some_and(|timeline| timeline.apply_recall(&message_id));
            let preview_redacted = state.conversations.set_preview_for(
                &conversation_id,
                &message_id,
                RECALLED_CONTENT.to_string(),
            );
            (changed, preview_redacted)
        };
        if changed {
            self.emit(EngineEvent::TimelineUpdated {
                conversation_id: conversation_id.clone(),
            });
        }
        if preview_redacted {
            self.emit(EngineEvent::ConversationsUpdated);
        }
    }

    /// Inbound `recall.rejected`: the only case where a recall is
    /// undone.
    pub(crate) async fn handle_recall_rejected(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        reason: String,
    ) {
        debug!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            reason,
            "recall rejected by server"
        );
        self.revert_recall(&conversation_id, &message_id, &reason)
            .await;
    }

    async fn revert_recall(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        reason: &str,
    ) {
        let (reverted, preview_restored) = {
            let mut state = self.inner.lock().await;
            match state.recall_snapshots.remove(message_id) {
                Some(snapshot) => {
                    let preview = preview_for(&snapshot);
                    let reverted = state
                        .timelines
                        .get_mut(conversation_id)
                        .is_some_and(|timeline| timeline.restore(snapshot));
                    let preview_restored = state.conversations.set_preview_for(
                        conversation_id,
                        message_id,
                        preview,
                    );
                    (reverted, preview_restored)
                }
                None => (false, false),
            }
        };
        if preview_restored {
            self.emit(EngineEvent::ConversationsUpdated);
        }
        if reverted {
            self.emit(EngineEvent::TimelineUpdated {
                conversation_id: conversation_id.clone(),
            });
            self.emit(EngineEvent::RecallReverted {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
#[path = "tests/recall_tests.rs"]
mod tests;
