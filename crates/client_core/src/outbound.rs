//! Outbound send pipeline: optimistic pending records, dispatch
//! through the channel client, and reconciliation bookkeeping on
//! transport failure. Confirmation itself arrives as an inbound
//! `message.sent` event and is merged by the timeline reducer.

use chrono::Utc;
use shared::{
    domain::{ConversationId, FileMeta, MessageId, MessageKind, UserId},
    protocol::ClientRequest,
};
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::EngineError,
    timeline::{DeliveryState, Message},
    EngineEvent, SyncEngine,
};

/// Locally unique temporary identity for an unconfirmed message. The
/// prefix keeps it disjoint from any server-assigned id.
pub(crate) fn temp_message_id() -> MessageId {
    MessageId(format!("pending-{}", Uuid::new_v4()))
}

pub(crate) fn build_pending(
    conversation_id: ConversationId,
    sender_id: UserId,
    kind: MessageKind,
    content: String,
    file_meta: Option<FileMeta>,
) -> Result<Message, EngineError> {
    if kind == MessageKind::Text && content.trim().is_empty() {
        return Err(EngineError::Validation(
            "text message content must not be empty".to_string(),
        ));
    }
    if kind != MessageKind::Text && file_meta.is_none() {
        return Err(EngineError::Validation(
            "image and file messages require file metadata".to_string(),
        ));
    }
    Ok(Message {
        id: temp_message_id(),
        conversation_id,
        sender_id,
        kind,
        content,
        file_meta,
        created_at: Utc::now(),
        is_recalled: false,
        delivery: DeliveryState::Pending,
    })
}

impl SyncEngine {
    /// Creates a pending entry immediately visible in the timeline and
    /// dispatches it. On transport failure the entry stays with
    /// `DeliveryState::Error` and its content intact so it can be
    /// retried without data loss.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        kind: MessageKind,
        content: impl Into<String>,
        file_meta: Option<FileMeta>,
    ) -> Result<MessageId, EngineError> {
        let pending = build_pending(
            conversation_id.clone(),
            self.config.local_user.clone(),
            kind,
            content.into(),
            file_meta,
        )?;
        let request = ClientRequest::SendMessage {
            conversation_id: conversation_id.clone(),
            kind,
            content: pending.content.clone(),
            file_meta: pending.file_meta.clone(),
        };
        let message_id = pending.id.clone();

        {
            let mut state = self.inner.lock().await;
            state
                .timelines
                .entry(conversation_id.clone())
                .or_default()
                .ingest(pending);
        }
        self.emit(EngineEvent::TimelineUpdated {
            conversation_id: conversation_id.clone(),
        });

        self.dispatch_pending(conversation_id, message_id.clone(), request)
            .await?;
        Ok(message_id)
    }

    /// Re-dispatches a message stuck in the error state.
    pub async fn retry_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<(), EngineError> {
        let request = {
            let mut state = self.inner.lock().await;
            let timeline = state
                .timelines
                .get_mut(&conversation_id)
                .ok_or_else(|| EngineError::UnknownConversation(conversation_id.clone()))?;
            let message = timeline
                .get(&message_id)
                .ok_or_else(|| EngineError::UnknownMessage(message_id.clone()))?
                .clone();
            if message.delivery != DeliveryState::Error {
                return Err(EngineError::Validation(
                    "only messages in the error state can be retried".to_string(),
                ));
            }
            timeline.mark_delivery(&message_id, DeliveryState::Pending);
            ClientRequest::SendMessage {
                conversation_id: conversation_id.clone(),
                kind: message.kind,
                content: message.content,
                file_meta: message.file_meta,
            }
        };
        self.emit(EngineEvent::TimelineUpdated {
            conversation_id: conversation_id.clone(),
        });

        self.dispatch_pending(conversation_id, message_id, request)
            .await
    }

    async fn dispatch_pending(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        request: ClientRequest,
    ) -> Result<(), EngineError> {
        match self.channel.send(request).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    conversation_id = %conversation_id,
                    message_id = %message_id,
                    "message dispatch failed: {err}"
                );
                {
                    let mut state = self.inner.lock().await;
                    if let Some(timeline) = state.timelines.get_mut(&conversation_id) {
                        timeline.mark_delivery(&message_id, DeliveryState::Error);
                    }
                }
                self.emit(EngineEvent::TimelineUpdated {
                    conversation_id: conversation_id.clone(),
                });
                self.emit(EngineEvent::DeliveryFailed {
                    conversation_id,
                    message_id,
                });
                Err(err)
            }
        }
    }
}
