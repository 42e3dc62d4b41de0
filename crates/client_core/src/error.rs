use shared::{
    domain::{ConversationId, MessageId},
    error::ApiError,
};
use thiserror::Error;

/// Engine-level error taxonomy. Every variant is local to the
/// operation that produced it; no failure halts the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("no HTTP fallback for `{operation}` while disconnected")]
    NoFallback { operation: &'static str },

    #[error("gateway request failed: {0}")]
    Gateway(#[from] reqwest::Error),

    #[error("recall rejected for message {message_id}: {reason}")]
    RecallRejected {
        message_id: MessageId,
        reason: String,
    },

    #[error("unknown message {0}")]
    UnknownMessage(MessageId),

    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),

    #[error("server error: {0}")]
    Api(#[from] ApiError),
}
