//! Channel client: one bidirectional event channel plus an HTTP
//! fallback behind a single `send`/`subscribe` surface. The concrete
//! channel transport is injected through `ChannelTransport`; fallback
//! responses are re-injected into the same inbound event stream so the
//! merge logic downstream never knows which path delivered an event.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, FileMeta, MessageId, MessageKind},
    protocol::{ClientRequest, ConversationSummary, MessagePage, MessagePayload, ServerEvent},
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
}

/// Abstract contract of the bidirectional channel. The concrete
/// implementation (including its reconnect policy) lives outside this
/// crate; the engine only relies on these operations.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self) -> Result<(), EngineError>;
    async fn send(&self, request: ClientRequest) -> Result<(), EngineError>;
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

/// Gateway input for the post-message fallback. The gateway supplies
/// the caller identity itself, the same way the channel transport
/// does for channel sends.
#[derive(Debug, Clone)]
pub struct NewMessageRequest {
    pub conversation_id: ConversationId,
    pub kind: MessageKind,
    pub content: String,
    pub file_meta: Option<FileMeta>,
}

/// HTTP fallback surface. Result shapes mirror the channel events so
/// both paths feed the same reducers.
#[async_trait]
pub trait RestGateway: Send + Sync {
    async fn list_conversations(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>, EngineError>;

    async fn conversation_detail(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationSummary, EngineError>;

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before_message_id: Option<&MessageId>,
    ) -> Result<MessagePage, EngineError>;

    async fn post_message(&self, request: &NewMessageRequest)
        -> Result<MessagePayload, EngineError>;

    async fn post_recall(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), EngineError>;

    async fn post_mark_read(&self, conversation_id: &ConversationId) -> Result<(), EngineError>;

    /// Typing status may be channel-only on some servers.
    fn supports_typing(&self) -> bool {
        false
    }

    async fn post_typing(
        &self,
        conversation_id: &ConversationId,
        is_typing: bool,
    ) -> Result<(), EngineError>;
}

pub struct ChannelClient {
    transport: Arc<dyn ChannelTransport>,
    gateway: Arc<dyn RestGateway>,
    events: broadcast::Sender<ServerEvent>,
    status: watch::Sender<ChannelStatus>,
}

impl ChannelClient {
    pub fn new(transport: Arc<dyn ChannelTransport>, gateway: Arc<dyn RestGateway>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (status, _) = watch::channel(ChannelStatus::Disconnected);
        Arc::new(Self {
            transport,
            gateway,
            events,
            status,
        })
    }

    /// Establishes the channel and starts forwarding its events. A
    /// connect failure leaves the client usable on the HTTP fallback.
    pub async fn connect(self: &Arc<Self>) -> Result<(), EngineError> {
        self.status.send_replace(ChannelStatus::Connecting);
        match self.transport.connect().await {
            Ok(()) => {
                self.status.send_replace(ChannelStatus::Connected);
                self.spawn_event_pump();
                Ok(())
            }
            Err(err) => {
                self.status.send_replace(ChannelStatus::Disconnected);
                Err(err)
            }
        }
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    /// Inbound events in arrival order, both channel pushes and
    /// re-injected fallback responses.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Transmits over the open channel when connected; otherwise
    /// performs the equivalent HTTP request and routes its response
    /// through the event stream. A request with no HTTP equivalent
    /// while disconnected is an error, never a silent drop.
    pub async fn send(&self, request: ClientRequest) -> Result<(), EngineError> {
        if self.status() == ChannelStatus::Connected {
            return self.transport.send(request).await;
        }

        match request {
            ClientRequest::SendMessage {
                conversation_id,
                kind,
                content,
                file_meta,
            } => {
                let message = self
                    .gateway
                    .post_message(&NewMessageRequest {
                        conversation_id,
                        kind,
                        content,
                        file_meta,
                    })
                    .await?;
                let _ = self.events.send(ServerEvent::MessageSent { message });
                Ok(())
            }
            ClientRequest::MarkRead { conversation_id } => {
                self.gateway.post_mark_read(&conversation_id).await
            }
            ClientRequest::RecallMessage {
                conversation_id,
                message_id,
            } => {
                self.gateway
                    .post_recall(&conversation_id, &message_id)
                    .await?;
                let _ = self.events.send(ServerEvent::MessageRecalled {
                    conversation_id,
                    message_id,
                });
                Ok(())
            }
            ClientRequest::Typing {
                conversation_id,
                is_typing,
            } => {
                if !self.gateway.supports_typing() {
                    return Err(EngineError::NoFallback {
                        operation: "typing",
                    });
                }
                self.gateway.post_typing(&conversation_id, is_typing).await
            }
        }
    }

    fn spawn_event_pump(self: &Arc<Self>) {
        let mut inbound = self.transport.subscribe();
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(event) => {
                        match &event {
                            ServerEvent::Connected => {
                                client.status.send_replace(ChannelStatus::Connected);
                            }
                            ServerEvent::Disconnected => {
                                client.status.send_replace(ChannelStatus::Disconnected);
                            }
                            _ => {}
                        }
                        let _ = client.events.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "channel event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("channel transport event stream closed");
                        client.status.send_replace(ChannelStatus::Disconnected);
                        break;
                    }
                }
            }
        });
    }
}
