//! Realtime conversation sync engine: keeps a local, eventually
//! consistent view of conversations and their messages against a
//! server, over a bidirectional channel with an HTTP fallback.
//!
//! All state mutation is serialized through one `Mutex<EngineState>`;
//! the reducers it guards are pure state types (`TimelineState`,
//! `ConversationListState`, `PresenceTracker`) so every merge
//! invariant is unit-testable without a transport. Dependencies are
//! injected explicitly: the UI layer holds the `Arc<SyncEngine>` and
//! binds commands through it.

use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex, Notify},
    time::Instant,
};
use tracing::{debug, warn};

pub mod conversations;
pub mod error;
pub mod gateway;
pub mod outbound;
pub mod presence;
pub mod recall;
pub mod timeline;
pub mod transport;

pub use conversations::{ActivityOutcome, Conversation, ConversationListState};
pub use error::EngineError;
pub use gateway::HttpRestGateway;
pub use presence::{PresenceTracker, TYPING_TTL};
pub use recall::RECALL_WINDOW_SECS;
pub use timeline::{DeliveryState, IngestOutcome, Message, TimelineState, RECALLED_CONTENT};
pub use transport::{
    ChannelClient, ChannelStatus, ChannelTransport, NewMessageRequest, RestGateway,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub local_user: UserId,
    pub initial_page_size: u32,
    pub older_page_size: u32,
    pub conversation_page_size: u32,
}

impl EngineConfig {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            initial_page_size: 50,
            older_page_size: 50,
            conversation_page_size: 100,
        }
    }
}

/// Snapshot-changed notifications for the UI layer, keyed by stable
/// entity ids rather than any rendering identity.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ConversationsUpdated,
    TimelineUpdated {
        conversation_id: ConversationId,
    },
    TypingChanged {
        conversation_id: ConversationId,
    },
    DeliveryFailed {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    RecallReverted {
        conversation_id: ConversationId,
        message_id: MessageId,
        reason: String,
    },
    ConnectivityChanged(ChannelStatus),
    Error(String),
}

#[derive(Default)]
pub(crate) struct EngineState {
    pub(crate) active_conversation: Option<ConversationId>,
    pub(crate) conversations: ConversationListState,
    pub(crate) timelines: HashMap<ConversationId, TimelineState>,
    pub(crate) presence: PresenceTracker,
    pub(crate) recall_snapshots: HashMap<MessageId, Message>,
    refresh_inflight: bool,
}

pub struct SyncEngine {
    pub(crate) config: EngineConfig,
    pub(crate) channel: Arc<ChannelClient>,
    pub(crate) gateway: Arc<dyn RestGateway>,
    pub(crate) inner: Mutex<EngineState>,
    pub(crate) events: broadcast::Sender<EngineEvent>,
    presence_rearm: Notify,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn ChannelTransport>,
        gateway: Arc<dyn RestGateway>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            channel: ChannelClient::new(transport, Arc::clone(&gateway)),
            gateway,
            inner: Mutex::new(EngineState::default()),
            events,
            presence_rearm: Notify::new(),
        })
    }

    /// Starts the inbound pumps, connects the channel, and performs
    /// the initial conversation-list load. A channel connect failure
    /// is non-fatal; the engine keeps working over the HTTP fallback.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        self.spawn_event_pump();
        self.spawn_status_pump();
        self.spawn_presence_expiry();

        if let Err(err) = self.channel.connect().await {
            warn!("channel connect failed, running on HTTP fallback: {err}");
        }

        self.refresh_conversations().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn connectivity(&self) -> ChannelStatus {
        self.channel.status()
    }

    pub async fn conversation_list(&self) -> Vec<Conversation> {
        self.inner.lock().await.conversations.items().to_vec()
    }

    pub async fn timeline_messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .timelines
            .get(conversation_id)
            .map(|timeline| timeline.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn has_older_messages(&self, conversation_id: &ConversationId) -> bool {
        self.inner
            .lock()
            .await
            .timelines
            .get(conversation_id)
            .is_some_and(|timeline| timeline.has_more())
    }

    pub async fn typing_users(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        self.inner
            .lock()
            .await
            .presence
            .typing_users(conversation_id)
    }

    pub async fn is_anyone_typing(&self, conversation_id: &ConversationId) -> bool {
        self.inner
            .lock()
            .await
            .presence
            .is_anyone_typing(conversation_id)
    }

    /// Full conversation-list reload. Also triggered internally when
    /// an inbound message references a conversation this client has
    /// never seen. The active conversation keeps its locally zeroed
    /// unread count even if the server still reports a stale value.
    pub async fn refresh_conversations(&self) -> Result<(), EngineError> {
        let page_size = self.config.conversation_page_size;
        let mut summaries = Vec::new();
        let mut offset = 0u32;
        loop {
            let page = self.gateway.list_conversations(page_size, offset).await?;
            let fetched = page.len() as u32;
            summaries.extend(page);
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        {
            let mut state = self.inner.lock().await;
            let items = summaries.into_iter().map(Conversation::from).collect();
            state.conversations.replace_all(items);
            if let Some(active) = state.active_conversation.clone() {
                state.conversations.mark_read(&active);
            }
        }
        self.emit(EngineEvent::ConversationsUpdated);
        Ok(())
    }

    /// Makes the conversation active: optimistic local mark-read, a
    /// read-receipt send that is not awaited for the badge, and the
    /// initial timeline page.
    pub async fn select_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), EngineError> {
        {
            let mut state = self.inner.lock().await;
            state.active_conversation = Some(conversation_id.clone());
            state.conversations.mark_read(&conversation_id);
        }
        self.emit(EngineEvent::ConversationsUpdated);

        if let Err(err) = self
            .channel
            .send(ClientRequest::MarkRead {
                conversation_id: conversation_id.clone(),
            })
            .await
        {
            warn!(
                conversation_id = %conversation_id,
                "read receipt dispatch failed: {err}"
            );
        }

        self.load_initial(conversation_id).await;
        Ok(())
    }

    /// Marks the conversation read without changing the selection.
    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), EngineError> {
        {
            let mut state = self.inner.lock().await;
            state.conversations.mark_read(&conversation_id);
        }
        self.emit(EngineEvent::ConversationsUpdated);
        self.channel
            .send(ClientRequest::MarkRead { conversation_id })
            .await
    }

    /// Outbound typing signal. Typing may be channel-only; while
    /// disconnected this reports `NoFallback` unless the gateway
    /// offers a typing endpoint.
    pub async fn set_typing(
        &self,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), EngineError> {
        self.channel
            .send(ClientRequest::Typing {
                conversation_id,
                is_typing,
            })
            .await
    }

    /// Cursor pagination backwards from the oldest held message. A
    /// no-op when there is nothing older or no page was loaded yet.
    pub async fn load_older_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), EngineError> {
        let cursor = {
            let state = self.inner.lock().await;
            match state.timelines.get(&conversation_id) {
                Some(timeline) if timeline.has_more() => match timeline.cursor() {
                    Some(cursor) => cursor.clone(),
                    None => return Ok(()),
                },
                _ => return Ok(()),
            }
        };

        let page = self
            .gateway
            .list_messages(&conversation_id, self.config.older_page_size, Some(&cursor))
            .await?;

        let applied = {
            let mut state = self.inner.lock().await;
            if state.active_conversation.as_ref() != Some(&conversation_id) {
                debug!(
                    conversation_id = %conversation_id,
                    "discarding stale pagination response"
                );
                false
            } else if let Some(timeline) = state.timelines.get_mut(&conversation_id) {
                let messages = page.messages.into_iter().map(Message::confirmed).collect();
                timeline.prepend_older(messages, page.has_more);
                true
            } else {
                false
            }
        };
        if applied {
            self.emit(EngineEvent::TimelineUpdated { conversation_id });
        }
        Ok(())
    }

    /// Newest page, replacing the timeline wholesale. Transport errors
    /// leave the timeline unchanged and surface as a log event only.
    async fn load_initial(&self, conversation_id: ConversationId) {
        let page = match self
            .gateway
            .list_messages(&conversation_id, self.config.initial_page_size, None)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    conversation_id = %conversation_id,
                    "initial page load failed, timeline unchanged: {err}"
                );
                return;
            }
        };

        let applied = {
            let mut state = self.inner.lock().await;
            if state.active_conversation.as_ref() != Some(&conversation_id) {
                debug!(
                    conversation_id = %conversation_id,
                    "discarding stale initial page"
                );
                false
            } else {
                let messages = page.messages.into_iter().map(Message::confirmed).collect();
                state
                    .timelines
                    .entry(conversation_id.clone())
                    .or_default()
                    .replace_with_page(messages, page.has_more);
                true
            }
        };
        if applied {
            self.emit(EngineEvent::TimelineUpdated { conversation_id });
        }
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::MessageNew { message } | ServerEvent::MessageSent { message } => {
                self.handle_confirmed_message(Message::confirmed(message))
                    .await;
            }
            ServerEvent::MessageRead {
                conversation_id,
                user_id,
                read_up_to_message_id: _,
            } => {
                // A receipt from the local user's other device clears
                // the badge here too; other users' receipts carry no
                // local state in this engine.
                if user_id == self.config.local_user {
                    let changed = {
                        let mut state = self.inner.lock().await;
                        state.conversations.mark_read(&conversation_id)
                    };
                    if changed {
                        self.emit(EngineEvent::ConversationsUpdated);
                    }
                }
            }
            ServerEvent::Typing {
                conversation_id,
                user_id,
                is_typing,
            } => {
                if user_id == self.config.local_user {
                    return;
                }
                let changed = {
                    let mut state = self.inner.lock().await;
                    state.presence.handle_typing(
                        conversation_id.clone(),
                        user_id,
                        is_typing,
                        Instant::now(),
                    )
                };
                self.presence_rearm.notify_one();
                if changed {
                    self.emit(EngineEvent::TypingChanged { conversation_id });
                }
            }
            ServerEvent::MessageRecalled {
                conversation_id,
                message_id,
            } => {
                self.handle_message_recalled(conversation_id, message_id)
                    .await;
            }
            ServerEvent::RecallRejected {
                conversation_id,
                message_id,
                reason,
            } => {
                self.handle_recall_rejected(conversation_id, message_id, reason)
                    .await;
            }
            ServerEvent::Connected | ServerEvent::Disconnected => {
                // Connectivity is mirrored through the status pump.
            }
            ServerEvent::Error(api_error) => {
                self.emit(EngineEvent::Error(api_error.to_string()));
            }
        }
    }

    /// Idempotent merge of a canonical message from either delivery
    /// path. Conversation activity (preview, unread, reorder) is
    /// driven exactly once per confirmed message: duplicate
    /// deliveries ingest as `Unchanged` and touch nothing.
    async fn handle_confirmed_message(self: &Arc<Self>, message: Message) {
        let conversation_id = message.conversation_id.clone();
        let (outcome, activity_applied, should_refresh) = {
            let mut state = self.inner.lock().await;
            let outcome = state
                .timelines
                .entry(conversation_id.clone())
                .or_default()
                .ingest(message.clone());

            let mut activity_applied = false;
            let mut should_refresh = false;
            if matches!(
                outcome,
                IngestOutcome::Inserted | IngestOutcome::ReplacedPending
            ) {
                let active = state.active_conversation.clone();
                match state.conversations.on_message_activity(
                    &message,
                    active.as_ref(),
                    &self.config.local_user,
                ) {
                    ActivityOutcome::Applied => activity_applied = true,
                    ActivityOutcome::UnknownConversation => {
                        if !state.refresh_inflight {
                            state.refresh_inflight = true;
                            should_refresh = true;
                        }
                    }
                }
            }
            (outcome, activity_applied, should_refresh)
        };

        if outcome != IngestOutcome::Unchanged {
            self.emit(EngineEvent::TimelineUpdated {
                conversation_id: conversation_id.clone(),
            });
        }
        if activity_applied {
            self.emit(EngineEvent::ConversationsUpdated);
        }
        if should_refresh {
            debug!(
                conversation_id = %conversation_id,
                "message for unknown conversation, refreshing list"
            );
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = engine.refresh_conversations().await {
                    warn!("conversation refresh after unknown activity failed: {err}");
                    engine.emit(EngineEvent::Error(err.to_string()));
                }
                engine.inner.lock().await.refresh_inflight = false;
            });
        }
    }

    fn spawn_event_pump(self: &Arc<Self>) {
        let mut inbound = self.channel.subscribe();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(event) => engine.handle_server_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "engine event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_status_pump(self: &Arc<Self>) {
        let mut status_rx = self.channel.subscribe_status();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = *status_rx.borrow_and_update();
                {
                    let mut state = engine.inner.lock().await;
                    state.conversations.set_channel_status(status);
                }
                engine.emit(EngineEvent::ConnectivityChanged(status));
            }
        });
    }

    /// Single scheduled-expiry task over the presence min-heap. New or
    /// refreshed deadlines re-arm it through a notify instead of one
    /// timer per signal.
    fn spawn_presence_expiry(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let mut state = engine.inner.lock().await;
                    state.presence.next_deadline()
                };
                match deadline {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(at) => {
                                let changed = {
                                    let mut state = engine.inner.lock().await;
                                    state.presence.expire_due(Instant::now())
                                };
                                for conversation_id in changed {
                                    engine.emit(EngineEvent::TypingChanged { conversation_id });
                                }
                            }
                            _ = engine.presence_rearm.notified() => {}
                        }
                    }
                    None => engine.presence_rearm.notified().await,
                }
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
