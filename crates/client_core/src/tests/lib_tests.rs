use super::*;
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use shared::{
    domain::{ConversationKind, MessageKind},
    protocol::{ConversationSummary, MessagePage, MessagePayload},
};
use tokio::time::timeout;

struct FakeTransport {
    events: broadcast::Sender<ServerEvent>,
    refuse_connect: AtomicBool,
    fail_send: AtomicBool,
    sent: Mutex<Vec<ClientRequest>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            refuse_connect: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ChannelTransport for FakeTransport {
    async fn connect(&self) -> Result<(), EngineError> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("connect refused".to_string()));
        }
        Ok(())
    }

    async fn send(&self, request: ClientRequest) -> Result<(), EngineError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("send failed".to_string()));
        }
        self.sent.lock().await.push(request);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

type PageKey = (String, Option<String>);

#[derive(Default)]
struct FakeGateway {
    conversations: Mutex<Vec<ConversationSummary>>,
    pages: Mutex<HashMap<PageKey, MessagePage>>,
    post_reply: Mutex<Option<MessagePayload>>,
    posted: Mutex<Vec<NewMessageRequest>>,
    mark_reads: Mutex<Vec<ConversationId>>,
    recalls: Mutex<Vec<MessageId>>,
    typing_posts: Mutex<Vec<(ConversationId, bool)>>,
    fail_messages: AtomicBool,
    typing_supported: bool,
}

impl FakeGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_typing() -> Arc<Self> {
        Arc::new(Self {
            typing_supported: true,
            ..Self::default()
        })
    }

    async fn set_conversations(&self, summaries: Vec<ConversationSummary>) {
        *self.conversations.lock().await = summaries;
    }

    async fn set_page(&self, conversation: &str, before: Option<&str>, page: MessagePage) {
        self.pages.lock().await.insert(
            (conversation.to_string(), before.map(str::to_string)),
            page,
        );
    }
}

#[async_trait]
impl RestGateway for FakeGateway {
    async fn list_conversations(
        &self,
        _limit: u32,
        _offset: u32,
    ) -> Result<Vec<ConversationSummary>, EngineError> {
        Ok(self.conversations.lock().await.clone())
    }

    async fn conversation_detail(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationSummary, EngineError> {
        self.conversations
            .lock()
            .await
            .iter()
            .find(|c| &c.conversation_id == conversation_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownConversation(conversation_id.clone()))
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        _limit: u32,
        before_message_id: Option<&MessageId>,
    ) -> Result<MessagePage, EngineError> {
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("message fetch failed".to_string()));
        }
        let key = (
            conversation_id.0.clone(),
            before_message_id.map(|id| id.0.clone()),
        );
        Ok(self
            .pages
            .lock()
            .await
            .get(&key)
            .cloned()
            .unwrap_or(MessagePage {
                messages: Vec::new(),
                has_more: false,
            }))
    }

    async fn post_message(
        &self,
        request: &NewMessageRequest,
    ) -> Result<MessagePayload, EngineError> {
        self.posted.lock().await.push(request.clone());
        self.post_reply
            .lock()
            .await
            .clone()
            .ok_or_else(|| EngineError::Transport("no fallback reply configured".to_string()))
    }

    async fn post_recall(
        &self,
        _conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), EngineError> {
        self.recalls.lock().await.push(message_id.clone());
        Ok(())
    }

    async fn post_mark_read(&self, conversation_id: &ConversationId) -> Result<(), EngineError> {
        self.mark_reads.lock().await.push(conversation_id.clone());
        Ok(())
    }

    fn supports_typing(&self) -> bool {
        self.typing_supported
    }

    async fn post_typing(
        &self,
        conversation_id: &ConversationId,
        is_typing: bool,
    ) -> Result<(), EngineError> {
        self.typing_posts
            .lock()
            .await
            .push((conversation_id.clone(), is_typing));
        Ok(())
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("timestamp")
}

fn summary(id: &str, last_activity: Option<i64>) -> ConversationSummary {
    ConversationSummary {
        conversation_id: ConversationId::new(id),
        kind: ConversationKind::Private,
        name: id.to_string(),
        avatar_ref: None,
        members: vec![UserId::new("me"), UserId::new("alice")],
        last_message_preview: None,
        last_message_time: last_activity.map(ts),
        unread_count: 0,
    }
}

fn payload(conv: &str, id: &str, sender: &str, secs: i64, content: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId::new(id),
        conversation_id: ConversationId::new(conv),
        sender_id: UserId::new(sender),
        kind: MessageKind::Text,
        content: content.to_string(),
        file_meta: None,
        created_at: ts(secs),
        is_recalled: false,
    }
}

fn payload_now(conv: &str, id: &str, sender: &str, content: &str) -> MessagePayload {
    MessagePayload {
        created_at: Utc::now(),
        ..payload(conv, id, sender, 0, content)
    }
}

async fn started_engine(
    transport: &Arc<FakeTransport>,
    gateway: &Arc<FakeGateway>,
) -> Arc<SyncEngine> {
    let engine = SyncEngine::new(
        EngineConfig::new(UserId::new("me")),
        Arc::clone(transport) as Arc<dyn ChannelTransport>,
        Arc::clone(gateway) as Arc<dyn RestGateway>,
    );
    engine.start().await.expect("engine start");
    engine
}

async fn wait_for_event(
    rx: &mut broadcast::Receiver<EngineEvent>,
    matches: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => {}
                Err(err) => panic!("engine event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for engine event")
}

fn is_timeline_update(event: &EngineEvent, conversation: &str) -> bool {
    matches!(
        event,
        EngineEvent::TimelineUpdated { conversation_id } if conversation_id.as_str() == conversation
    )
}

#[tokio::test]
async fn start_loads_conversations_and_connects() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway
        .set_conversations(vec![summary("c1", Some(10)), summary("c2", Some(0))])
        .await;

    let engine = started_engine(&transport, &gateway).await;

    let list = engine.conversation_list().await;
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].id.as_str(), "c1");
    assert_eq!(engine.connectivity(), ChannelStatus::Connected);
}

#[tokio::test]
async fn optimistic_send_then_confirmation_yields_single_entry() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway.set_conversations(vec![summary("c1", None)]).await;
    let engine = started_engine(&transport, &gateway).await;
    let mut rx = engine.subscribe();

    let pending_id = engine
        .send_message(ConversationId::new("c1"), MessageKind::Text, "hello", None)
        .await
        .expect("send");
    assert!(pending_id.as_str().starts_with("pending-"));

    let messages = engine.timeline_messages(&ConversationId::new("c1")).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].delivery, DeliveryState::Pending);
    assert_eq!(messages[0].content, "hello");

    let sent = transport.sent.lock().await;
    assert!(matches!(&sent[0], ClientRequest::SendMessage { content, .. } if content == "hello"));
    drop(sent);

    transport.push(ServerEvent::MessageSent {
        message: payload_now("c1", "42", "me", "hello"),
    });
    wait_for_event(&mut rx, |e| is_timeline_update(e, "c1")).await;

    let messages = engine.timeline_messages(&ConversationId::new("c1")).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_str(), "42");
    assert_eq!(messages[0].delivery, DeliveryState::Confirmed);
}

#[tokio::test]
async fn duplicate_deliveries_count_activity_exactly_once() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway.set_conversations(vec![summary("c2", Some(0))]).await;
    let engine = started_engine(&transport, &gateway).await;
    let mut rx = engine.subscribe();

    // Channel echo and fallback response race: same canonical record
    // twice. The second delivery must change nothing.
    let message = payload("c2", "7", "alice", 30, "hi");
    transport.push(ServerEvent::MessageNew {
        message: message.clone(),
    });
    wait_for_event(&mut rx, |e| is_timeline_update(e, "c2")).await;
    transport.push(ServerEvent::MessageNew { message });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let messages = engine.timeline_messages(&ConversationId::new("c2")).await;
    assert_eq!(messages.len(), 1);
    let list = engine.conversation_list().await;
    assert_eq!(list[0].unread_count, 1);
}

#[tokio::test]
async fn unread_increments_only_for_inactive_and_list_reorders() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway
        .set_conversations(vec![summary("c1", Some(10)), summary("c2", Some(0))])
        .await;
    let engine = started_engine(&transport, &gateway).await;
    engine
        .select_conversation(ConversationId::new("c1"))
        .await
        .expect("select");
    let mut rx = engine.subscribe();

    transport.push(ServerEvent::MessageNew {
        message: payload("c2", "9", "alice", 20, "newest"),
    });
    wait_for_event(&mut rx, |e| is_timeline_update(e, "c2")).await;

    let list = engine.conversation_list().await;
    assert_eq!(list[0].id.as_str(), "c2");
    assert_eq!(list[0].unread_count, 1);
    assert_eq!(list[0].last_message_preview.as_deref(), Some("newest"));

    transport.push(ServerEvent::MessageNew {
        message: payload("c1", "10", "alice", 21, "for the active one"),
    });
    wait_for_event(&mut rx, |e| is_timeline_update(e, "c1")).await;

    let list = engine.conversation_list().await;
    assert_eq!(list[0].id.as_str(), "c1");
    assert_eq!(list[0].unread_count, 0);
}

#[tokio::test]
async fn blank_text_is_rejected_before_dispatch() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    let engine = started_engine(&transport, &gateway).await;

    let err = engine
        .send_message(ConversationId::new("c1"), MessageKind::Text, "   \n", None)
        .await
        .expect_err("must reject");
    assert!(matches!(err, EngineError::Validation(_)));

    assert!(engine.timeline_messages(&ConversationId::new("c1")).await.is_empty());
    assert!(transport.sent.lock().await.is_empty());
}

#[tokio::test]
async fn transport_failure_preserves_content_for_retry() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway.set_conversations(vec![summary("c1", None)]).await;
    let engine = started_engine(&transport, &gateway).await;
    let mut rx = engine.subscribe();

    transport.fail_send.store(true, Ordering::SeqCst);
    let err = engine
        .send_message(ConversationId::new("c1"), MessageKind::Text, "keep me", None)
        .await
        .expect_err("dispatch must fail");
    assert!(matches!(err, EngineError::Transport(_)));
    wait_for_event(&mut rx, |e| matches!(e, EngineEvent::DeliveryFailed { .. })).await;

    let messages = engine.timeline_messages(&ConversationId::new("c1")).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].delivery, DeliveryState::Error);
    assert_eq!(messages[0].content, "keep me");
    let failed_id = messages[0].id.clone();

    transport.fail_send.store(false, Ordering::SeqCst);
    engine
        .retry_message(ConversationId::new("c1"), failed_id.clone())
        .await
        .expect("retry");
    let messages = engine.timeline_messages(&ConversationId::new("c1")).await;
    assert_eq!(messages[0].delivery, DeliveryState::Pending);

    transport.push(ServerEvent::MessageSent {
        message: payload_now("c1", "42", "me", "keep me"),
    });
    wait_for_event(&mut rx, |e| is_timeline_update(e, "c1")).await;
    let messages = engine.timeline_messages(&ConversationId::new("c1")).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_str(), "42");
}

#[tokio::test]
async fn http_fallback_send_reconciles_through_the_same_path() {
    let transport = FakeTransport::new();
    transport.refuse_connect.store(true, Ordering::SeqCst);
    let gateway = FakeGateway::new();
    gateway.set_conversations(vec![summary("c1", None)]).await;
    *gateway.post_reply.lock().await = Some(payload_now("c1", "42", "me", "offline hello"));

    let engine = started_engine(&transport, &gateway).await;
    assert_eq!(engine.connectivity(), ChannelStatus::Disconnected);
    let mut rx = engine.subscribe();

    engine
        .send_message(
            ConversationId::new("c1"),
            MessageKind::Text,
            "offline hello",
            None,
        )
        .await
        .expect("fallback send");
    assert_eq!(gateway.posted.lock().await.len(), 1);
    assert!(transport.sent.lock().await.is_empty());

    timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("event");
            if is_timeline_update(&event, "c1") {
                let messages = engine.timeline_messages(&ConversationId::new("c1")).await;
                if messages.len() == 1 && messages[0].id.as_str() == "42" {
                    assert_eq!(messages[0].delivery, DeliveryState::Confirmed);
                    break;
                }
            }
        }
    })
    .await
    .expect("fallback response must reconcile the pending entry");
}

#[tokio::test]
async fn typing_fallback_policy_while_disconnected() {
    let transport = FakeTransport::new();
    transport.refuse_connect.store(true, Ordering::SeqCst);

    let engine = started_engine(&transport, &FakeGateway::new()).await;
    let err = engine
        .set_typing(ConversationId::new("c1"), true)
        .await
        .expect_err("typing has no fallback here");
    assert!(matches!(err, EngineError::NoFallback { operation: "typing" }));

    let gateway = FakeGateway::with_typing();
    let engine = started_engine(&transport, &gateway).await;
    engine
        .set_typing(ConversationId::new("c1"), true)
        .await
        .expect("typing fallback enabled");
    assert_eq!(
        gateway.typing_posts.lock().await.as_slice(),
        &[(ConversationId::new("c1"), true)]
    );
}

#[tokio::test(start_paused = true)]
async fn typing_presence_expires_without_refresh() {
    let transport = FakeTransport::new();
    let engine = started_engine(&transport, &FakeGateway::new()).await;
    let mut rx = engine.subscribe();

    transport.push(ServerEvent::Typing {
        conversation_id: ConversationId::new("c1"),
        user_id: UserId::new("alice"),
        is_typing: true,
    });
    wait_for_event(&mut rx, |e| {
        matches!(e, EngineEvent::TypingChanged { conversation_id } if conversation_id.as_str() == "c1")
    })
    .await;
    assert_eq!(
        engine.typing_users(&ConversationId::new("c1")).await,
        vec![UserId::new("alice")]
    );

    // No refresh within the TTL: the expiry task must clear the entry.
    wait_for_event(&mut rx, |e| {
        matches!(e, EngineEvent::TypingChanged { conversation_id } if conversation_id.as_str() == "c1")
    })
    .await;
    assert!(!engine.is_anyone_typing(&ConversationId::new("c1")).await);
}

#[tokio::test]
async fn explicit_typing_stop_clears_immediately() {
    let transport = FakeTransport::new();
    let engine = started_engine(&transport, &FakeGateway::new()).await;
    let mut rx = engine.subscribe();

    transport.push(ServerEvent::Typing {
        conversation_id: ConversationId::new("c1"),
        user_id: UserId::new("alice"),
        is_typing: true,
    });
    wait_for_event(&mut rx, |e| matches!(e, EngineEvent::TypingChanged { .. })).await;

    transport.push(ServerEvent::Typing {
        conversation_id: ConversationId::new("c1"),
        user_id: UserId::new("alice"),
        is_typing: false,
    });
    wait_for_event(&mut rx, |e| matches!(e, EngineEvent::TypingChanged { .. })).await;
    assert!(!engine.is_anyone_typing(&ConversationId::new("c1")).await);
}

#[tokio::test]
async fn recall_applies_optimistically_and_finalizes() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway.set_conversations(vec![summary("c1", None)]).await;
    let engine = started_engine(&transport, &gateway).await;
    let mut rx = engine.subscribe();

    transport.push(ServerEvent::MessageSent {
        message: payload_now("c1", "42", "me", "oops"),
    });
    wait_for_event(&mut rx, |e| is_timeline_update(e, "c1")).await;

    engine
        .recall_message(ConversationId::new("c1"), MessageId::new("42"))
        .await
        .expect("recall");

    let messages = engine.timeline_messages(&ConversationId::new("c1")).await;
    assert!(messages[0].is_recalled);
    assert_eq!(messages[0].content, RECALLED_CONTENT);
    assert!(matches!(
        transport.sent.lock().await.last(),
        Some(ClientRequest::RecallMessage { .. })
    ));

    transport.push(ServerEvent::MessageRecalled {
        conversation_id: ConversationId::new("c1"),
        message_id: MessageId::new("42"),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let messages = engine.timeline_messages(&ConversationId::new("c1")).await;
    assert!(messages[0].is_recalled);
}

#[tokio::test]
async fn rejected_recall_reverts_to_original_content() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway.set_conversations(vec![summary("c1", None)]).await;
    let engine = started_engine(&transport, &gateway).await;
    let mut rx = engine.subscribe();

    transport.push(ServerEvent::MessageSent {
        message: payload_now("c1", "42", "me", "oops"),
    });
    wait_for_event(&mut rx, |e| is_timeline_update(e, "c1")).await;

    engine
        .recall_message(ConversationId::new("c1"), MessageId::new("42"))
        .await
        .expect("recall");

    transport.push(ServerEvent::RecallRejected {
        conversation_id: ConversationId::new("c1"),
        message_id: MessageId::new("42"),
        reason: "window expired on the server".to_string(),
    });
    let event = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::RecallReverted { .. })).await;
    match event {
        EngineEvent::RecallReverted { reason, .. } => {
            assert_eq!(reason, "window expired on the server")
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let messages = engine.timeline_messages(&ConversationId::new("c1")).await;
    assert!(!messages[0].is_recalled);
    assert_eq!(messages[0].content, "oops");
}

#[tokio::test]
async fn recall_is_refused_client_side_when_guaranteed_to_fail() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway.set_conversations(vec![summary("c1", None)]).await;
    let engine = started_engine(&transport, &gateway).await;
    let mut rx = engine.subscribe();

    // Someone else's message.
    transport.push(ServerEvent::MessageNew {
        message: payload_now("c1", "7", "alice", "hers"),
    });
    wait_for_event(&mut rx, |e| is_timeline_update(e, "c1")).await;
    let err = engine
        .recall_message(ConversationId::new("c1"), MessageId::new("7"))
        .await
        .expect_err("not the sender");
    assert!(matches!(err, EngineError::RecallRejected { .. }));

    // Own message outside the recall window.
    let mut old = payload_now("c1", "8", "me", "ancient");
    old.created_at = Utc::now() - ChronoDuration::seconds(RECALL_WINDOW_SECS + 60);
    transport.push(ServerEvent::MessageSent { message: old });
    wait_for_event(&mut rx, |e| is_timeline_update(e, "c1")).await;
    let err = engine
        .recall_message(ConversationId::new("c1"), MessageId::new("8"))
        .await
        .expect_err("outside window");
    assert!(matches!(err, EngineError::RecallRejected { .. }));

    // Neither refusal touched the timeline.
    let messages = engine.timeline_messages(&ConversationId::new("c1")).await;
    assert!(messages.iter().all(|m| !m.is_recalled));
}

#[tokio::test]
async fn message_for_unknown_conversation_triggers_list_refresh() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway.set_conversations(vec![summary("c1", None)]).await;
    let engine = started_engine(&transport, &gateway).await;
    let mut rx = engine.subscribe();

    // The server now knows a conversation this client has never seen.
    gateway
        .set_conversations(vec![summary("c1", None), summary("ghost", Some(50))])
        .await;
    transport.push(ServerEvent::MessageNew {
        message: payload("ghost", "1", "alice", 50, "boo"),
    });

    timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("event");
            if matches!(event, EngineEvent::ConversationsUpdated) {
                let list = engine.conversation_list().await;
                if list.iter().any(|c| c.id.as_str() == "ghost") {
                    break;
                }
            }
        }
    })
    .await
    .expect("list refresh must materialize the new conversation");
}

#[tokio::test]
async fn stale_pagination_response_is_discarded() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway
        .set_conversations(vec![summary("c1", Some(21)), summary("c2", Some(0))])
        .await;
    gateway
        .set_page(
            "c1",
            None,
            MessagePage {
                messages: vec![
                    payload("c1", "21", "alice", 21, "u"),
                    payload("c1", "20", "alice", 20, "t"),
                ],
                has_more: true,
            },
        )
        .await;
    gateway
        .set_page(
            "c1",
            Some("20"),
            MessagePage {
                messages: vec![
                    payload("c1", "11", "alice", 11, "r"),
                    payload("c1", "10", "alice", 10, "q"),
                ],
                has_more: false,
            },
        )
        .await;
    let engine = started_engine(&transport, &gateway).await;

    engine
        .select_conversation(ConversationId::new("c1"))
        .await
        .expect("select c1");
    assert_eq!(engine.timeline_messages(&ConversationId::new("c1")).await.len(), 2);

    // The user moved on; the older page for c1 must be discarded.
    engine
        .select_conversation(ConversationId::new("c2"))
        .await
        .expect("select c2");
    engine
        .load_older_messages(ConversationId::new("c1"))
        .await
        .expect("stale load");
    assert_eq!(engine.timeline_messages(&ConversationId::new("c1")).await.len(), 2);

    // Back on c1 the same page merges: ascending, no overlap, no gaps.
    engine
        .select_conversation(ConversationId::new("c1"))
        .await
        .expect("select c1 again");
    engine
        .load_older_messages(ConversationId::new("c1"))
        .await
        .expect("older load");

    let ids: Vec<String> = engine
        .timeline_messages(&ConversationId::new("c1"))
        .await
        .iter()
        .map(|m| m.id.0.clone())
        .collect();
    assert_eq!(ids, vec!["10", "11", "20", "21"]);
    assert!(!engine.has_older_messages(&ConversationId::new("c1")).await);
}

#[tokio::test]
async fn initial_page_failure_leaves_timeline_unchanged() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway.set_conversations(vec![summary("c1", None)]).await;
    gateway.fail_messages.store(true, Ordering::SeqCst);
    let engine = started_engine(&transport, &gateway).await;

    engine
        .select_conversation(ConversationId::new("c1"))
        .await
        .expect("select must not propagate the load failure");
    assert!(engine.timeline_messages(&ConversationId::new("c1")).await.is_empty());
}

#[tokio::test]
async fn mark_read_zeroes_badge_and_sends_receipt() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway.set_conversations(vec![summary("c2", Some(0))]).await;
    let engine = started_engine(&transport, &gateway).await;
    let mut rx = engine.subscribe();

    transport.push(ServerEvent::MessageNew {
        message: payload("c2", "1", "alice", 5, "unread"),
    });
    wait_for_event(&mut rx, |e| is_timeline_update(e, "c2")).await;
    assert_eq!(engine.conversation_list().await[0].unread_count, 1);

    engine
        .mark_read(ConversationId::new("c2"))
        .await
        .expect("mark read");
    assert_eq!(engine.conversation_list().await[0].unread_count, 0);
    assert!(matches!(
        transport.sent.lock().await.last(),
        Some(ClientRequest::MarkRead { conversation_id }) if conversation_id.as_str() == "c2"
    ));
}

#[tokio::test]
async fn own_read_receipt_from_another_device_clears_badge() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    gateway.set_conversations(vec![summary("c2", Some(0))]).await;
    let engine = started_engine(&transport, &gateway).await;
    let mut rx = engine.subscribe();

    transport.push(ServerEvent::MessageNew {
        message: payload("c2", "1", "alice", 5, "unread"),
    });
    wait_for_event(&mut rx, |e| is_timeline_update(e, "c2")).await;

    transport.push(ServerEvent::MessageRead {
        conversation_id: ConversationId::new("c2"),
        user_id: UserId::new("me"),
        read_up_to_message_id: MessageId::new("1"),
    });
    wait_for_event(&mut rx, |e| matches!(e, EngineEvent::ConversationsUpdated)).await;
    assert_eq!(engine.conversation_list().await[0].unread_count, 0);
}

#[tokio::test]
async fn connectivity_indicator_is_mirrored_into_the_store() {
    let transport = FakeTransport::new();
    let gateway = FakeGateway::new();
    let engine = started_engine(&transport, &gateway).await;
    let mut rx = engine.subscribe();

    transport.push(ServerEvent::Disconnected);
    wait_for_event(&mut rx, |e| {
        matches!(e, EngineEvent::ConnectivityChanged(ChannelStatus::Disconnected))
    })
    .await;
    assert_eq!(engine.connectivity(), ChannelStatus::Disconnected);
    {
        let state = engine.inner.lock().await;
        assert_eq!(
            state.conversations.channel_status(),
            ChannelStatus::Disconnected
        );
    }

    transport.push(ServerEvent::Connected);
    wait_for_event(&mut rx, |e| {
        matches!(e, EngineEvent::ConnectivityChanged(ChannelStatus::Connected))
    })
    .await;
    assert_eq!(engine.connectivity(), ChannelStatus::Connected);
}
