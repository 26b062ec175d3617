use super::*;

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, AtomicUsize},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone};
use shared::protocol::ConversationSummary;
use tokio::sync::{mpsc, Semaphore};

use crate::{
    backoff::BackoffConfig,
    cache::CacheTtls,
    transport::{ChangeFeed, PushChannel, RestClient},
};

const ME: &str = "me";
const BOB: &str = "bob";

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("timestamp")
}

fn conversation_id() -> ConversationId {
    ConversationId::new("c1")
}

fn inbound_payload(id: &str, seconds: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId::new(id),
        conversation_id: conversation_id(),
        sender_id: UserId::new(BOB),
        content: format!("from bob {id}"),
        kind: MessageKind::Text,
        status: DeliveryStatus::Delivered,
        sent_at: at(seconds),
        read_at: None,
        client_ref: None,
        metadata: Metadata::new(),
    }
}

struct FakePush {
    events: broadcast::Sender<ServerEvent>,
    emitted: StdMutex<Vec<ClientRequest>>,
    auto_confirm: bool,
    fail_emits: AtomicBool,
}

impl FakePush {
    fn new(auto_confirm: bool) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            emitted: StdMutex::new(Vec::new()),
            auto_confirm,
            fail_emits: AtomicBool::new(false),
        }
    }

    fn deliver(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn emitted(&self) -> Vec<ClientRequest> {
        self.emitted.lock().expect("emitted").clone()
    }

    fn count(&self, matches: impl Fn(&ClientRequest) -> bool) -> usize {
        self.emitted().iter().filter(|request| matches(request)).count()
    }
}

#[async_trait]
impl PushChannel for FakePush {
    async fn emit(&self, request: ClientRequest) -> Result<(), SyncError> {
        if self.fail_emits.load(Ordering::SeqCst) {
            return Err(SyncError::Network("push down".into()));
        }
        self.emitted.lock().expect("emitted").push(request.clone());
        if self.auto_confirm {
            match request {
                ClientRequest::JoinConversation { conversation_id } => {
                    self.deliver(ServerEvent::JoinConfirmed { conversation_id });
                }
                ClientRequest::LeaveConversation { conversation_id } => {
                    self.deliver(ServerEvent::LeaveConfirmed { conversation_id });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

struct FakeRest {
    pages: StdMutex<HashMap<Option<MessageId>, MessagePage>>,
    summary: StdMutex<ConversationSummary>,
    conversation_fetches: AtomicU32,
    fail_with: StdMutex<Option<SyncError>>,
    hold: Option<Arc<Semaphore>>,
    post_calls: AtomicU32,
    posted: StdMutex<Vec<OutboundMessage>>,
    read: StdMutex<Vec<Vec<MessageId>>>,
}

impl FakeRest {
    fn new() -> Self {
        Self {
            pages: StdMutex::new(HashMap::new()),
            summary: StdMutex::new(ConversationSummary {
                conversation_id: conversation_id(),
                title: "General".into(),
                participants: vec![UserId::new(ME), UserId::new(BOB)],
                last_message: None,
                last_message_at: None,
                unread_count: 2,
            }),
            conversation_fetches: AtomicU32::new(0),
            fail_with: StdMutex::new(None),
            hold: None,
            post_calls: AtomicU32::new(0),
            posted: StdMutex::new(Vec::new()),
            read: StdMutex::new(Vec::new()),
        }
    }

    fn with_page(
        self,
        before: Option<&str>,
        messages: Vec<MessagePayload>,
        has_more: bool,
    ) -> Self {
        self.pages.lock().expect("pages").insert(
            before.map(MessageId::new),
            MessagePage { messages, has_more },
        );
        self
    }

    fn failing(self, error: SyncError) -> Self {
        *self.fail_with.lock().expect("fail_with") = Some(error);
        self
    }

    fn held(mut self, gate: Arc<Semaphore>) -> Self {
        self.hold = Some(gate);
        self
    }

    fn set_unread(&self, unread_count: u32) {
        self.summary.lock().expect("summary").unread_count = unread_count;
    }

    fn recover(&self) {
        *self.fail_with.lock().expect("fail_with") = None;
    }

    fn server_id(client_ref: &TempId) -> MessageId {
        MessageId::new(format!("srv-{client_ref}"))
    }
}

#[async_trait]
impl RestClient for FakeRest {
    async fn fetch_messages(
        &self,
        _conversation_id: &ConversationId,
        query: &PageQuery,
    ) -> Result<MessagePage, SyncError> {
        Ok(self
            .pages
            .lock()
            .expect("pages")
            .get(&query.before)
            .cloned()
            .unwrap_or(MessagePage {
                messages: Vec::new(),
                has_more: false,
            }))
    }

    async fn fetch_conversation(
        &self,
        _conversation_id: &ConversationId,
    ) -> Result<ConversationSummary, SyncError> {
        self.conversation_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.summary.lock().expect("summary").clone())
    }

    async fn post_message(&self, message: &OutboundMessage) -> Result<MessagePayload, SyncError> {
        self.post_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.hold {
            gate.acquire().await.expect("gate").forget();
        }
        if let Some(err) = self.fail_with.lock().expect("fail_with").clone() {
            return Err(err);
        }
        self.posted.lock().expect("posted").push(message.clone());
        Ok(MessagePayload {
            message_id: Self::server_id(&message.client_ref),
            conversation_id: message.conversation_id.clone(),
            sender_id: UserId::new(ME),
            content: message.content.clone(),
            kind: message.kind,
            status: DeliveryStatus::Sent,
            sent_at: message.sent_at,
            read_at: None,
            client_ref: Some(message.client_ref.clone()),
            metadata: message.metadata.clone(),
        })
    }

    async fn mark_read(
        &self,
        _conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<(), SyncError> {
        self.read.lock().expect("read").push(message_ids.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct FakeFeed {
    sender: StdMutex<Option<mpsc::Sender<FeedChange>>>,
    cancelled: Arc<AtomicBool>,
}

impl FakeFeed {
    fn sender(&self) -> Option<mpsc::Sender<FeedChange>> {
        self.sender.lock().expect("sender").clone()
    }
}

impl ChangeFeed for FakeFeed {
    fn subscribe(&self, query: FeedQuery) -> FeedSubscription {
        assert_eq!(query.conversation_id, conversation_id());
        let (tx, rx) = mpsc::channel(16);
        *self.sender.lock().expect("sender") = Some(tx);
        let cancelled = Arc::clone(&self.cancelled);
        FeedSubscription::new(rx, move || cancelled.store(true, Ordering::SeqCst))
    }
}

struct Harness {
    push: Arc<FakePush>,
    rest: Arc<FakeRest>,
    feed: Arc<FakeFeed>,
    session: Arc<ConversationSession>,
    errors: Arc<StdMutex<Vec<SyncError>>>,
}

fn test_settings() -> SessionSettings {
    SessionSettings {
        join_timeout: Some(Duration::from_secs(5)),
        ..SessionSettings::default()
    }
}

fn harness_with(rest: FakeRest, auto_confirm: bool, settings: SessionSettings) -> Harness {
    let push = Arc::new(FakePush::new(auto_confirm));
    let rest = Arc::new(rest);
    let feed = Arc::new(FakeFeed::default());
    let registry = SyncRegistry::new(
        BackoffConfig {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            max_retries: 3,
            jitter: 0.0,
        },
        CacheTtls::default(),
    );
    let transports =
        Transports::new(push.clone(), rest.clone()).with_change_feed(feed.clone());
    let session = ConversationSession::new(
        conversation_id(),
        UserId::new(ME),
        transports,
        registry,
        settings,
    );
    let errors = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    session.on_error(move |err| sink.lock().expect("errors").push(err.clone()));
    Harness {
        push,
        rest,
        feed,
        session,
        errors,
    }
}

fn harness(rest: FakeRest) -> Harness {
    harness_with(rest, true, test_settings())
}

async fn joined(rest: FakeRest) -> Harness {
    let h = harness(rest);
    h.session.join().await.expect("join");
    wait_for_membership(&h.session, MembershipState::Joined).await;
    let session = Arc::clone(&h.session);
    for _ in 0..200 {
        {
            let state = session.inner.lock().await;
            if state.history_loaded && state.conversation.title == "General" {
                return h;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("initial sync did not finish");
}

async fn wait_for_membership(session: &ConversationSession, expected: MembershipState) {
    for _ in 0..200 {
        if session.membership().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "membership never reached {expected}, stuck at {}",
        session.membership().await
    );
}

async fn wait_for_messages(
    session: &ConversationSession,
    check: impl Fn(&[Message]) -> bool,
) -> Vec<Message> {
    for _ in 0..400 {
        let messages = session.messages().await;
        if check(&messages) {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timeline never matched: {:?}", session.messages().await);
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

fn is_join(request: &ClientRequest) -> bool {
    matches!(request, ClientRequest::JoinConversation { .. })
}

fn is_leave(request: &ClientRequest) -> bool {
    matches!(request, ClientRequest::LeaveConversation { .. })
}

fn all_confirmed(messages: &[Message]) -> bool {
    !messages.is_empty() && messages.iter().all(|message| message.id.confirmed().is_some())
}

#[tokio::test(start_paused = true)]
async fn join_confirms_and_runs_initial_sync() {
    let h = joined(FakeRest::new().with_page(None, vec![inbound_payload("m0", 0)], false)).await;

    let messages = h.session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].direction, Direction::Inbound);
    let conversation = h.session.conversation().await;
    assert_eq!(conversation.title, "General");
    assert_eq!(conversation.unread_count, 2);
    assert_eq!(h.push.count(is_join), 1);
    assert!(!h.session.has_more().await);
}

#[tokio::test(start_paused = true)]
async fn repeated_join_sends_one_request() {
    let h = joined(FakeRest::new()).await;

    h.session.join().await.expect("second join");
    h.session.join().await.expect("third join");

    assert_eq!(h.push.count(is_join), 1);
    assert_eq!(h.session.membership().await, MembershipState::Joined);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_join_times_out_to_idle() {
    let h = harness_with(FakeRest::new(), false, test_settings());
    let states = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    h.session
        .on_membership_changed(move |state| sink.lock().expect("states").push(*state));

    h.session.join().await.expect("join");
    assert_eq!(h.session.membership().await, MembershipState::Joining);

    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(h.session.membership().await, MembershipState::Idle);
    assert_eq!(
        *states.lock().expect("states"),
        vec![MembershipState::Joining, MembershipState::Idle]
    );
    assert!(h
        .errors
        .lock()
        .expect("errors")
        .contains(&SyncError::Timeout));
}

#[tokio::test(start_paused = true)]
async fn join_without_timeout_waits_indefinitely() {
    let settings = SessionSettings {
        join_timeout: None,
        ..SessionSettings::default()
    };
    let h = harness_with(FakeRest::new(), false, settings);
    h.session.join().await.expect("join");

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.session.membership().await, MembershipState::Joining);

    h.push.deliver(ServerEvent::JoinConfirmed {
        conversation_id: conversation_id(),
    });
    wait_for_membership(&h.session, MembershipState::Joined).await;
}

#[tokio::test(start_paused = true)]
async fn failed_join_request_reverts_to_idle() {
    let h = harness(FakeRest::new());
    h.push.fail_emits.store(true, Ordering::SeqCst);

    let err = h.session.join().await.expect_err("join fails");

    assert!(matches!(err, SyncError::RetriesExhausted { .. }));
    assert_eq!(h.session.membership().await, MembershipState::Idle);
}

#[tokio::test(start_paused = true)]
async fn operations_before_join_are_rejected() {
    let h = harness(FakeRest::new());

    let err = h.session.send_text("too early").await.expect_err("not joined");
    assert_eq!(
        err,
        SyncError::InvalidState {
            operation: "send",
            state: MembershipState::Idle,
        }
    );
    assert!(h.session.messages().await.is_empty());
    assert!(matches!(
        h.session.mark_read(&[MessageId::new("m1")]).await,
        Err(SyncError::InvalidState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn leave_while_joining_is_rejected() {
    let h = harness_with(FakeRest::new(), false, test_settings());
    h.session.join().await.expect("join");

    let err = h.session.leave().await.expect_err("joining");

    assert_eq!(
        err,
        SyncError::InvalidState {
            operation: "leave",
            state: MembershipState::Joining,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn leave_sends_one_request_and_reaches_left() {
    let h = joined(FakeRest::new()).await;

    h.session.leave().await.expect("leave");
    wait_for_membership(&h.session, MembershipState::Left).await;
    h.session.leave().await.expect("second leave is a no-op");

    assert_eq!(h.push.count(is_leave), 1);
    assert!(matches!(
        h.session.send_text("after leave").await,
        Err(SyncError::InvalidState {
            state: MembershipState::Left,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_leave_still_reaches_left() {
    let h = harness_with(FakeRest::new(), false, test_settings());
    h.session.join().await.expect("join");
    h.push.deliver(ServerEvent::JoinConfirmed {
        conversation_id: conversation_id(),
    });
    wait_for_membership(&h.session, MembershipState::Joined).await;

    h.session.leave().await.expect("leave");
    assert_eq!(h.session.membership().await, MembershipState::Leaving);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(h.session.membership().await, MembershipState::Left);
}

#[tokio::test(start_paused = true)]
async fn rejoin_after_leave_starts_a_new_cycle() {
    let h = joined(FakeRest::new()).await;
    h.session.leave().await.expect("leave");
    wait_for_membership(&h.session, MembershipState::Left).await;

    h.session.join().await.expect("rejoin");
    wait_for_membership(&h.session, MembershipState::Joined).await;

    assert_eq!(h.push.count(is_join), 2);
}

#[tokio::test(start_paused = true)]
async fn send_shows_placeholder_then_confirmed_message() {
    let h = joined(FakeRest::new()).await;

    let placeholder = h.session.send_text("hi").await.expect("send");
    assert_eq!(placeholder.status, DeliveryStatus::Sending);
    let temp_id = placeholder.id.pending().cloned().expect("pending id");

    let messages = wait_for_messages(&h.session, all_confirmed).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0].id,
        MessageRef::Confirmed(FakeRest::server_id(&temp_id))
    );
    assert_eq!(messages[0].status, DeliveryStatus::Sent);
    assert_eq!(messages[0].direction, Direction::Outbound);
    assert_eq!(h.session.pending_count().await, 0);

    eventually(|| {
        h.push
            .count(|request| matches!(request, ClientRequest::SendMessage { .. }))
            == 1
    })
    .await;
    let conversation = h.session.conversation().await;
    assert_eq!(conversation.last_message.as_deref(), Some("hi"));
}

#[tokio::test(start_paused = true)]
async fn push_echo_after_rest_confirmation_keeps_one_entry() {
    let h = joined(FakeRest::new()).await;
    let placeholder = h.session.send_text("hi").await.expect("send");
    let temp_id = placeholder.id.pending().cloned().expect("pending id");
    wait_for_messages(&h.session, all_confirmed).await;

    h.push.deliver(ServerEvent::MessageReceived {
        message: MessagePayload {
            message_id: FakeRest::server_id(&temp_id),
            conversation_id: conversation_id(),
            sender_id: UserId::new(ME),
            content: "hi".into(),
            kind: MessageKind::Text,
            status: DeliveryStatus::Delivered,
            sent_at: placeholder.timestamp,
            read_at: None,
            client_ref: Some(temp_id),
            metadata: Metadata::new(),
        },
    });

    let messages = wait_for_messages(&h.session, |messages| {
        messages
            .first()
            .is_some_and(|message| message.status == DeliveryStatus::Delivered)
    })
    .await;
    assert_eq!(messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn push_echo_before_rest_confirmation_keeps_one_entry() {
    let gate = Arc::new(Semaphore::new(0));
    let h = joined(FakeRest::new().held(Arc::clone(&gate))).await;
    let placeholder = h.session.send_text("hi").await.expect("send");
    let temp_id = placeholder.id.pending().cloned().expect("pending id");

    h.push.deliver(ServerEvent::MessageReceived {
        message: MessagePayload {
            message_id: FakeRest::server_id(&temp_id),
            conversation_id: conversation_id(),
            sender_id: UserId::new(ME),
            content: "hi".into(),
            kind: MessageKind::Text,
            status: DeliveryStatus::Delivered,
            sent_at: placeholder.timestamp,
            read_at: None,
            client_ref: Some(temp_id),
            metadata: Metadata::new(),
        },
    });
    wait_for_messages(&h.session, all_confirmed).await;

    gate.add_permits(1);
    eventually(|| h.rest.posted.lock().expect("posted").len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let messages = h.session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, DeliveryStatus::Delivered);
}

#[tokio::test(start_paused = true)]
async fn delivery_ack_before_rest_confirmation_is_kept() {
    let gate = Arc::new(Semaphore::new(0));
    let h = joined(FakeRest::new().held(Arc::clone(&gate))).await;
    let placeholder = h.session.send_text("hi").await.expect("send");
    let temp_id = placeholder.id.pending().cloned().expect("pending id");

    h.push.deliver(ServerEvent::MessageStatusChanged {
        conversation_id: conversation_id(),
        message_id: FakeRest::server_id(&temp_id),
        status: DeliveryStatus::Delivered,
        at: at(5),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.messages().await[0].status, DeliveryStatus::Sending);

    gate.add_permits(1);
    let messages = wait_for_messages(&h.session, all_confirmed).await;

    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0].id,
        MessageRef::Confirmed(FakeRest::server_id(&temp_id))
    );
    assert_eq!(messages[0].status, DeliveryStatus::Delivered);
    assert_eq!(h.session.inner.lock().await.reconciler.held_status_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn held_acks_are_dropped_on_leave() {
    let h = joined(FakeRest::new()).await;
    h.push.deliver(ServerEvent::MessageStatusChanged {
        conversation_id: conversation_id(),
        message_id: MessageId::new("not-yet-seen"),
        status: DeliveryStatus::Read,
        at: at(1),
    });
    for _ in 0..100 {
        if h.session.inner.lock().await.reconciler.held_status_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.session.inner.lock().await.reconciler.held_status_count(), 1);

    h.session.leave().await.expect("leave");
    wait_for_membership(&h.session, MembershipState::Left).await;

    assert_eq!(h.session.inner.lock().await.reconciler.held_status_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn lagged_resync_refetches_conversation_instead_of_cached_copy() {
    let h = joined(FakeRest::new()).await;
    for (n, id) in ["m1", "m2", "m3"].into_iter().enumerate() {
        h.push.deliver(ServerEvent::MessageReceived {
            message: inbound_payload(id, n as i64),
        });
    }
    for _ in 0..100 {
        if h.session.conversation().await.unread_count == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.session.conversation().await.unread_count, 5);
    assert_eq!(h.rest.conversation_fetches.load(Ordering::SeqCst), 1);

    // The server has counted the same three messages by now.
    h.rest.set_unread(5);
    for _ in 0..80 {
        h.push.deliver(ServerEvent::TypingChanged {
            conversation_id: conversation_id(),
            user_id: UserId::new(BOB),
            active: true,
        });
    }
    for _ in 0..200 {
        if h.rest.conversation_fetches.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.rest.conversation_fetches.load(Ordering::SeqCst), 2);
    assert_eq!(h.session.conversation().await.unread_count, 5);
    assert_eq!(h.session.messages().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_send_fails_then_retry_delivers() {
    let h = joined(FakeRest::new().failing(SyncError::Network("offline".into()))).await;

    let placeholder = h.session.send_text("retry me").await.expect("send");
    let messages = wait_for_messages(&h.session, |messages| {
        messages
            .first()
            .is_some_and(|message| message.status == DeliveryStatus::Failed)
    })
    .await;
    assert_eq!(messages[0].id, placeholder.id);
    assert_eq!(h.rest.post_calls.load(Ordering::SeqCst), 4);
    assert!(h.errors.lock().expect("errors").iter().any(|err| matches!(
        err,
        SyncError::RetriesExhausted { attempts: 4, .. }
    )));

    h.rest.recover();
    let fresh = h.session.retry(&placeholder.id).await.expect("retry");
    assert_eq!(fresh.status, DeliveryStatus::Sending);
    assert_ne!(fresh.id, placeholder.id);

    let messages = wait_for_messages(&h.session, all_confirmed).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "retry me");
}

#[tokio::test(start_paused = true)]
async fn terminal_send_error_fails_without_retrying() {
    let h = joined(FakeRest::new().failing(SyncError::Validation("too long".into()))).await;

    h.session.send_text("x").await.expect("send");
    wait_for_messages(&h.session, |messages| {
        messages
            .first()
            .is_some_and(|message| message.status == DeliveryStatus::Failed)
    })
    .await;

    assert_eq!(h.rest.post_calls.load(Ordering::SeqCst), 1);
    assert!(h
        .errors
        .lock()
        .expect("errors")
        .contains(&SyncError::Validation("too long".into())));
}

#[tokio::test(start_paused = true)]
async fn retry_rejects_messages_that_are_not_failed() {
    let gate = Arc::new(Semaphore::new(0));
    let h = joined(FakeRest::new().held(gate)).await;
    let placeholder = h.session.send_text("in flight").await.expect("send");

    assert!(matches!(
        h.session.retry(&placeholder.id).await,
        Err(SyncError::InvalidMessageState {
            status: DeliveryStatus::Sending,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn discard_removes_failed_message() {
    let h = joined(FakeRest::new().failing(SyncError::Forbidden("muted".into()))).await;
    let placeholder = h.session.send_text("nope").await.expect("send");
    wait_for_messages(&h.session, |messages| {
        messages
            .first()
            .is_some_and(|message| message.status == DeliveryStatus::Failed)
    })
    .await;

    let removed = h.session.discard(&placeholder.id).await.expect("discard");

    assert_eq!(removed.content, "nope");
    assert!(h.session.messages().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn inbound_events_merge_once_and_bump_unread() {
    let h = joined(FakeRest::new()).await;

    for _ in 0..2 {
        h.push.deliver(ServerEvent::MessageReceived {
            message: inbound_payload("m5", 5),
        });
    }
    wait_for_messages(&h.session, |messages| messages.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.session.messages().await.len(), 1);
    assert_eq!(h.session.conversation().await.unread_count, 3);

    h.push.deliver(ServerEvent::MessageStatusChanged {
        conversation_id: conversation_id(),
        message_id: MessageId::new("m5"),
        status: DeliveryStatus::Read,
        at: at(9),
    });
    h.push.deliver(ServerEvent::MessageStatusChanged {
        conversation_id: conversation_id(),
        message_id: MessageId::new("m5"),
        status: DeliveryStatus::Delivered,
        at: at(10),
    });
    let messages = wait_for_messages(&h.session, |messages| {
        messages[0].status == DeliveryStatus::Read
    })
    .await;
    assert_eq!(messages[0].read_at, Some(at(9)));
}

#[tokio::test(start_paused = true)]
async fn events_for_other_conversations_are_ignored() {
    let h = joined(FakeRest::new()).await;
    let mut other = inbound_payload("x1", 1);
    other.conversation_id = ConversationId::new("c2");

    h.push.deliver(ServerEvent::MessageReceived { message: other });
    h.push.deliver(ServerEvent::MessageReceived {
        message: inbound_payload("m1", 2),
    });

    let messages = wait_for_messages(&h.session, |messages| !messages.is_empty()).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageRef::Confirmed(MessageId::new("m1")));
}

#[tokio::test(start_paused = true)]
async fn mark_read_updates_locally_then_unread_after_confirmation() {
    let h = joined(FakeRest::new().with_page(None, vec![inbound_payload("m0", 0)], false)).await;

    let marked = h
        .session
        .mark_read(&[MessageId::new("m0"), MessageId::new("unknown")])
        .await
        .expect("mark read");
    assert_eq!(marked, 1);
    let messages = h.session.messages().await;
    assert_eq!(messages[0].status, DeliveryStatus::Read);
    assert!(messages[0].read_at.is_some());

    eventually(|| h.rest.read.lock().expect("read").len() == 1).await;
    for _ in 0..50 {
        if h.session.conversation().await.unread_count == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.session.conversation().await.unread_count, 1);

    let again = h
        .session
        .mark_read(&[MessageId::new("m0")])
        .await
        .expect("mark read again");
    assert_eq!(again, 0);
}

#[tokio::test(start_paused = true)]
async fn load_older_pages_backwards_until_exhausted() {
    let rest = FakeRest::new()
        .with_page(
            None,
            vec![inbound_payload("m10", 10), inbound_payload("m11", 11)],
            true,
        )
        .with_page(
            Some("m10"),
            vec![inbound_payload("m8", 8), inbound_payload("m9", 9)],
            false,
        );
    let h = joined(rest).await;
    assert!(h.session.has_more().await);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let merged = h.session.load_older().await.expect("older");

    assert_eq!(merged, 2);
    let ids = h
        .session
        .messages()
        .await
        .iter()
        .map(|message| message.id.to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["m8", "m9", "m10", "m11"]);
    assert!(!h.session.has_more().await);
    assert_eq!(h.session.load_older().await.expect("exhausted"), 0);
}

#[tokio::test(start_paused = true)]
async fn change_feed_adds_and_removes_messages() {
    let h = joined(FakeRest::new()).await;
    eventually(|| h.feed.sender().is_some()).await;
    let feed = h.feed.sender().expect("feed sender");

    feed.send(FeedChange::Added(inbound_payload("f1", 1)))
        .await
        .expect("send");
    wait_for_messages(&h.session, |messages| messages.len() == 1).await;

    feed.send(FeedChange::Removed {
        conversation_id: conversation_id(),
        message_id: MessageId::new("f1"),
    })
    .await
    .expect("send");
    wait_for_messages(&h.session, |messages| messages.is_empty()).await;

    h.session.close().await;
    eventually(|| h.feed.cancelled.load(Ordering::SeqCst)).await;
}

#[tokio::test(start_paused = true)]
async fn typing_announces_once_and_stops_after_timeout() {
    let h = joined(FakeRest::new()).await;
    let typing = |active: bool| {
        move |request: &ClientRequest| {
            matches!(request, ClientRequest::Typing { active: value, .. } if *value == active)
        }
    };

    h.session.set_typing().await.expect("typing");
    h.session.set_typing().await.expect("typing again");
    eventually(|| h.push.count(typing(true)) == 1).await;
    assert_eq!(h.push.count(typing(false)), 0);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.push.count(typing(false)), 1);
    assert_eq!(h.push.count(typing(true)), 1);
}

#[tokio::test(start_paused = true)]
async fn panicking_listener_does_not_block_delivery_to_others() {
    let h = joined(FakeRest::new()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    h.session.on_messages_changed(|_| panic!("listener bug"));
    h.session.on_messages_changed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    h.session.send_text("hello").await.expect("send");
    wait_for_messages(&h.session, all_confirmed).await;

    assert!(calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(start_paused = true)]
async fn session_events_mirror_listener_notifications() {
    let h = harness(FakeRest::new());
    let mut events = h.session.subscribe_events();

    h.session.join().await.expect("join");

    assert_eq!(
        events.recv().await.expect("event"),
        SessionEvent::MembershipChanged(MembershipState::Joining)
    );
    assert_eq!(
        events.recv().await.expect("event"),
        SessionEvent::MembershipChanged(MembershipState::Joined)
    );
}

#[tokio::test(start_paused = true)]
async fn close_tears_down_and_rejects_further_work() {
    let h = joined(FakeRest::new()).await;

    h.session.close().await;
    h.session.close().await;

    assert_eq!(h.session.membership().await, MembershipState::Left);
    eventually(|| h.push.count(is_leave) == 1).await;
    assert_eq!(
        h.session.send_text("late").await.expect_err("closed"),
        SyncError::SessionClosed
    );
    assert_eq!(
        h.session.join().await.expect_err("closed"),
        SyncError::SessionClosed
    );
}

#[tokio::test(start_paused = true)]
async fn close_drops_in_flight_confirmations() {
    let gate = Arc::new(Semaphore::new(0));
    let h = joined(FakeRest::new().held(Arc::clone(&gate))).await;
    let placeholder = h.session.send_text("in flight").await.expect("send");
    eventually(|| h.rest.post_calls.load(Ordering::SeqCst) == 1).await;

    h.session.close().await;
    gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let messages = h.session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, placeholder.id);
    assert_eq!(messages[0].status, DeliveryStatus::Sending);
}
