//! Spawned tasks hold only a [`Weak`] reference to their session and become
//! no-ops once the session is closed or dropped.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use chrono::Utc;
use shared::{
    domain::{
        Conversation, ConversationId, DeliveryStatus, Direction, MembershipState, Message,
        MessageId, MessageKind, MessageRef, Metadata, TempId, UserId,
    },
    protocol::{
        ClientRequest, MessagePage, MessagePayload, OutboundMessage, PageQuery, ServerEvent,
    },
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        Mutex,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backoff::{OperationKind, RetryKey},
    delivery::{ConfirmOutcome, DeliveryPipeline},
    error::SyncError,
    listeners::{ListenerId, SessionListeners},
    membership::{JoinStart, LeaveStart, MembershipMachine},
    reconciler::{message_from_payload, EventReconciler, EventSource, MergeOutcome},
    registry::SyncRegistry,
    throttle::{OperationClass, ThrottleGates, ThrottleSettings},
    transport::{FeedChange, FeedQuery, FeedSubscription, Transports},
};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub page_size: u32,
    /// `None` waits for the join confirmation indefinitely.
    pub join_timeout: Option<Duration>,
    /// `None` waits for the leave confirmation indefinitely.
    pub leave_timeout: Option<Duration>,
    pub typing_timeout: Duration,
    pub throttle: ThrottleSettings,
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            join_timeout: Some(Duration::from_secs(30)),
            leave_timeout: Some(Duration::from_secs(10)),
            typing_timeout: Duration::from_secs(3),
            throttle: ThrottleSettings::default(),
            event_buffer: 256,
        }
    }
}

/// Broadcast mirror of the listener callbacks, for async consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MessagesChanged(Vec<Message>),
    MembershipChanged(MembershipState),
    ConversationChanged(Conversation),
    TypingChanged { user_id: UserId, active: bool },
    Error(SyncError),
}

#[derive(Debug)]
struct SessionState {
    membership: MembershipMachine,
    reconciler: EventReconciler,
    delivery: DeliveryPipeline,
    conversation: Conversation,
    has_more: bool,
    history_loaded: bool,
}

#[derive(Debug, Default)]
struct SessionTasks {
    event_loop: Option<JoinHandle<()>>,
    join_timer: Option<JoinHandle<()>>,
    leave_timer: Option<JoinHandle<()>>,
    typing_stop: Option<(u64, JoinHandle<()>)>,
    initial_sync: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn abort_all(&mut self) {
        let handles = [
            self.event_loop.take(),
            self.join_timer.take(),
            self.leave_timer.take(),
            self.initial_sync.take(),
            self.typing_stop.take().map(|(_, handle)| handle),
        ];
        for handle in handles.into_iter().flatten() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaveOrigin {
    Confirmed,
    TimedOut,
    RequestFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageKind {
    Latest,
    Older,
}

enum Signal {
    Push(ServerEvent),
    Feed(FeedChange),
    FeedEnded,
    Lagged(u64),
    PushClosed,
}

enum LoopControl {
    Continue,
    StartFeed,
    Stop,
}

pub struct ConversationSession {
    conversation_id: ConversationId,
    user_id: UserId,
    settings: SessionSettings,
    transports: Transports,
    registry: SyncRegistry,
    gates: ThrottleGates,
    inner: Mutex<SessionState>,
    tasks: StdMutex<SessionTasks>,
    listeners: SessionListeners,
    events: broadcast::Sender<SessionEvent>,
    closed: AtomicBool,
    typing_generation: AtomicU64,
}

impl ConversationSession {
    pub fn new(
        conversation_id: ConversationId,
        user_id: UserId,
        transports: Transports,
        registry: SyncRegistry,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Arc::new(Self {
            gates: ThrottleGates::new(&settings.throttle),
            inner: Mutex::new(SessionState {
                membership: MembershipMachine::new(),
                reconciler: EventReconciler::new(),
                delivery: DeliveryPipeline::new(),
                conversation: Conversation::empty(conversation_id.clone()),
                has_more: true,
                history_loaded: false,
            }),
            conversation_id,
            user_id,
            settings,
            transports,
            registry,
            tasks: StdMutex::new(SessionTasks::default()),
            listeners: SessionListeners::new(),
            events,
            closed: AtomicBool::new(false),
            typing_generation: AtomicU64::new(0),
        })
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn membership(&self) -> MembershipState {
        self.inner.lock().await.membership.state()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.reconciler.timeline().snapshot()
    }

    pub async fn conversation(&self) -> Conversation {
        self.inner.lock().await.conversation.clone()
    }

    pub async fn has_more(&self) -> bool {
        self.inner.lock().await.has_more
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.delivery.pending_count()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn on_messages_changed(
        &self,
        listener: impl Fn(&[Message]) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.on_messages_changed(listener)
    }

    pub fn on_membership_changed(
        &self,
        listener: impl Fn(&MembershipState) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.on_membership_changed(listener)
    }

    pub fn on_error(&self, listener: impl Fn(&SyncError) + Send + Sync + 'static) -> ListenerId {
        self.listeners.on_error(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Starts joining. A no-op while already joining or joined; rejected
    /// while a leave is in flight.
    pub async fn join(self: &Arc<Self>) -> Result<(), SyncError> {
        self.ensure_open()?;
        let attempt = {
            let mut state = self.inner.lock().await;
            match state.membership.begin_join()? {
                JoinStart::Started { attempt } => {
                    self.publish_membership(MembershipState::Joining);
                    attempt
                }
                JoinStart::AlreadyJoining | JoinStart::AlreadyJoined => return Ok(()),
            }
        };

        // Subscribe before the request goes out so the confirmation cannot
        // slip past.
        self.ensure_event_loop();

        let request = ClientRequest::JoinConversation {
            conversation_id: self.conversation_id.clone(),
        };
        let result = self
            .emit_membership_request(
                OperationClass::Join,
                OperationKind::Join,
                request,
                attempt.to_string(),
            )
            .await;

        if let Err(err) = result {
            warn!(
                conversation_id = %self.conversation_id,
                "sync: join request failed: {err}"
            );
            let reverted = {
                let mut state = self.inner.lock().await;
                let reverted = state.membership.abort_join(attempt);
                if reverted {
                    self.publish_membership(MembershipState::Idle);
                }
                reverted
            };
            if reverted {
                if let Some(handle) = self.tasks().event_loop.take() {
                    handle.abort();
                }
            }
            self.report(err.clone());
            return Err(err);
        }

        self.arm_join_timeout(attempt);
        info!(
            conversation_id = %self.conversation_id,
            attempt,
            "sync: join requested"
        );
        Ok(())
    }

    /// Starts leaving. A no-op unless joined; rejected while joining.
    pub async fn leave(self: &Arc<Self>) -> Result<(), SyncError> {
        self.ensure_open()?;
        let attempt = {
            let mut state = self.inner.lock().await;
            match state.membership.begin_leave()? {
                LeaveStart::Started => {}
                LeaveStart::AlreadyLeaving | LeaveStart::NotJoined => return Ok(()),
            }
            if !state.membership.take_leave_request() {
                return Ok(());
            }
            self.publish_membership(MembershipState::Leaving);
            state.membership.join_attempt()
        };
        self.cancel_typing_timer();

        let request = ClientRequest::LeaveConversation {
            conversation_id: self.conversation_id.clone(),
        };
        match self
            .emit_membership_request(
                OperationClass::Leave,
                OperationKind::Leave,
                request,
                attempt.to_string(),
            )
            .await
        {
            Ok(()) => {
                self.arm_leave_timeout();
                info!(conversation_id = %self.conversation_id, "sync: leave requested");
                Ok(())
            }
            Err(err) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    "sync: leave request failed: {err}"
                );
                self.finish_leave(LeaveOrigin::RequestFailed).await;
                self.report(err.clone());
                Err(err)
            }
        }
    }

    /// Tears the session down without waiting for any confirmation. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tasks().abort_all();
        let teardown = {
            let mut state = self.inner.lock().await;
            let teardown = state.membership.teardown();
            state.reconciler.clear_held_status();
            if state.membership.state() != teardown.previous {
                self.publish_membership(state.membership.state());
            }
            teardown
        };
        if teardown.send_leave {
            self.emit_detached(ClientRequest::LeaveConversation {
                conversation_id: self.conversation_id.clone(),
            });
        }
        self.listeners.clear();
        info!(
            conversation_id = %self.conversation_id,
            previous = %teardown.previous,
            "sync: session closed"
        );
    }

    async fn emit_membership_request(
        &self,
        class: OperationClass,
        operation: OperationKind,
        request: ClientRequest,
        fingerprint: String,
    ) -> Result<(), SyncError> {
        let key = RetryKey::new(&self.conversation_id, operation, fingerprint);
        let key = &key;
        let push = &self.transports.push;
        let request = &request;
        let backoff = self.registry.backoff();
        self.gates
            .gate(class)
            .execute_when_ready(move || backoff.run(key, move || push.emit(request.clone())))
            .await
    }

    fn arm_join_timeout(self: &Arc<Self>, attempt: u64) {
        let Some(timeout) = self.settings.join_timeout else {
            return;
        };
        let session = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = session.upgrade() {
                session.expire_join(attempt).await;
            }
        });
        if let Some(previous) = self.tasks().join_timer.replace(timer) {
            previous.abort();
        }
    }

    async fn expire_join(&self, attempt: u64) {
        let expired = {
            let mut state = self.inner.lock().await;
            let expired = state.membership.abort_join(attempt);
            if expired {
                self.publish_membership(MembershipState::Idle);
            }
            expired
        };
        if !expired {
            return;
        }
        {
            let mut tasks = self.tasks();
            tasks.join_timer.take();
            if let Some(handle) = tasks.event_loop.take() {
                handle.abort();
            }
        }
        warn!(
            conversation_id = %self.conversation_id,
            attempt,
            "sync: join confirmation timed out"
        );
        self.report(SyncError::Timeout);
    }

    fn arm_leave_timeout(self: &Arc<Self>) {
        let Some(timeout) = self.settings.leave_timeout else {
            return;
        };
        let session = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = session.upgrade() {
                if session.finish_leave(LeaveOrigin::TimedOut).await {
                    warn!(
                        conversation_id = %session.conversation_id,
                        "sync: leave confirmation timed out; treating as left"
                    );
                }
            }
        });
        if let Some(previous) = self.tasks().leave_timer.replace(timer) {
            previous.abort();
        }
    }

    async fn finish_leave(&self, origin: LeaveOrigin) -> bool {
        let left = {
            let mut state = self.inner.lock().await;
            let left = state.membership.confirm_leave();
            if left {
                state.reconciler.clear_held_status();
                self.publish_membership(MembershipState::Left);
            }
            left
        };
        if !left {
            return false;
        }
        let mut tasks = self.tasks();
        let event_loop = tasks.event_loop.take();
        let leave_timer = tasks.leave_timer.take();
        let initial_sync = tasks.initial_sync.take();
        let typing = tasks.typing_stop.take().map(|(_, handle)| handle);
        drop(tasks);

        for handle in [initial_sync, typing].into_iter().flatten() {
            handle.abort();
        }
        // The confirming event loop stops on its own; a timer never aborts
        // the task it runs in.
        if origin != LeaveOrigin::Confirmed {
            if let Some(handle) = event_loop {
                handle.abort();
            }
        }
        if origin != LeaveOrigin::TimedOut {
            if let Some(handle) = leave_timer {
                handle.abort();
            }
        }
        info!(conversation_id = %self.conversation_id, "sync: left conversation");
        true
    }

    /// Optimistically appends a `Sending` entry and persists it in the
    /// background. The returned message carries the temporary id.
    pub async fn send(
        self: &Arc<Self>,
        content: impl Into<String>,
        kind: MessageKind,
        metadata: Metadata,
    ) -> Result<Message, SyncError> {
        self.ensure_open()?;
        let (message, outbound) = {
            let mut state = self.inner.lock().await;
            state.membership.require_joined("send")?;
            let SessionState {
                delivery,
                reconciler,
                ..
            } = &mut *state;
            let staged = delivery.stage(
                reconciler.timeline_mut(),
                &self.conversation_id,
                content.into(),
                kind,
                metadata,
            );
            self.publish_messages(reconciler.timeline().snapshot());
            staged
        };
        debug!(
            conversation_id = %self.conversation_id,
            temp_id = %outbound.client_ref,
            "sync: message staged"
        );
        self.dispatch(outbound);
        Ok(message)
    }

    pub async fn send_text(
        self: &Arc<Self>,
        content: impl Into<String>,
    ) -> Result<Message, SyncError> {
        self.send(content, MessageKind::Text, Metadata::new()).await
    }

    /// Re-sends a `Failed` entry as a fresh `Sending` one.
    pub async fn retry(self: &Arc<Self>, id: &MessageRef) -> Result<Message, SyncError> {
        self.ensure_open()?;
        let (message, outbound) = {
            let mut state = self.inner.lock().await;
            state.membership.require_joined("retry")?;
            let SessionState {
                delivery,
                reconciler,
                ..
            } = &mut *state;
            let staged = delivery.retry(reconciler.timeline_mut(), &self.conversation_id, id)?;
            self.publish_messages(reconciler.timeline().snapshot());
            staged
        };
        info!(
            conversation_id = %self.conversation_id,
            previous = %id,
            temp_id = %outbound.client_ref,
            "sync: retrying failed message"
        );
        self.dispatch(outbound);
        Ok(message)
    }

    /// Drops a `Failed` entry from the timeline.
    pub async fn discard(&self, id: &MessageRef) -> Result<Message, SyncError> {
        let mut state = self.inner.lock().await;
        let SessionState {
            delivery,
            reconciler,
            ..
        } = &mut *state;
        let removed = delivery.discard(reconciler.timeline_mut(), id)?;
        self.publish_messages(reconciler.timeline().snapshot());
        Ok(removed)
    }

    fn dispatch(self: &Arc<Self>, outbound: OutboundMessage) {
        // Push hint is best-effort; the REST write is authoritative.
        match self.gates.gate(OperationClass::Send).try_acquire() {
            Ok(()) => self.emit_detached(ClientRequest::SendMessage {
                message: outbound.clone(),
            }),
            Err(err) => debug!(
                conversation_id = %self.conversation_id,
                temp_id = %outbound.client_ref,
                "sync: skipping push hint: {err}"
            ),
        }

        let session = Arc::downgrade(self);
        let rest = Arc::clone(&self.transports.rest);
        let backoff = Arc::clone(self.registry.backoff());
        let key = RetryKey::new(
            &self.conversation_id,
            OperationKind::Send,
            outbound.client_ref.as_str(),
        );
        tokio::spawn(async move {
            let result = {
                let (rest, outbound, session) = (&rest, &outbound, &session);
                backoff
                    .run(&key, move || async move {
                        if !is_live(session) {
                            return Err(SyncError::SessionClosed);
                        }
                        rest.post_message(outbound).await
                    })
                    .await
            };
            if let Some(session) = session.upgrade() {
                session.complete_send(&outbound.client_ref, result).await;
            }
        });
    }

    async fn complete_send(&self, temp_id: &TempId, result: Result<MessagePayload, SyncError>) {
        if self.is_closed() {
            return;
        }
        match result {
            Ok(payload) => {
                let mut state = self.inner.lock().await;
                let message = message_from_payload(&payload, &self.user_id);
                let before = state.conversation.clone();
                let SessionState {
                    delivery,
                    reconciler,
                    conversation,
                    ..
                } = &mut *state;
                let changed =
                    match delivery.confirm(reconciler.timeline_mut(), temp_id, message.clone()) {
                        ConfirmOutcome::Replaced(_) | ConfirmOutcome::MergedIntoExisting(_) => {
                            reconciler.settle(&payload.message_id);
                            true
                        }
                        ConfirmOutcome::AlreadyRetired | ConfirmOutcome::Unknown => {
                            reconciler.merge(message.clone(), EventSource::Rest).changed()
                        }
                    };
                note_latest(conversation, &message);
                if changed {
                    self.publish_messages(reconciler.timeline().snapshot());
                }
                if *conversation != before {
                    self.publish_conversation(conversation.clone());
                }
                info!(
                    conversation_id = %self.conversation_id,
                    temp_id = %temp_id,
                    message_id = %payload.message_id,
                    "sync: message persisted"
                );
            }
            Err(SyncError::SessionClosed) => {}
            Err(err) => {
                {
                    let mut state = self.inner.lock().await;
                    let SessionState {
                        delivery,
                        reconciler,
                        ..
                    } = &mut *state;
                    if delivery.fail(reconciler.timeline_mut(), temp_id).is_some() {
                        self.publish_messages(reconciler.timeline().snapshot());
                    }
                }
                warn!(
                    conversation_id = %self.conversation_id,
                    temp_id = %temp_id,
                    "sync: message delivery failed: {err}"
                );
                self.report(err);
            }
        }
    }

    /// Marks inbound messages read locally and reports them to the server.
    /// Returns how many entries changed.
    pub async fn mark_read(
        self: &Arc<Self>,
        message_ids: &[MessageId],
    ) -> Result<usize, SyncError> {
        self.ensure_open()?;
        let marked = {
            let mut state = self.inner.lock().await;
            state.membership.require_joined("mark_read")?;
            let now = Utc::now();
            let mut marked = Vec::new();
            for id in message_ids {
                let inbound = state
                    .reconciler
                    .timeline()
                    .get(&MessageRef::Confirmed(id.clone()))
                    .is_some_and(|message| message.direction == Direction::Inbound);
                if inbound
                    && state
                        .reconciler
                        .apply_status(id, DeliveryStatus::Read, now)
                {
                    marked.push(id.clone());
                }
            }
            if !marked.is_empty() {
                self.publish_messages(state.reconciler.timeline().snapshot());
            }
            marked
        };
        if marked.is_empty() {
            return Ok(0);
        }
        let count = marked.len();

        self.emit_detached(ClientRequest::MarkRead {
            conversation_id: self.conversation_id.clone(),
            message_ids: marked.clone(),
        });

        let session = Arc::downgrade(self);
        let rest = Arc::clone(&self.transports.rest);
        let backoff = Arc::clone(self.registry.backoff());
        let conversation_id = self.conversation_id.clone();
        let fingerprint = marked
            .iter()
            .map(MessageId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let key = RetryKey::for_content(
            &conversation_id,
            OperationKind::MarkRead,
            fingerprint.as_bytes(),
        );
        tokio::spawn(async move {
            let result = {
                let (rest, conversation_id, marked, session) =
                    (&rest, &conversation_id, &marked, &session);
                backoff
                    .run(&key, move || async move {
                        if !is_live(session) {
                            return Err(SyncError::SessionClosed);
                        }
                        rest.mark_read(conversation_id, marked).await
                    })
                    .await
            };
            let Some(session) = session.upgrade() else {
                return;
            };
            match result {
                Ok(()) => session.apply_read_confirmation(count).await,
                Err(SyncError::SessionClosed) => {}
                Err(err) => {
                    warn!(
                        conversation_id = %session.conversation_id,
                        "sync: mark read failed: {err}"
                    );
                    session.report(err);
                }
            }
        });
        Ok(count)
    }

    async fn apply_read_confirmation(&self, count: usize) {
        let state = &mut *self.inner.lock().await;
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        let unread = state.conversation.unread_count.saturating_sub(count);
        if unread != state.conversation.unread_count {
            state.conversation.unread_count = unread;
            self.publish_conversation(state.conversation.clone());
        }
    }

    /// Announces typing and (re)arms the stop timer.
    pub async fn set_typing(self: &Arc<Self>) -> Result<(), SyncError> {
        self.ensure_open()?;
        self.inner.lock().await.membership.require_joined("typing")?;

        let active = self
            .tasks()
            .typing_stop
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished());
        if !active {
            if let Err(err) = self.gates.gate(OperationClass::Typing).try_acquire() {
                debug!(conversation_id = %self.conversation_id, "sync: typing skipped: {err}");
                return Ok(());
            }
            self.emit_detached(ClientRequest::Typing {
                conversation_id: self.conversation_id.clone(),
                active: true,
            });
        }

        let generation = self.typing_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::downgrade(self);
        let timeout = self.settings.typing_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            let expired = {
                let mut tasks = session.tasks();
                match &tasks.typing_stop {
                    Some((current, _)) if *current == generation => {
                        tasks.typing_stop = None;
                        true
                    }
                    _ => false,
                }
            };
            if expired && !session.is_closed() {
                session.emit_detached(ClientRequest::Typing {
                    conversation_id: session.conversation_id.clone(),
                    active: false,
                });
            }
        });
        if let Some((_, previous)) = self.tasks().typing_stop.replace((generation, timer)) {
            previous.abort();
        }
        Ok(())
    }

    /// Stops an active typing indicator right away.
    pub fn stop_typing(&self) {
        if self.cancel_typing_timer() && !self.is_closed() {
            self.emit_detached(ClientRequest::Typing {
                conversation_id: self.conversation_id.clone(),
                active: false,
            });
        }
    }

    fn cancel_typing_timer(&self) -> bool {
        match self.tasks().typing_stop.take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Loads the newest page and merges it into the timeline.
    pub async fn load_history(&self) -> Result<usize, SyncError> {
        self.ensure_open()?;
        self.inner
            .lock()
            .await
            .membership
            .require_joined("load_history")?;
        let query = PageQuery {
            limit: self.settings.page_size,
            before: None,
        };
        let page = self
            .gates
            .gate(OperationClass::HistorySync)
            .execute_when_ready(|| self.fetch_page(&query))
            .await?;
        self.apply_page(page, PageKind::Latest).await
    }

    /// Loads the page preceding the oldest confirmed entry. Fails fast when
    /// throttled.
    pub async fn load_older(&self) -> Result<usize, SyncError> {
        self.ensure_open()?;
        let before = {
            let state = self.inner.lock().await;
            state.membership.require_joined("load_older")?;
            if state.history_loaded && !state.has_more {
                return Ok(0);
            }
            state.reconciler.timeline().oldest_confirmed().cloned()
        };
        let Some(before) = before else {
            return self.load_history().await;
        };
        let query = PageQuery {
            limit: self.settings.page_size,
            before: Some(before),
        };
        let page = self
            .gates
            .gate(OperationClass::HistorySync)
            .execute(|| self.fetch_page(&query))
            .await?;
        self.apply_page(page, PageKind::Older).await
    }

    async fn fetch_page(&self, query: &PageQuery) -> Result<MessagePage, SyncError> {
        let conversation_id = &self.conversation_id;
        let cursor = query.before.as_ref().map_or("latest", MessageId::as_str);
        let key = RetryKey::new(conversation_id, OperationKind::HistorySync, cursor);
        let key = &key;
        let rest = &self.transports.rest;
        let backoff = self.registry.backoff();
        self.registry
            .cache()
            .message_page(conversation_id, query, move || {
                backoff.run(key, move || rest.fetch_messages(conversation_id, query))
            })
            .await
    }

    async fn apply_page(&self, page: MessagePage, kind: PageKind) -> Result<usize, SyncError> {
        let mut state = self.inner.lock().await;
        if state.membership.state() != MembershipState::Joined {
            debug!(
                conversation_id = %self.conversation_id,
                state = %state.membership.state(),
                "sync: dropping history page for inactive session"
            );
            return Ok(0);
        }
        let before = state.conversation.clone();
        let changed = page
            .messages
            .iter()
            .filter(|payload| self.absorb(&mut state, payload, EventSource::History))
            .count();
        if kind == PageKind::Older || !state.history_loaded {
            state.has_more = page.has_more;
        }
        state.history_loaded = true;
        if changed > 0 {
            self.publish_messages(state.reconciler.timeline().snapshot());
        }
        if state.conversation != before {
            self.publish_conversation(state.conversation.clone());
        }
        debug!(
            conversation_id = %self.conversation_id,
            fetched = page.messages.len(),
            changed,
            has_more = state.has_more,
            "sync: history page merged"
        );
        Ok(changed)
    }

    /// Fetches conversation metadata through the shared cache.
    pub async fn refresh_conversation(&self) -> Result<Conversation, SyncError> {
        self.ensure_open()?;
        let conversation_id = &self.conversation_id;
        let key = RetryKey::new(conversation_id, OperationKind::ConversationFetch, "metadata");
        let key = &key;
        let rest = &self.transports.rest;
        let backoff = self.registry.backoff();
        let summary = self
            .registry
            .cache()
            .conversation(conversation_id, move || {
                backoff.run(key, move || rest.fetch_conversation(conversation_id))
            })
            .await?;

        let state = &mut *self.inner.lock().await;
        let mut fetched = Conversation::from(summary);
        let local = &state.conversation;
        if local.last_message_at > fetched.last_message_at {
            fetched.last_message = local.last_message.clone();
            fetched.last_message_at = local.last_message_at;
        }
        if fetched != state.conversation {
            state.conversation = fetched;
            self.publish_conversation(state.conversation.clone());
        }
        Ok(state.conversation.clone())
    }

    fn spawn_initial_sync(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let Some(session) = session.upgrade() else {
                return;
            };
            if let Err(err) = session.refresh_conversation().await {
                warn!(
                    conversation_id = %session.conversation_id,
                    "sync: conversation fetch failed: {err}"
                );
                session.report(err);
            }
            if let Err(err) = session.load_history().await {
                warn!(
                    conversation_id = %session.conversation_id,
                    "sync: history sync failed: {err}"
                );
                session.report(err);
            }
        });
        if let Some(previous) = self.tasks().initial_sync.replace(task) {
            previous.abort();
        }
    }

    fn ensure_event_loop(self: &Arc<Self>) {
        let mut tasks = self.tasks();
        if tasks
            .event_loop
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        let receiver = self.transports.push.subscribe();
        tasks.event_loop = Some(tokio::spawn(run_event_loop(Arc::downgrade(self), receiver)));
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) -> LoopControl {
        match event {
            ServerEvent::JoinConfirmed { .. } => {
                let joined = {
                    let mut state = self.inner.lock().await;
                    let joined = state.membership.confirm_join();
                    if joined {
                        self.publish_membership(MembershipState::Joined);
                    }
                    joined
                };
                if !joined {
                    debug!(
                        conversation_id = %self.conversation_id,
                        "sync: stale join confirmation"
                    );
                    return LoopControl::Continue;
                }
                if let Some(timer) = self.tasks().join_timer.take() {
                    timer.abort();
                }
                info!(conversation_id = %self.conversation_id, "sync: joined conversation");
                self.spawn_initial_sync();
                LoopControl::StartFeed
            }
            ServerEvent::LeaveConfirmed { .. } => {
                if self.finish_leave(LeaveOrigin::Confirmed).await {
                    LoopControl::Stop
                } else {
                    LoopControl::Continue
                }
            }
            ServerEvent::MessageReceived { message } => {
                self.handle_inbound(&message, EventSource::PushChannel).await;
                LoopControl::Continue
            }
            ServerEvent::MessageStatusChanged {
                message_id,
                status,
                at,
                ..
            } => {
                let mut state = self.inner.lock().await;
                if !state.membership.state().is_quiescent()
                    && state.reconciler.apply_status(&message_id, status, at)
                {
                    self.publish_messages(state.reconciler.timeline().snapshot());
                }
                LoopControl::Continue
            }
            ServerEvent::ConversationUpdated { conversation } => {
                self.registry
                    .cache()
                    .invalidate_conversation(&self.conversation_id);
                let mut state = self.inner.lock().await;
                let updated = Conversation::from(conversation);
                if updated != state.conversation {
                    state.conversation = updated;
                    self.publish_conversation(state.conversation.clone());
                }
                LoopControl::Continue
            }
            ServerEvent::TypingChanged {
                user_id, active, ..
            } => {
                if user_id != self.user_id {
                    let _ = self
                        .events
                        .send(SessionEvent::TypingChanged { user_id, active });
                }
                LoopControl::Continue
            }
            ServerEvent::Error { error, .. } => {
                warn!(
                    conversation_id = %self.conversation_id,
                    code = %error.code,
                    "sync: server reported error: {}",
                    error.message
                );
                self.report(SyncError::from(error));
                LoopControl::Continue
            }
        }
    }

    async fn handle_feed_change(&self, change: FeedChange) {
        match change {
            FeedChange::Added(payload) | FeedChange::Modified(payload) => {
                self.handle_inbound(&payload, EventSource::ChangeFeed).await;
            }
            FeedChange::Removed { message_id, .. } => {
                let mut state = self.inner.lock().await;
                if state.reconciler.remove(&message_id).is_some() {
                    self.publish_messages(state.reconciler.timeline().snapshot());
                }
            }
        }
    }

    async fn handle_inbound(&self, payload: &MessagePayload, source: EventSource) {
        let mut state = self.inner.lock().await;
        if state.membership.state().is_quiescent() {
            debug!(
                conversation_id = %self.conversation_id,
                message_id = %payload.message_id,
                source = source.as_str(),
                "sync: dropping message for inactive session"
            );
            return;
        }
        let before = state.conversation.clone();
        if self.absorb(&mut state, payload, source) {
            self.publish_messages(state.reconciler.timeline().snapshot());
        }
        if state.conversation != before {
            self.publish_conversation(state.conversation.clone());
        }
    }

    /// Routes one server message through the delivery pipeline (echoes of
    /// our own pending sends) or the reconciler. Returns whether the
    /// timeline changed.
    fn absorb(
        &self,
        state: &mut SessionState,
        payload: &MessagePayload,
        source: EventSource,
    ) -> bool {
        let message = message_from_payload(payload, &self.user_id);
        let SessionState {
            delivery,
            reconciler,
            conversation,
            ..
        } = state;

        let pending = payload
            .client_ref
            .as_ref()
            .filter(|temp_id| delivery.is_pending(temp_id));
        let changed = match pending {
            Some(temp_id) => {
                match delivery.confirm(reconciler.timeline_mut(), temp_id, message.clone()) {
                    ConfirmOutcome::Replaced(_) | ConfirmOutcome::MergedIntoExisting(_) => {
                        reconciler.settle(&payload.message_id);
                        true
                    }
                    ConfirmOutcome::AlreadyRetired | ConfirmOutcome::Unknown => {
                        reconciler.merge(message.clone(), source).changed()
                    }
                }
            }
            None => {
                let outcome = reconciler.merge(message.clone(), source);
                if matches!(outcome, MergeOutcome::Inserted(_))
                    && source != EventSource::History
                    && message.direction == Direction::Inbound
                    && message.status != DeliveryStatus::Read
                {
                    conversation.unread_count = conversation.unread_count.saturating_add(1);
                }
                outcome.changed()
            }
        };
        if changed {
            note_latest(conversation, &message);
        }
        changed
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.is_closed() {
            Err(SyncError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn tasks(&self) -> MutexGuard<'_, SessionTasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_detached(&self, request: ClientRequest) {
        let push = Arc::clone(&self.transports.push);
        let conversation_id = self.conversation_id.clone();
        tokio::spawn(async move {
            if let Err(err) = push.emit(request).await {
                debug!(%conversation_id, "sync: push emit failed: {err}");
            }
        });
    }

    fn publish_messages(&self, messages: Vec<Message>) {
        self.listeners.notify_messages(&messages);
        let _ = self.events.send(SessionEvent::MessagesChanged(messages));
    }

    fn publish_membership(&self, state: MembershipState) {
        self.listeners.notify_membership(state);
        let _ = self.events.send(SessionEvent::MembershipChanged(state));
    }

    fn publish_conversation(&self, conversation: Conversation) {
        let _ = self.events.send(SessionEvent::ConversationChanged(conversation));
    }

    fn report(&self, error: SyncError) {
        self.listeners.notify_error(&error);
        let _ = self.events.send(SessionEvent::Error(error));
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("conversation_id", &self.conversation_id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn is_live(session: &Weak<ConversationSession>) -> bool {
    session.upgrade().is_some_and(|session| !session.is_closed())
}

/// Moves the conversation's last-message pointer forward.
fn note_latest(conversation: &mut Conversation, message: &Message) {
    if message.id.confirmed().is_none() {
        return;
    }
    if conversation
        .last_message_at
        .is_some_and(|at| at > message.timestamp)
    {
        return;
    }
    conversation.last_message = Some(message.content.clone());
    conversation.last_message_at = Some(message.timestamp);
}

async fn next_feed_change(feed: &mut Option<FeedSubscription>) -> Option<FeedChange> {
    match feed {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_event_loop(
    session: Weak<ConversationSession>,
    mut push: broadcast::Receiver<ServerEvent>,
) {
    let mut feed: Option<FeedSubscription> = None;
    loop {
        let signal = tokio::select! {
            received = push.recv() => match received {
                Ok(event) => Signal::Push(event),
                Err(RecvError::Lagged(skipped)) => Signal::Lagged(skipped),
                Err(RecvError::Closed) => Signal::PushClosed,
            },
            change = next_feed_change(&mut feed) => match change {
                Some(change) => Signal::Feed(change),
                None => Signal::FeedEnded,
            },
        };

        let Some(session) = session.upgrade() else {
            break;
        };
        if session.is_closed() {
            break;
        }

        match signal {
            Signal::Push(event) => {
                if event.conversation_id() != Some(&session.conversation_id) {
                    continue;
                }
                match session.handle_server_event(event).await {
                    LoopControl::Continue => {}
                    LoopControl::StartFeed => {
                        feed = Some(session.transports.feed.subscribe(FeedQuery {
                            conversation_id: session.conversation_id.clone(),
                            limit: session.settings.page_size,
                        }));
                    }
                    LoopControl::Stop => break,
                }
            }
            Signal::Feed(change) => session.handle_feed_change(change).await,
            Signal::FeedEnded => {
                debug!(conversation_id = %session.conversation_id, "sync: change feed ended");
                feed = None;
            }
            Signal::Lagged(skipped) => {
                warn!(
                    conversation_id = %session.conversation_id,
                    skipped,
                    "sync: push events lagged; resyncing history"
                );
                let cache = session.registry.cache();
                cache.invalidate_pages(&session.conversation_id);
                cache.invalidate_conversation(&session.conversation_id);
                session.spawn_initial_sync();
            }
            Signal::PushClosed => {
                warn!(conversation_id = %session.conversation_id, "sync: push channel closed");
                session.report(SyncError::Network("push channel closed".into()));
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
