use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chat_sync::{
    BackoffConfig, CacheTtls, HttpRestClient, PushChannel, SessionSettings, SyncClient, SyncError,
    SyncRegistry, Transports,
};
use chrono::Utc;
use shared::{
    domain::{ConversationId, DeliveryStatus, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ClientRequest, ConversationSummary, MessagePage, MessagePayload, OutboundMessage,
        ServerEvent,
    },
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
};

/// Push channel that lives entirely in memory and confirms joins and leaves.
pub struct MemoryPush {
    events: broadcast::Sender<ServerEvent>,
    emitted: Mutex<Vec<ClientRequest>>,
}

impl MemoryPush {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            emitted: Mutex::new(Vec::new()),
        })
    }

    pub fn deliver(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub async fn emitted(&self) -> Vec<ClientRequest> {
        self.emitted.lock().await.clone()
    }
}

#[async_trait]
impl PushChannel for MemoryPush {
    async fn emit(&self, request: ClientRequest) -> Result<(), SyncError> {
        self.emitted.lock().await.push(request.clone());
        match request {
            ClientRequest::JoinConversation { conversation_id } => {
                self.deliver(ServerEvent::JoinConfirmed { conversation_id })
            }
            ClientRequest::LeaveConversation { conversation_id } => {
                self.deliver(ServerEvent::LeaveConfirmed { conversation_id })
            }
            _ => {}
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

/// REST backend that persists posted messages, numbering them `m1`, `m2`, ...
/// and echoing each one over the push channel shortly after answering.
#[derive(Clone)]
pub struct Backend {
    pub push: Arc<MemoryPush>,
    pub posts: Arc<AtomicUsize>,
    pub stored: Arc<Mutex<Vec<MessagePayload>>>,
    pub unavailable: Arc<AtomicBool>,
    pub echo_delay: Duration,
}

impl Backend {
    pub fn new(push: Arc<MemoryPush>) -> Self {
        Self {
            push,
            posts: Arc::new(AtomicUsize::new(0)),
            stored: Arc::new(Mutex::new(Vec::new())),
            unavailable: Arc::new(AtomicBool::new(false)),
            echo_delay: Duration::from_millis(20),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn post_count(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }
}

async fn handle_conversation(Path(conversation_id): Path<String>) -> Json<ConversationSummary> {
    Json(ConversationSummary {
        conversation_id: ConversationId::new(conversation_id),
        title: "Support".into(),
        participants: vec![UserId::new("me"), UserId::new("agent")],
        last_message: None,
        last_message_at: None,
        unread_count: 0,
    })
}

async fn handle_history(State(backend): State<Backend>) -> Json<MessagePage> {
    Json(MessagePage {
        messages: backend.stored.lock().await.clone(),
        has_more: false,
    })
}

async fn handle_post(
    State(backend): State<Backend>,
    Path(conversation_id): Path<String>,
    Json(message): Json<OutboundMessage>,
) -> Response {
    let n = backend.posts.fetch_add(1, Ordering::SeqCst) + 1;
    if backend.unavailable.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Unavailable, "store unavailable")),
        )
            .into_response();
    }
    let mut stored = backend.stored.lock().await;
    let payload = MessagePayload {
        message_id: MessageId::new(format!("m{}", stored.len() + 1)),
        conversation_id: ConversationId::new(conversation_id),
        sender_id: UserId::new("me"),
        content: message.content,
        kind: message.kind,
        status: DeliveryStatus::Sent,
        sent_at: Utc::now(),
        read_at: None,
        client_ref: Some(message.client_ref),
        metadata: message.metadata,
    };
    stored.push(payload.clone());
    drop(stored);

    let push = Arc::clone(&backend.push);
    let echo = payload.clone();
    let delay = backend.echo_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        push.deliver(ServerEvent::MessageReceived { message: echo });
    });
    tracing::debug!(attempt = n, "backend: stored message");
    Json(payload).into_response()
}

pub async fn spawn_backend(backend: Backend) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/conversations/:conversation_id", get(handle_conversation))
        .route(
            "/conversations/:conversation_id/messages",
            get(handle_history).post(handle_post),
        )
        .with_state(backend);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        base_delay: Duration::from_millis(10),
        multiplier: 2.0,
        max_delay: Duration::from_millis(50),
        max_retries: 3,
        jitter: 0.0,
    }
}

pub async fn client_for(backend: &Backend) -> SyncClient {
    let server_url = spawn_backend(backend.clone()).await;
    let rest = HttpRestClient::new(&server_url, Duration::from_secs(5)).expect("rest client");
    let push: Arc<dyn PushChannel> = backend.push.clone();
    SyncClient::new(
        UserId::new("me"),
        Transports::new(push, Arc::new(rest)),
        SyncRegistry::new(fast_backoff(), CacheTtls::default()),
        SessionSettings::default(),
    )
}

pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
