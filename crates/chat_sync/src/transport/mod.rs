use std::{fmt, sync::Arc};

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, MessageId},
    protocol::{
        ClientRequest, ConversationSummary, MessagePage, MessagePayload, OutboundMessage,
        PageQuery, ServerEvent,
    },
};
use tokio::sync::{broadcast, mpsc};

use crate::error::SyncError;

mod feed;
mod http;
mod websocket;

pub use feed::PollingChangeFeed;
pub use http::{classify_status, HttpRestClient};
pub use websocket::{websocket_url, WebSocketPushChannel};

/// Real-time channel: fire-and-forget requests out, server events in.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn emit(&self, request: ClientRequest) -> Result<(), SyncError>;
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

/// Authoritative persistence API.
#[async_trait]
pub trait RestClient: Send + Sync {
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        query: &PageQuery,
    ) -> Result<MessagePage, SyncError>;
    async fn fetch_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationSummary, SyncError>;
    async fn post_message(&self, message: &OutboundMessage) -> Result<MessagePayload, SyncError>;
    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedChange {
    Added(MessagePayload),
    Modified(MessagePayload),
    Removed {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedQuery {
    pub conversation_id: ConversationId,
    pub limit: u32,
}

/// Live change-feed registration. Dropping it unsubscribes.
pub struct FeedSubscription {
    changes: mpsc::Receiver<FeedChange>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl FeedSubscription {
    pub fn new(
        changes: mpsc::Receiver<FeedChange>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            changes,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn detached(changes: mpsc::Receiver<FeedChange>) -> Self {
        Self {
            changes,
            cancel: None,
        }
    }

    /// Next change, or `None` once the feed has ended.
    pub async fn recv(&mut self) -> Option<FeedChange> {
        self.changes.recv().await
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, query: FeedQuery) -> FeedSubscription;
}

/// Change feed for deployments without one; the subscription ends at once.
pub struct MissingChangeFeed;

impl ChangeFeed for MissingChangeFeed {
    fn subscribe(&self, _query: FeedQuery) -> FeedSubscription {
        let (_, changes) = mpsc::channel(1);
        FeedSubscription::detached(changes)
    }
}

/// The three inbound/outbound collaborators a session talks to.
#[derive(Clone)]
pub struct Transports {
    pub push: Arc<dyn PushChannel>,
    pub rest: Arc<dyn RestClient>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl Transports {
    pub fn new(push: Arc<dyn PushChannel>, rest: Arc<dyn RestClient>) -> Self {
        Self {
            push,
            rest,
            feed: Arc::new(MissingChangeFeed),
        }
    }

    pub fn with_change_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = feed;
        self
    }
}

impl fmt::Debug for Transports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transports").finish_non_exhaustive()
    }
}
