use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::{
    domain::ConversationId,
    protocol::{ConversationSummary, MessagePage, PageQuery},
};
use tokio::time::Instant;
use tracing::debug;

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries();
        let entry = entries.get(key)?;
        if Instant::now() > entry.expires_at {
            entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries().insert(key, entry);
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.expires_at);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached value for `key`, or runs `fetch` and caches its
    /// successful result for `ttl`.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<V, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, SyncError>>,
    {
        if let Some(value) = self.get(key) {
            debug!(key, "cache: hit");
            return Ok(value);
        }
        debug!(key, "cache: miss");
        let value = fetch().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub message_page: Duration,
    pub conversation: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            message_page: Duration::from_secs(60),
            conversation: Duration::from_secs(300),
        }
    }
}

pub fn page_key(conversation_id: &ConversationId, query: &PageQuery) -> String {
    let cursor = query
        .before
        .as_ref()
        .map_or("latest", |before| before.as_str());
    format!("{}{cursor}:{}", pages_prefix(conversation_id), query.limit)
}

pub fn conversation_key(conversation_id: &ConversationId) -> String {
    format!("conversation:{}", scoped(conversation_id))
}

/// Length-prefixed so that no id is a key prefix of another.
fn scoped(conversation_id: &ConversationId) -> String {
    format!("{}:{}", conversation_id.as_str().len(), conversation_id)
}

fn pages_prefix(conversation_id: &ConversationId) -> String {
    format!("messages:{}:", scoped(conversation_id))
}

/// Process-wide cache for message pages and conversation metadata, each
/// class with its own TTL.
#[derive(Debug, Default)]
pub struct HistoryCache {
    ttls: CacheTtls,
    pages: TtlCache<MessagePage>,
    conversations: TtlCache<ConversationSummary>,
}

impl HistoryCache {
    pub fn new(ttls: CacheTtls) -> Self {
        Self {
            ttls,
            pages: TtlCache::new(),
            conversations: TtlCache::new(),
        }
    }

    pub fn ttls(&self) -> CacheTtls {
        self.ttls
    }

    pub async fn message_page<F, Fut>(
        &self,
        conversation_id: &ConversationId,
        query: &PageQuery,
        fetch: F,
    ) -> Result<MessagePage, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MessagePage, SyncError>>,
    {
        let key = page_key(conversation_id, query);
        self.pages
            .get_or_fetch(&key, self.ttls.message_page, fetch)
            .await
    }

    pub async fn conversation<F, Fut>(
        &self,
        conversation_id: &ConversationId,
        fetch: F,
    ) -> Result<ConversationSummary, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ConversationSummary, SyncError>>,
    {
        let key = conversation_key(conversation_id);
        self.conversations
            .get_or_fetch(&key, self.ttls.conversation, fetch)
            .await
    }

    pub fn invalidate_conversation(&self, conversation_id: &ConversationId) {
        self.conversations
            .invalidate(&conversation_key(conversation_id));
    }

    pub fn invalidate_pages(&self, conversation_id: &ConversationId) -> usize {
        self.pages
            .invalidate_prefix(&pages_prefix(conversation_id))
    }

    pub fn pages(&self) -> &TtlCache<MessagePage> {
        &self.pages
    }

    pub fn conversations(&self) -> &TtlCache<ConversationSummary> {
        &self.conversations
    }

    pub fn clear(&self) {
        self.pages.clear();
        self.conversations.clear();
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
