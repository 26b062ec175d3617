use std::sync::Arc;

use crate::{
    backoff::{BackoffConfig, BackoffController},
    cache::{CacheTtls, HistoryCache},
};

/// Process-wide shared state: built once at start-up, cleared on logout,
/// handed to every session explicitly.
#[derive(Debug, Clone)]
pub struct SyncRegistry {
    backoff: Arc<BackoffController>,
    cache: Arc<HistoryCache>,
}

impl SyncRegistry {
    pub fn new(backoff: BackoffConfig, ttls: CacheTtls) -> Self {
        Self {
            backoff: Arc::new(BackoffController::new(backoff)),
            cache: Arc::new(HistoryCache::new(ttls)),
        }
    }

    pub fn backoff(&self) -> &Arc<BackoffController> {
        &self.backoff
    }

    pub fn cache(&self) -> &Arc<HistoryCache> {
        &self.cache
    }

    pub fn clear(&self) {
        self.backoff.clear();
        self.cache.clear();
    }
}

impl Default for SyncRegistry {
    fn default() -> Self {
        Self::new(BackoffConfig::default(), CacheTtls::default())
    }
}
