//! Retry policy for failed transport calls.
//!
//! State is keyed by [`RetryKey`], the full identity of one logical
//! operation (conversation, operation kind, content fingerprint). Two
//! concurrent operations must never share a key; the controller serialises
//! access to its map but does not arbitrate between owners of one key.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::Rng;
use sha2::{Digest, Sha256};
use shared::domain::ConversationId;
use tracing::{debug, warn};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Join,
    Leave,
    Send,
    HistorySync,
    ConversationFetch,
    MarkRead,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Send => "send",
            Self::HistorySync => "history_sync",
            Self::ConversationFetch => "conversation_fetch",
            Self::MarkRead => "mark_read",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetryKey {
    conversation_id: ConversationId,
    operation: OperationKind,
    fingerprint: String,
}

impl RetryKey {
    pub fn new(
        conversation_id: &ConversationId,
        operation: OperationKind,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.clone(),
            operation,
            fingerprint: fingerprint.into(),
        }
    }

    /// Keys an operation by a digest of its payload.
    pub fn for_content(
        conversation_id: &ConversationId,
        operation: OperationKind,
        content: &[u8],
    ) -> Self {
        let digest = Sha256::digest(content);
        let fingerprint = digest[..8]
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>();
        Self::new(conversation_id, operation, fingerprint)
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }
}

impl fmt::Display for RetryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.conversation_id,
            self.operation.as_str(),
            self.fingerprint
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    /// Growth factor per attempt. Values at or above `1.0 + jitter` keep the
    /// delay sequence non-decreasing.
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Upper bound of the random fraction added on top of each delay.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: 3,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempt: u32,
    pub last_error: SyncError,
    pub next_delay: Duration,
}

#[derive(Debug)]
pub struct BackoffController {
    config: BackoffConfig,
    states: Mutex<HashMap<RetryKey, RetryState>>,
}

impl BackoffController {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    fn states(&self) -> MutexGuard<'_, HashMap<RetryKey, RetryState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a failure for `key` and decides whether another attempt is
    /// allowed. Terminal errors and exhausted budgets drop the key's state.
    pub fn should_retry(&self, key: &RetryKey, error: &SyncError) -> bool {
        let mut states = self.states();
        if !error.is_retryable() {
            states.remove(key);
            return false;
        }

        let attempt = states.get(key).map_or(0, |state| state.attempt);
        if attempt >= self.config.max_retries {
            states.remove(key);
            return false;
        }

        let next_delay = error
            .retry_after()
            .unwrap_or_else(|| self.delay_for_attempt(attempt));
        states.insert(
            key.clone(),
            RetryState {
                attempt: attempt + 1,
                last_error: error.clone(),
                next_delay,
            },
        );
        true
    }

    pub fn next_delay(&self, key: &RetryKey) -> Duration {
        self.states()
            .get(key)
            .map(|state| state.next_delay)
            .unwrap_or_else(|| self.delay_for_attempt(0))
    }

    pub fn reset(&self, key: &RetryKey) {
        self.states().remove(key);
    }

    pub fn attempts(&self, key: &RetryKey) -> u32 {
        self.states().get(key).map_or(0, |state| state.attempt)
    }

    pub fn state(&self, key: &RetryKey) -> Option<RetryState> {
        self.states().get(key).cloned()
    }

    pub fn tracked_keys(&self) -> usize {
        self.states().len()
    }

    pub fn clear(&self) {
        self.states().clear();
    }

    /// `min(max_delay, base * multiplier^attempt)` plus up to `jitter` of
    /// that value, never exceeding `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max = self.config.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.config.base_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let capped = if raw.is_finite() { raw.min(max) } else { max };
        let jitter = if self.config.jitter > 0.0 {
            capped * rand::thread_rng().gen_range(0.0..=self.config.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((capped + jitter).min(max))
    }

    /// Drives `operation` until it succeeds, fails terminally, or the retry
    /// budget for `key` runs out.
    pub async fn run<T, F, Fut>(&self, key: &RetryKey, mut operation: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        loop {
            match operation().await {
                Ok(value) => {
                    self.reset(key);
                    return Ok(value);
                }
                Err(err) => {
                    let failures = self.attempts(key) + 1;
                    if !self.should_retry(key, &err) {
                        if !err.is_retryable() {
                            return Err(err);
                        }
                        warn!(
                            key = %key,
                            attempts = failures,
                            "backoff: retry budget exhausted: {err}"
                        );
                        return Err(SyncError::RetriesExhausted {
                            attempts: failures,
                            last: Box::new(err),
                        });
                    }
                    let delay = self.next_delay(key);
                    debug!(
                        key = %key,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "backoff: retrying after error: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for BackoffController {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
#[path = "tests/backoff_tests.rs"]
mod tests;
