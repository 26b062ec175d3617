use std::{
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;
use tracing::debug;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Minimum spacing between two admitted calls.
    pub min_interval: Duration,
    /// Calls admitted per window; `0` disables the window limit.
    pub max_calls: u32,
    /// Fixed window length. The count resets once the window has elapsed.
    pub window: Duration,
}

impl ThrottleConfig {
    pub const fn new(min_interval: Duration, max_calls: u32, window: Duration) -> Self {
        Self {
            min_interval,
            max_calls,
            window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Join,
    Leave,
    Send,
    HistorySync,
    Typing,
}

impl OperationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Send => "send",
            Self::HistorySync => "history_sync",
            Self::Typing => "typing",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ThrottleState {
    pub last_call_at: Option<Instant>,
    pub call_count_in_window: u32,
    pub window_start_at: Option<Instant>,
}

#[derive(Debug)]
pub struct ThrottleGate {
    class: OperationClass,
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
}

impl ThrottleGate {
    pub fn new(class: OperationClass, config: ThrottleConfig) -> Self {
        Self {
            class,
            config,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    pub fn class(&self) -> OperationClass {
        self.class
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn window_expired(&self, state: &ThrottleState, now: Instant) -> bool {
        state
            .window_start_at
            .map_or(true, |start| now.saturating_duration_since(start) >= self.config.window)
    }

    fn wait_at(&self, state: &ThrottleState, now: Instant) -> Duration {
        let mut wait = Duration::ZERO;
        if let Some(last) = state.last_call_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.config.min_interval {
                wait = self.config.min_interval - elapsed;
            }
        }
        if self.config.max_calls > 0
            && !self.window_expired(state, now)
            && state.call_count_in_window >= self.config.max_calls
        {
            if let Some(start) = state.window_start_at {
                let elapsed = now.saturating_duration_since(start);
                wait = wait.max(self.config.window.saturating_sub(elapsed));
            }
        }
        wait
    }

    pub fn time_until_next(&self) -> Duration {
        let state = self.state();
        self.wait_at(&state, Instant::now())
    }

    pub fn can_execute(&self) -> bool {
        self.time_until_next().is_zero()
    }

    /// Admits one call or reports how long until the next slot.
    pub fn try_acquire(&self) -> Result<(), SyncError> {
        let now = Instant::now();
        let mut state = self.state();
        if self.window_expired(&state, now) {
            state.window_start_at = Some(now);
            state.call_count_in_window = 0;
        }
        let wait = self.wait_at(&state, now);
        if !wait.is_zero() {
            debug!(
                class = self.class.as_str(),
                wait_ms = wait.as_millis() as u64,
                "throttle: call rejected"
            );
            return Err(SyncError::Throttled { wait });
        }
        state.last_call_at = Some(now);
        state.call_count_in_window += 1;
        Ok(())
    }

    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.try_acquire()?;
        operation().await
    }

    /// Waits out the throttle instead of failing, then runs `operation` once.
    pub async fn execute_when_ready<T, F, Fut>(&self, operation: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        loop {
            match self.try_acquire() {
                Ok(()) => return operation().await,
                Err(SyncError::Throttled { wait }) => tokio::time::sleep(wait).await,
                Err(err) => return Err(err),
            }
        }
    }

    pub fn reset(&self) {
        *self.state() = ThrottleState::default();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleSettings {
    pub join: ThrottleConfig,
    pub leave: ThrottleConfig,
    pub send: ThrottleConfig,
    pub history_sync: ThrottleConfig,
    pub typing: ThrottleConfig,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            join: ThrottleConfig::new(Duration::from_millis(500), 5, Duration::from_secs(10)),
            leave: ThrottleConfig::new(Duration::from_millis(500), 5, Duration::from_secs(10)),
            send: ThrottleConfig::new(Duration::from_millis(100), 20, Duration::from_secs(10)),
            history_sync: ThrottleConfig::new(
                Duration::from_millis(250),
                10,
                Duration::from_secs(10),
            ),
            typing: ThrottleConfig::new(Duration::from_secs(1), 0, Duration::from_secs(10)),
        }
    }
}

/// The independent gates owned by one conversation session.
#[derive(Debug)]
pub struct ThrottleGates {
    join: ThrottleGate,
    leave: ThrottleGate,
    send: ThrottleGate,
    history_sync: ThrottleGate,
    typing: ThrottleGate,
}

impl ThrottleGates {
    pub fn new(settings: &ThrottleSettings) -> Self {
        Self {
            join: ThrottleGate::new(OperationClass::Join, settings.join.clone()),
            leave: ThrottleGate::new(OperationClass::Leave, settings.leave.clone()),
            send: ThrottleGate::new(OperationClass::Send, settings.send.clone()),
            history_sync: ThrottleGate::new(
                OperationClass::HistorySync,
                settings.history_sync.clone(),
            ),
            typing: ThrottleGate::new(OperationClass::Typing, settings.typing.clone()),
        }
    }

    pub fn gate(&self, class: OperationClass) -> &ThrottleGate {
        match class {
            OperationClass::Join => &self.join,
            OperationClass::Leave => &self.leave,
            OperationClass::Send => &self.send,
            OperationClass::HistorySync => &self.history_sync,
            OperationClass::Typing => &self.typing,
        }
    }
}

#[cfg(test)]
#[path = "tests/throttle_tests.rs"]
mod tests;
