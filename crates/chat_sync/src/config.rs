use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::{
    backoff::BackoffConfig,
    cache::CacheTtls,
    registry::SyncRegistry,
    session::SessionSettings,
    throttle::{ThrottleConfig, ThrottleSettings},
};

pub const DEFAULT_CONFIG_FILE: &str = "chat_sync.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_url: String,
    pub user_id: Option<String>,
    pub request_timeout_ms: u64,
    pub backoff: BackoffSection,
    pub throttle: ThrottleSection,
    pub cache: CacheSection,
    pub session: SessionSection,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            user_id: None,
            request_timeout_ms: 10_000,
            backoff: BackoffSection::default(),
            throttle: ThrottleSection::default(),
            cache: CacheSection::default(),
            session: SessionSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub jitter: f64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        let defaults = BackoffConfig::default();
        Self {
            base_delay_ms: millis(defaults.base_delay),
            multiplier: defaults.multiplier,
            max_delay_ms: millis(defaults.max_delay),
            max_retries: defaults.max_retries,
            jitter: defaults.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GateSection {
    pub min_interval_ms: u64,
    #[serde(default)]
    pub max_calls: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_window_ms() -> u64 {
    10_000
}

impl From<&ThrottleConfig> for GateSection {
    fn from(config: &ThrottleConfig) -> Self {
        Self {
            min_interval_ms: millis(config.min_interval),
            max_calls: config.max_calls,
            window_ms: millis(config.window),
        }
    }
}

impl From<&GateSection> for ThrottleConfig {
    fn from(section: &GateSection) -> Self {
        ThrottleConfig::new(
            Duration::from_millis(section.min_interval_ms),
            section.max_calls,
            Duration::from_millis(section.window_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ThrottleSection {
    pub join: GateSection,
    pub leave: GateSection,
    pub send: GateSection,
    pub history_sync: GateSection,
    pub typing: GateSection,
}

impl Default for ThrottleSection {
    fn default() -> Self {
        let defaults = ThrottleSettings::default();
        Self {
            join: (&defaults.join).into(),
            leave: (&defaults.leave).into(),
            send: (&defaults.send).into(),
            history_sync: (&defaults.history_sync).into(),
            typing: (&defaults.typing).into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub page_ttl_secs: u64,
    pub conversation_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        let defaults = CacheTtls::default();
        Self {
            page_ttl_secs: defaults.message_page.as_secs(),
            conversation_ttl_secs: defaults.conversation.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub page_size: u32,
    /// `0` waits for the join confirmation indefinitely.
    pub join_timeout_ms: u64,
    /// `0` waits for the leave confirmation indefinitely.
    pub leave_timeout_ms: u64,
    pub typing_timeout_ms: u64,
    /// Enables the polling change feed when set.
    pub feed_poll_interval_ms: Option<u64>,
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionSettings::default();
        Self {
            page_size: defaults.page_size,
            join_timeout_ms: defaults.join_timeout.map(millis).unwrap_or(0),
            leave_timeout_ms: defaults.leave_timeout.map(millis).unwrap_or(0),
            typing_timeout_ms: millis(defaults.typing_timeout),
            feed_poll_interval_ms: None,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn optional_timeout(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(self.backoff.base_delay_ms),
            multiplier: self.backoff.multiplier,
            max_delay: Duration::from_millis(self.backoff.max_delay_ms),
            max_retries: self.backoff.max_retries,
            jitter: self.backoff.jitter,
        }
    }

    pub fn throttle_settings(&self) -> ThrottleSettings {
        ThrottleSettings {
            join: (&self.throttle.join).into(),
            leave: (&self.throttle.leave).into(),
            send: (&self.throttle.send).into(),
            history_sync: (&self.throttle.history_sync).into(),
            typing: (&self.throttle.typing).into(),
        }
    }

    pub fn cache_ttls(&self) -> CacheTtls {
        CacheTtls {
            message_page: Duration::from_secs(self.cache.page_ttl_secs),
            conversation: Duration::from_secs(self.cache.conversation_ttl_secs),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            page_size: self.session.page_size,
            join_timeout: optional_timeout(self.session.join_timeout_ms),
            leave_timeout: optional_timeout(self.session.leave_timeout_ms),
            typing_timeout: Duration::from_millis(self.session.typing_timeout_ms),
            throttle: self.throttle_settings(),
            ..SessionSettings::default()
        }
    }

    pub fn feed_poll_interval(&self) -> Option<Duration> {
        self.session
            .feed_poll_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn registry(&self) -> SyncRegistry {
        SyncRegistry::new(self.backoff_config(), self.cache_ttls())
    }
}

/// Reads `chat_sync.toml` from the working directory, then applies
/// environment overrides.
pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE), |name| std::env::var(name).ok())
}

/// A missing file yields the defaults; a malformed one is an error.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<Settings>(&raw)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", path.display()))
        }
    };
    apply_env(&mut settings, env)?;
    Ok(settings)
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("invalid value for {name}: '{raw}'"))
}

fn apply_env(
    settings: &mut Settings,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = env("CHAT_SYNC_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__USER_ID") {
        settings.user_id = Some(v);
    }
    if let Some(v) = env("APP__MAX_RETRIES") {
        settings.backoff.max_retries = parse_env("APP__MAX_RETRIES", &v)?;
    }
    if let Some(v) = env("APP__BASE_DELAY_MS") {
        settings.backoff.base_delay_ms = parse_env("APP__BASE_DELAY_MS", &v)?;
    }
    if let Some(v) = env("APP__MAX_DELAY_MS") {
        settings.backoff.max_delay_ms = parse_env("APP__MAX_DELAY_MS", &v)?;
    }
    if let Some(v) = env("APP__JOIN_TIMEOUT_MS") {
        settings.session.join_timeout_ms = parse_env("APP__JOIN_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = env("APP__PAGE_TTL_SECS") {
        settings.cache.page_ttl_secs = parse_env("APP__PAGE_TTL_SECS", &v)?;
    }
    if let Some(v) = env("APP__CONVERSATION_TTL_SECS") {
        settings.cache.conversation_ttl_secs = parse_env("APP__CONVERSATION_TTL_SECS", &v)?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
