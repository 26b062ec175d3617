pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod listeners;
pub mod membership;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod throttle;
pub mod transport;

pub use backoff::{BackoffConfig, BackoffController, OperationKind, RetryKey};
pub use cache::{CacheTtls, HistoryCache};
pub use client::SyncClient;
pub use config::{load_settings, Settings};
pub use error::{ErrorKind, SyncError};
pub use listeners::ListenerId;
pub use registry::SyncRegistry;
pub use session::{ConversationSession, SessionEvent, SessionSettings};
pub use throttle::{OperationClass, ThrottleConfig, ThrottleSettings};
pub use transport::{
    ChangeFeed, FeedChange, FeedQuery, FeedSubscription, HttpRestClient, MissingChangeFeed,
    PollingChangeFeed, PushChannel, RestClient, Transports, WebSocketPushChannel,
};
