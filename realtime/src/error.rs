use thiserror::Error;

use crate::broker::{Concern, SubscribeStatus};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage lock poisoned")]
    LockPoisoned,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Unknown channel {0}")]
    UnknownChannel(u64),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Broker rejected request: {0}")]
    Rejected(String),
    #[error("Timed out waiting for broker reply")]
    TimedOut,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Subscribing to {concern:?} channel failed: {status:?}")]
    Subscribe {
        concern: Concern,
        status: SubscribeStatus,
    },
    #[error("No authenticated user")]
    NotAuthenticated,
    #[error("No active conversation selected")]
    NoActiveConversation,
    #[error("Presence channel not joined")]
    PresenceNotJoined,
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Invalid realtime event: {0}")]
    InvalidEvent(String),
}

impl RealtimeError {
    /// Connection-level failures the caller may retry by reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RealtimeError::Subscribe { .. }
                | RealtimeError::Broker(BrokerError::NotConnected)
                | RealtimeError::Broker(BrokerError::Transport(_))
                | RealtimeError::Broker(BrokerError::TimedOut)
        )
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
