//! Publish/subscribe transport abstraction.
//!
//! A broker carries row-change events, presence and broadcasts over named
//! topics. Delivery is best effort: events can be dropped, duplicated or
//! arrive after a subscription is torn down, and the transport can close at
//! any time (signalled with [`BrokerEvent::Closed`]).

pub mod events;
mod hub;
mod local;
pub mod wire;
mod ws;

pub use events::{
    BroadcastEvent, ConversationChangedPayload, PokePayload, PresencePayload, ReactionPayload,
    TypingPayload,
};
pub use hub::Hub;
pub use local::LocalBroker;
pub use ws::WsBroker;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// The four subscriptions a connected client holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Concern {
    Conversations,
    Messages,
    Typing,
    Presence,
}

impl Concern {
    pub fn topic(&self) -> &'static str {
        match self {
            Concern::Conversations => "conversations",
            Concern::Messages => "messages",
            Concern::Typing => "typing",
            Concern::Presence => "online-users",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub topic: String,
    /// Presence entries tracked on this channel are grouped under this key.
    pub presence_key: Option<String>,
    pub receive_own_broadcasts: bool,
}

impl ChannelSpec {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            presence_key: None,
            receive_own_broadcasts: false,
        }
    }

    pub fn with_presence_key(mut self, key: impl Into<String>) -> Self {
        self.presence_key = Some(key.into());
        self
    }
}

/// Handle to one live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: u64,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SubscribeStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

impl SubscribeStatus {
    pub fn is_subscribed(&self) -> bool {
        matches!(self, SubscribeStatus::Subscribed)
    }
}

/// Inbound event shapes delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    Insert {
        table: String,
        new: serde_json::Value,
    },
    Update {
        table: String,
        new: serde_json::Value,
    },
    PresenceSync,
    PresenceJoin {
        key: String,
        new_presences: Vec<PresencePayload>,
    },
    PresenceLeave {
        key: String,
        left_presences: Vec<PresencePayload>,
    },
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
    /// The transport dropped this subscription.
    Closed,
}

/// Snapshot of presence on a channel: key -> every tracked entry for that key.
pub type PresenceState = HashMap<String, Vec<PresencePayload>>;

pub struct Subscription {
    pub channel: ChannelRef,
    pub status: SubscribeStatus,
    pub events: mpsc::UnboundedReceiver<BrokerEvent>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, BrokerError>;

    async fn unsubscribe(&self, channel: &ChannelRef) -> Result<(), BrokerError>;

    async fn track(
        &self,
        channel: &ChannelRef,
        payload: &PresencePayload,
    ) -> Result<(), BrokerError>;

    async fn untrack(&self, channel: &ChannelRef) -> Result<(), BrokerError>;

    async fn send(
        &self,
        channel: &ChannelRef,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), BrokerError>;

    async fn presence_state(&self, channel: &ChannelRef) -> Result<PresenceState, BrokerError>;
}

/// Encode and send a typed broadcast.
pub async fn send_broadcast(
    broker: &dyn Broker,
    channel: &ChannelRef,
    event: &BroadcastEvent,
) -> Result<(), BrokerError> {
    let (name, payload) = event.to_wire()?;
    broker.send(channel, name, payload).await
}
