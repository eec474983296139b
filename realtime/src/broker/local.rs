use std::sync::Arc;

use async_trait::async_trait;

use super::{
    Broker, ChannelRef, ChannelSpec, Hub, PresencePayload, PresenceState, SubscribeStatus,
    Subscription,
};
use crate::error::BrokerError;

/// `Broker` for clients living in the same process as the [`Hub`].
#[derive(Clone)]
pub struct LocalBroker {
    hub: Arc<Hub>,
}

impl LocalBroker {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, BrokerError> {
        let (channel, events) = self.hub.join(&spec);
        Ok(Subscription {
            channel,
            status: SubscribeStatus::Subscribed,
            events,
        })
    }

    async fn unsubscribe(&self, channel: &ChannelRef) -> Result<(), BrokerError> {
        self.hub.leave(channel)
    }

    async fn track(
        &self,
        channel: &ChannelRef,
        payload: &PresencePayload,
    ) -> Result<(), BrokerError> {
        self.hub.track(channel, payload.clone())
    }

    async fn untrack(&self, channel: &ChannelRef) -> Result<(), BrokerError> {
        self.hub.untrack(channel)
    }

    async fn send(
        &self,
        channel: &ChannelRef,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), BrokerError> {
        self.hub.broadcast(channel, event, payload).map(|_| ())
    }

    async fn presence_state(&self, channel: &ChannelRef) -> Result<PresenceState, BrokerError> {
        self.hub.presence_state(channel)
    }
}
