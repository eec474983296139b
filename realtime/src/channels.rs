//! Channel lifecycle: one subscription group per authenticated user.
//!
//! The manager is the single actor that owns every in-memory model. Broker
//! subscriptions are forwarded into one inbound queue, each event tagged with
//! the connection generation it belongs to; events from a torn-down
//! generation are dropped before they reach a component.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BroadcastEvent, Broker, BrokerEvent, ChannelRef, ChannelSpec, Concern, SubscribeStatus};
use crate::config::{DeliveryMode, RealtimeConfig};
use crate::conversations::ConversationSync;
use crate::error::{RealtimeError, Result};
use crate::models::AuthUser;
use crate::notify::{Notification, NotificationGate, NotificationKind, Notifier};
use crate::poller::MessagePoller;
use crate::presence::PresenceEngine;
use crate::storage::Storage;
use crate::typing::TypingCoordinator;

const TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// A subscribe failed or the transport closed. Call `reconnect()` to retry.
    Failed,
}

#[derive(Debug, Clone)]
pub struct Inbound {
    pub concern: Concern,
    pub generation: u64,
    pub event: BrokerEvent,
}

/// Sending half of the manager's inbound queue.
#[derive(Clone)]
pub struct EventRouter {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl EventRouter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the receiving side is gone.
    pub fn deliver(&self, concern: Concern, generation: u64, event: BrokerEvent) -> bool {
        self.tx
            .send(Inbound {
                concern,
                generation,
                event,
            })
            .is_ok()
    }

    /// Pump a subscription's events into the queue until either side closes.
    pub fn forward(
        &self,
        concern: Concern,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<BrokerEvent>,
    ) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !router.deliver(concern, generation, event) {
                    break;
                }
            }
            debug!(concern = ?concern, generation, "Forwarder finished");
        })
    }
}

pub struct ChannelManager {
    broker: Arc<dyn Broker>,
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
    config: RealtimeConfig,
    state: ConnectionState,
    /// User of the live (or last attempted) subscription group
    session_user: Option<AuthUser>,
    generation: u64,
    channels: Vec<(Concern, ChannelRef)>,
    forwarders: Vec<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
    router: EventRouter,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    current_page: Option<String>,
    conversations: ConversationSync,
    typing: TypingCoordinator,
    presence: PresenceEngine,
}

impl ChannelManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        config: RealtimeConfig,
    ) -> Self {
        let gate = Arc::new(NotificationGate::new(config.notification_cooldown));
        let (router, inbound) = EventRouter::channel();
        Self {
            conversations: ConversationSync::new(
                storage.clone(),
                broker.clone(),
                notifier.clone(),
                gate.clone(),
            )
            .with_direct_reuse(config.reuse_direct_conversations),
            typing: TypingCoordinator::new(broker.clone()),
            presence: PresenceEngine::new(broker.clone(), notifier.clone(), gate),
            broker,
            storage,
            notifier,
            config,
            state: ConnectionState::Disconnected,
            session_user: None,
            generation: 0,
            channels: Vec::new(),
            forwarders: Vec::new(),
            poller: None,
            router,
            inbound,
            current_page: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn user(&self) -> Option<&AuthUser> {
        self.session_user.as_ref()
    }

    pub fn router(&self) -> EventRouter {
        self.router.clone()
    }

    pub fn conversations(&self) -> &ConversationSync {
        &self.conversations
    }

    pub fn conversations_mut(&mut self) -> &mut ConversationSync {
        &mut self.conversations
    }

    pub fn typing(&self) -> &TypingCoordinator {
        &self.typing
    }

    pub fn typing_mut(&mut self) -> &mut TypingCoordinator {
        &mut self.typing
    }

    pub fn presence(&self) -> &PresenceEngine {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut PresenceEngine {
        &mut self.presence
    }

    /// Page reported to presence on the next join, and re-tracked now if joined.
    pub async fn set_current_page(&mut self, path: &str) -> Result<()> {
        self.current_page = Some(path.to_string());
        self.presence.update_page_status(path).await
    }

    /// Open the subscription group for `user`. Idempotent for the same user.
    pub async fn connect(&mut self, user: AuthUser) -> Result<()> {
        if let Some(current) = &self.session_user {
            if current.id == user.id
                && matches!(
                    self.state,
                    ConnectionState::Connected | ConnectionState::Connecting
                )
            {
                debug!(user_id = %user.id, "Already connected");
                return Ok(());
            }
        }
        if !self.channels.is_empty() || self.presence.is_joined() {
            self.disconnect().await;
        }

        info!(user_id = %user.id, generation = self.generation + 1, "Connecting realtime channels");
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.session_user = Some(user.clone());
        self.conversations.set_user(Some(user.clone()));

        if let Err(e) = self.open_channels(&user).await {
            error!(user_id = %user.id, error = %e, "Realtime connect failed");
            self.disconnect().await;
            self.session_user = Some(user);
            self.state = ConnectionState::Failed;
            return Err(e);
        }

        self.state = ConnectionState::Connected;
        info!(user_id = %user.id, "Realtime channels connected");

        // Bounded wait; on failure the cached list stays in place
        match tokio::time::timeout(
            self.config.session_timeout,
            self.conversations.load_conversations(),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Initial conversation load failed"),
            Err(_) => warn!("Initial conversation load timed out, using cached state"),
        }
        Ok(())
    }

    async fn open_channels(&mut self, user: &AuthUser) -> Result<()> {
        let conversations = self
            .subscribe(Concern::Conversations, ChannelSpec::new(Concern::Conversations.topic()))
            .await?;

        let messages = match self.config.delivery {
            DeliveryMode::Broker => Some(
                self.subscribe(Concern::Messages, ChannelSpec::new(Concern::Messages.topic()))
                    .await?,
            ),
            DeliveryMode::Polling { interval } => {
                let poller = MessagePoller::new(self.storage.clone(), user.id.clone());
                self.poller = Some(poller.spawn(interval, self.router.clone(), self.generation));
                None
            }
        };
        self.conversations.attach(conversations, messages);

        let typing = self
            .subscribe(Concern::Typing, ChannelSpec::new(Concern::Typing.topic()))
            .await?;
        self.typing.attach(typing, user.id.clone());

        let events = match tokio::time::timeout(
            self.config.subscribe_timeout,
            self.presence.join(user, self.current_page.as_deref()),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(RealtimeError::Subscribe {
                    concern: Concern::Presence,
                    status: SubscribeStatus::TimedOut,
                })
            }
        };
        self.forwarders
            .push(self.router.forward(Concern::Presence, self.generation, events));
        Ok(())
    }

    async fn subscribe(&mut self, concern: Concern, spec: ChannelSpec) -> Result<ChannelRef> {
        let subscription =
            match tokio::time::timeout(self.config.subscribe_timeout, self.broker.subscribe(spec))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(RealtimeError::Subscribe {
                        concern,
                        status: SubscribeStatus::TimedOut,
                    })
                }
            };

        if !subscription.status.is_subscribed() {
            // A rejected channel may still have been registered by the broker
            if subscription.channel.id != 0 {
                if let Err(e) = self.broker.unsubscribe(&subscription.channel).await {
                    warn!(concern = ?concern, channel_id = subscription.channel.id, error = %e, "Failed to release rejected channel");
                }
            }
            return Err(RealtimeError::Subscribe {
                concern,
                status: subscription.status,
            });
        }

        debug!(concern = ?concern, channel_id = subscription.channel.id, "Subscribed");
        self.channels.push((concern, subscription.channel.clone()));
        self.forwarders
            .push(self.router.forward(concern, self.generation, subscription.events));
        Ok(subscription.channel)
    }

    /// Tear everything down. Safe to call when never connected.
    pub async fn disconnect(&mut self) {
        self.generation += 1;
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }

        self.typing.detach();
        self.conversations.detach();
        for (concern, channel) in self.channels.drain(..) {
            if let Err(e) = self.broker.unsubscribe(&channel).await {
                warn!(concern = ?concern, error = %e, "Unsubscribe failed");
            }
        }
        if let Err(e) = self.presence.leave().await {
            warn!(error = %e, "Presence leave failed");
        }

        if let Some(user) = self.session_user.take() {
            info!(user_id = %user.id, "Realtime channels disconnected");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Caller-driven retry after a failure.
    pub async fn reconnect(&mut self) -> Result<()> {
        let user = self
            .session_user
            .clone()
            .or_else(|| self.conversations.user().cloned())
            .ok_or(RealtimeError::NotAuthenticated)?;
        self.disconnect().await;
        self.connect(user).await
    }

    /// React to an auth transition: logout, user switch or token refresh.
    pub async fn handle_auth_change(&mut self, user: Option<AuthUser>) -> Result<()> {
        match user {
            None => {
                self.disconnect().await;
                self.conversations.set_user(None);
                Ok(())
            }
            Some(user) => {
                let same_user = self.session_user.as_ref().is_some_and(|u| u.id == user.id);
                if same_user && self.state != ConnectionState::Disconnected {
                    debug!(user_id = %user.id, "Auth refreshed for the same user");
                    return Ok(());
                }
                if !same_user {
                    self.disconnect().await;
                }
                self.connect(user).await
            }
        }
    }

    /// Apply one inbound event. Events from an older generation are dropped.
    pub async fn process(&mut self, inbound: Inbound) -> Result<()> {
        if inbound.generation != self.generation {
            debug!(
                concern = ?inbound.concern,
                event_generation = inbound.generation,
                generation = self.generation,
                "Dropping event from stale subscription"
            );
            return Ok(());
        }

        if inbound.event == BrokerEvent::Closed {
            self.on_closed(inbound.concern);
            return Ok(());
        }

        match inbound.concern {
            Concern::Conversations | Concern::Messages => {
                self.conversations.handle_event(inbound.event).await
            }
            Concern::Typing => {
                if let BrokerEvent::Broadcast { event, payload } = inbound.event {
                    match BroadcastEvent::from_wire(&event, payload)? {
                        BroadcastEvent::Typing(typing) => self.typing.handle_event(typing),
                        other => debug!(event = other.name(), "Ignoring broadcast on typing channel"),
                    }
                }
                Ok(())
            }
            Concern::Presence => self.presence.handle_event(inbound.event).await,
        }
    }

    fn on_closed(&mut self, concern: Concern) {
        if self.state != ConnectionState::Connected {
            return;
        }
        warn!(concern = ?concern, "Realtime channel closed by transport");
        self.state = ConnectionState::Failed;
        self.notifier.notify(Notification::new(
            NotificationKind::ConnectionLost,
            "Connection lost",
            "Live updates are paused until you reconnect",
        ));
    }

    /// Wait for the next inbound event and apply it.
    pub async fn process_next(&mut self) -> Result<()> {
        match self.inbound.recv().await {
            Some(inbound) => self.process(inbound).await,
            None => Ok(()),
        }
    }

    /// Apply inbound events until none arrives for `idle`. Returns how many
    /// were handled; handler errors are logged and skipped.
    pub async fn drain(&mut self, idle: Duration) -> usize {
        let mut handled = 0;
        while let Ok(Some(inbound)) = tokio::time::timeout(idle, self.inbound.recv()).await {
            if let Err(e) = self.process(inbound).await {
                warn!(error = %e, "Failed to apply realtime event");
            }
            handled += 1;
        }
        handled
    }

    /// Drive the manager: auth transitions, inbound events and typing expiry.
    /// Returns after the auth stream ends, disconnected.
    pub async fn run(&mut self, mut auth_rx: mpsc::UnboundedReceiver<Option<AuthUser>>) {
        let mut sweep = tokio::time::interval(TYPING_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                auth = auth_rx.recv() => {
                    match auth {
                        Some(user) => {
                            if let Err(e) = self.handle_auth_change(user).await {
                                error!(error = %e, retryable = e.is_retryable(), "Auth transition failed");
                            }
                        }
                        None => {
                            info!("Auth stream closed, shutting down realtime");
                            break;
                        }
                    }
                }
                Some(inbound) = self.inbound.recv() => {
                    if let Err(e) = self.process(inbound).await {
                        warn!(error = %e, "Failed to apply realtime event");
                    }
                }
                _ = sweep.tick() => {
                    self.typing.expire_idle(Utc::now()).await;
                }
            }
        }

        self.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_router_forwards_until_closed() {
        let (router, mut rx) = EventRouter::channel();
        let (tx, events) = mpsc::unbounded_channel();
        let handle = router.forward(Concern::Typing, 7, events);

        tx.send(BrokerEvent::PresenceSync).unwrap();
        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.concern, Concern::Typing);
        assert_eq!(inbound.generation, 7);

        drop(tx);
        handle.await.unwrap();
    }

    #[test]
    fn test_deliver_reports_closed_queue() {
        let (router, rx) = EventRouter::channel();
        assert!(router.deliver(Concern::Messages, 1, BrokerEvent::PresenceSync));
        drop(rx);
        assert!(!router.deliver(Concern::Messages, 1, BrokerEvent::PresenceSync));
    }
}
