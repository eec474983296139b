//! Typing indicators: who is typing in which conversation.
//!
//! Purely transient state. The coordinator keeps no timers of its own; the
//! owner calls [`TypingCoordinator::expire_idle`] on whatever tick it has.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::broker::{send_broadcast, BroadcastEvent, Broker, ChannelRef, TypingPayload};
use crate::error::Result;

/// An entry with no refresh for this long is considered stale.
pub const TYPING_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: String,
    pub user_name: String,
    pub last_seen: DateTime<Utc>,
}

pub struct TypingCoordinator {
    broker: Arc<dyn Broker>,
    channel: Option<ChannelRef>,
    self_id: Option<String>,
    /// conversation id -> users typing there
    typing: HashMap<String, Vec<TypingUser>>,
}

impl TypingCoordinator {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            channel: None,
            self_id: None,
            typing: HashMap::new(),
        }
    }

    pub fn attach(&mut self, channel: ChannelRef, self_id: impl Into<String>) {
        self.channel = Some(channel);
        self.self_id = Some(self_id.into());
    }

    /// Forget the channel and every typing entry. Returns the channel so the
    /// owner can unsubscribe it.
    pub fn detach(&mut self) -> Option<ChannelRef> {
        self.typing.clear();
        self.self_id = None;
        self.channel.take()
    }

    pub fn is_attached(&self) -> bool {
        self.channel.is_some()
    }

    pub async fn set_user_typing(
        &mut self,
        conversation_id: &str,
        user_id: &str,
        user_name: &str,
    ) -> Result<()> {
        self.upsert(conversation_id, user_id, user_name, Utc::now());
        self.broadcast(conversation_id, user_id, user_name, true).await
    }

    pub async fn set_user_not_typing(
        &mut self,
        conversation_id: &str,
        user_id: &str,
        user_name: &str,
    ) -> Result<()> {
        self.remove(conversation_id, user_id);
        self.broadcast(conversation_id, user_id, user_name, false).await
    }

    /// Apply a typing broadcast from a peer.
    pub fn handle_event(&mut self, payload: TypingPayload) {
        self.handle_event_at(payload, Utc::now());
    }

    pub fn handle_event_at(&mut self, payload: TypingPayload, now: DateTime<Utc>) {
        if self.self_id.as_deref() == Some(payload.user_id.as_str()) {
            return;
        }
        if payload.is_typing {
            self.upsert(
                &payload.conversation_id,
                &payload.user_id,
                &payload.user_name,
                now,
            );
        } else {
            self.remove(&payload.conversation_id, &payload.user_id);
        }
    }

    /// Users typing in a conversation, never including the local user.
    pub fn typing_users(&self, conversation_id: &str) -> Vec<TypingUser> {
        self.typing
            .get(conversation_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|u| self.self_id.as_deref() != Some(u.user_id.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop entries idle longer than [`TYPING_IDLE_TIMEOUT`]. The local user's
    /// own expired entries are announced as stopped.
    pub async fn expire_idle(&mut self, now: DateTime<Utc>) -> Vec<TypingPayload> {
        let idle = chrono::Duration::from_std(TYPING_IDLE_TIMEOUT)
            .unwrap_or_else(|_| chrono::Duration::seconds(2));
        let mut expired = Vec::new();
        self.typing.retain(|conversation_id, users| {
            users.retain(|u| {
                let stale = now.signed_duration_since(u.last_seen) > idle;
                if stale {
                    expired.push(TypingPayload {
                        conversation_id: conversation_id.clone(),
                        user_id: u.user_id.clone(),
                        user_name: u.user_name.clone(),
                        is_typing: false,
                    });
                }
                !stale
            });
            !users.is_empty()
        });

        for payload in &expired {
            if self.self_id.as_deref() == Some(payload.user_id.as_str()) {
                if let Err(e) = self
                    .broadcast(&payload.conversation_id, &payload.user_id, &payload.user_name, false)
                    .await
                {
                    warn!(error = %e, conversation_id = %payload.conversation_id, "Failed to announce typing stop");
                }
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired idle typing entries");
        }
        expired
    }

    fn upsert(&mut self, conversation_id: &str, user_id: &str, user_name: &str, now: DateTime<Utc>) {
        let users = self.typing.entry(conversation_id.to_string()).or_default();
        match users.iter_mut().find(|u| u.user_id == user_id) {
            Some(existing) => {
                existing.user_name = user_name.to_string();
                existing.last_seen = now;
            }
            None => users.push(TypingUser {
                user_id: user_id.to_string(),
                user_name: user_name.to_string(),
                last_seen: now,
            }),
        }
    }

    fn remove(&mut self, conversation_id: &str, user_id: &str) {
        if let Some(users) = self.typing.get_mut(conversation_id) {
            users.retain(|u| u.user_id != user_id);
            if users.is_empty() {
                self.typing.remove(conversation_id);
            }
        }
    }

    async fn broadcast(
        &self,
        conversation_id: &str,
        user_id: &str,
        user_name: &str,
        is_typing: bool,
    ) -> Result<()> {
        let Some(channel) = &self.channel else {
            debug!(conversation_id = %conversation_id, "Typing channel not attached, local update only");
            return Ok(());
        };
        let event = BroadcastEvent::Typing(TypingPayload {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            is_typing,
        });
        send_broadcast(self.broker.as_ref(), channel, &event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerEvent, ChannelSpec, Hub, LocalBroker};

    fn payload(conversation_id: &str, user_id: &str, is_typing: bool) -> TypingPayload {
        TypingPayload {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            user_name: user_id.to_uppercase(),
            is_typing,
        }
    }

    async fn attached(hub: &Arc<Hub>, self_id: &str) -> TypingCoordinator {
        let broker = Arc::new(LocalBroker::new(hub.clone()));
        let sub = broker.subscribe(ChannelSpec::new("typing")).await.unwrap();
        let mut coordinator = TypingCoordinator::new(broker);
        coordinator.attach(sub.channel, self_id);
        coordinator
    }

    #[tokio::test]
    async fn test_set_typing_broadcasts_to_peers() {
        let hub = Arc::new(Hub::new());
        let mut alice = attached(&hub, "alice").await;
        let (_peer, mut peer_rx) = hub.join(&ChannelSpec::new("typing"));

        alice.set_user_typing("c1", "alice", "Alice").await.unwrap();

        match peer_rx.try_recv().unwrap() {
            BrokerEvent::Broadcast { event, payload } => {
                assert_eq!(event, "typing");
                assert_eq!(payload["is_typing"], true);
                assert_eq!(payload["conversation_id"], "c1");
            }
            other => panic!("Expected broadcast, got {:?}", other),
        }

        alice.set_user_not_typing("c1", "alice", "Alice").await.unwrap();
        match peer_rx.try_recv().unwrap() {
            BrokerEvent::Broadcast { payload, .. } => assert_eq!(payload["is_typing"], false),
            other => panic!("Expected broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_own_events_are_ignored() {
        let hub = Arc::new(Hub::new());
        let mut alice = attached(&hub, "alice").await;

        alice.handle_event(payload("c1", "alice", true));
        assert!(alice.typing_users("c1").is_empty());

        // Local typing is tracked but never reported as "others typing"
        alice.set_user_typing("c1", "alice", "Alice").await.unwrap();
        assert!(alice.typing_users("c1").is_empty());
    }

    #[tokio::test]
    async fn test_peer_start_and_stop() {
        let hub = Arc::new(Hub::new());
        let mut alice = attached(&hub, "alice").await;

        alice.handle_event(payload("c1", "bob", true));
        alice.handle_event(payload("c1", "bob", true));
        alice.handle_event(payload("c2", "carol", true));

        let users = alice.typing_users("c1");
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_name, "BOB");

        alice.handle_event(payload("c1", "bob", false));
        assert!(alice.typing_users("c1").is_empty());
        assert_eq!(alice.typing_users("c2").len(), 1);
    }

    #[tokio::test]
    async fn test_expire_idle_announces_own_stop() {
        let hub = Arc::new(Hub::new());
        let mut alice = attached(&hub, "alice").await;
        let (_peer, mut peer_rx) = hub.join(&ChannelSpec::new("typing"));

        let start = Utc::now();
        alice.handle_event_at(payload("c1", "bob", true), start);
        alice.set_user_typing("c1", "alice", "Alice").await.unwrap();
        while peer_rx.try_recv().is_ok() {}

        let expired = alice
            .expire_idle(Utc::now() + chrono::Duration::seconds(3))
            .await;
        assert_eq!(expired.len(), 2);
        assert!(alice.typing_users("c1").is_empty());

        // Only the local user's stop is broadcast
        match peer_rx.try_recv().unwrap() {
            BrokerEvent::Broadcast { payload, .. } => {
                assert_eq!(payload["user_id"], "alice");
                assert_eq!(payload["is_typing"], false);
            }
            other => panic!("Expected broadcast, got {:?}", other),
        }
        assert!(peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fresh_entries_survive_expiry() {
        let hub = Arc::new(Hub::new());
        let mut alice = attached(&hub, "alice").await;
        let now = Utc::now();
        alice.handle_event_at(payload("c1", "bob", true), now);

        let expired = alice.expire_idle(now + chrono::Duration::seconds(1)).await;
        assert!(expired.is_empty());
        assert_eq!(alice.typing_users("c1").len(), 1);
    }

    #[tokio::test]
    async fn test_detach_clears_state() {
        let hub = Arc::new(Hub::new());
        let mut alice = attached(&hub, "alice").await;
        alice.handle_event(payload("c1", "bob", true));

        assert!(alice.detach().is_some());
        assert!(!alice.is_attached());
        assert!(alice.typing_users("c1").is_empty());
        assert!(alice.detach().is_none());
    }
}
