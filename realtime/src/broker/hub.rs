use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{BrokerEvent, ChannelRef, ChannelSpec, PresencePayload, PresenceState};
use crate::error::BrokerError;

struct Member {
    id: u64,
    tx: mpsc::UnboundedSender<BrokerEvent>,
    presence_key: Option<String>,
    receive_own: bool,
}

#[derive(Default)]
struct TopicState {
    members: Vec<Member>,
    /// presence key -> (member id, payload), one entry per tracking member
    presences: HashMap<String, Vec<(u64, PresencePayload)>>,
}

impl TopicState {
    fn fan_out(&self, event: &BrokerEvent, skip: Option<u64>) -> usize {
        let mut delivered = 0;
        for member in &self.members {
            if Some(member.id) == skip {
                continue;
            }
            if member.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn snapshot(&self) -> PresenceState {
        self.presences
            .iter()
            .map(|(key, entries)| {
                (
                    key.clone(),
                    entries.iter().map(|(_, payload)| payload.clone()).collect(),
                )
            })
            .collect()
    }

    /// Remove every presence entry owned by `member_id`, returning them grouped by key.
    fn remove_presence(&mut self, member_id: u64) -> Vec<(String, Vec<PresencePayload>)> {
        let mut removed = Vec::new();
        self.presences.retain(|key, entries| {
            let (left, kept): (Vec<_>, Vec<_>) =
                entries.drain(..).partition(|(owner, _)| *owner == member_id);
            *entries = kept;
            if !left.is_empty() {
                removed.push((key.clone(), left.into_iter().map(|(_, p)| p).collect()));
            }
            !entries.is_empty()
        });
        removed
    }

    fn announce_leaves(&self, removed: Vec<(String, Vec<PresencePayload>)>) {
        if removed.is_empty() {
            return;
        }
        for (key, left_presences) in removed {
            self.fan_out(
                &BrokerEvent::PresenceLeave {
                    key,
                    left_presences,
                },
                None,
            );
        }
        self.fan_out(&BrokerEvent::PresenceSync, None);
    }
}

/// In-process topic registry: members, presence and fan-out.
///
/// Shared by [`super::LocalBroker`] clients in one process and by the relay
/// server for remote clients.
pub struct Hub {
    topics: DashMap<String, TopicState>,
    /// channel id -> topic
    channels: DashMap<u64, String>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new member on a topic.
    pub fn join(&self, spec: &ChannelSpec) -> (ChannelRef, mpsc::UnboundedReceiver<BrokerEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .entry(spec.topic.clone())
            .or_default()
            .members
            .push(Member {
                id,
                tx,
                presence_key: spec.presence_key.clone(),
                receive_own: spec.receive_own_broadcasts,
            });
        self.channels.insert(id, spec.topic.clone());
        debug!(channel_id = id, topic = %spec.topic, "Member joined topic");
        (
            ChannelRef {
                id,
                topic: spec.topic.clone(),
            },
            rx,
        )
    }

    fn topic_of(&self, channel: &ChannelRef) -> Result<String, BrokerError> {
        self.channels
            .get(&channel.id)
            .map(|t| t.value().clone())
            .ok_or(BrokerError::UnknownChannel(channel.id))
    }

    /// Remove a member, announcing presence leave for anything it tracked.
    pub fn leave(&self, channel: &ChannelRef) -> Result<(), BrokerError> {
        let topic = self.topic_of(channel)?;
        self.channels.remove(&channel.id);
        let now_empty = match self.topics.get_mut(&topic) {
            Some(mut state) => {
                let removed = state.remove_presence(channel.id);
                state.members.retain(|m| m.id != channel.id);
                state.announce_leaves(removed);
                state.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.topics.remove_if(&topic, |_, state| state.members.is_empty());
        }
        debug!(channel_id = channel.id, topic = %topic, "Member left topic");
        Ok(())
    }

    /// Track (or re-track) presence for a member. Replaces its previous entry.
    pub fn track(&self, channel: &ChannelRef, payload: PresencePayload) -> Result<(), BrokerError> {
        let topic = self.topic_of(channel)?;
        let mut state = self
            .topics
            .get_mut(&topic)
            .ok_or(BrokerError::UnknownChannel(channel.id))?;
        let key = state
            .members
            .iter()
            .find(|m| m.id == channel.id)
            .and_then(|m| m.presence_key.clone())
            .unwrap_or_else(|| payload.user_id.clone());

        let entries = state.presences.entry(key.clone()).or_default();
        entries.retain(|(owner, _)| *owner != channel.id);
        entries.push((channel.id, payload.clone()));

        state.fan_out(
            &BrokerEvent::PresenceJoin {
                key,
                new_presences: vec![payload],
            },
            None,
        );
        state.fan_out(&BrokerEvent::PresenceSync, None);
        Ok(())
    }

    pub fn untrack(&self, channel: &ChannelRef) -> Result<(), BrokerError> {
        let topic = self.topic_of(channel)?;
        if let Some(mut state) = self.topics.get_mut(&topic) {
            let removed = state.remove_presence(channel.id);
            state.announce_leaves(removed);
        }
        Ok(())
    }

    /// Deliver a broadcast to the other members of the sender's topic.
    pub fn broadcast(
        &self,
        channel: &ChannelRef,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<usize, BrokerError> {
        let topic = self.topic_of(channel)?;
        let Some(state) = self.topics.get(&topic) else {
            return Ok(0);
        };
        let receive_own = state
            .members
            .iter()
            .find(|m| m.id == channel.id)
            .map(|m| m.receive_own)
            .unwrap_or(false);
        let skip = if receive_own { None } else { Some(channel.id) };
        Ok(state.fan_out(
            &BrokerEvent::Broadcast {
                event: event.to_string(),
                payload,
            },
            skip,
        ))
    }

    /// Deliver an event to every member of a topic (row changes from storage).
    pub fn publish(&self, topic: &str, event: BrokerEvent) -> usize {
        self.topics
            .get(topic)
            .map(|state| state.fan_out(&event, None))
            .unwrap_or(0)
    }

    pub fn presence_state(&self, channel: &ChannelRef) -> Result<PresenceState, BrokerError> {
        let topic = self.topic_of(channel)?;
        Ok(self
            .topics
            .get(&topic)
            .map(|state| state.snapshot())
            .unwrap_or_default())
    }

    /// Drop members whose receivers are gone, announcing their presence leave.
    pub fn prune_closed(&self) -> usize {
        let closed: Vec<ChannelRef> = self
            .topics
            .iter()
            .flat_map(|entry| {
                let topic = entry.key().clone();
                entry
                    .value()
                    .members
                    .iter()
                    .filter(|m| m.tx.is_closed())
                    .map(|m| ChannelRef {
                        id: m.id,
                        topic: topic.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        for channel in &closed {
            let _ = self.leave(channel);
        }
        if !closed.is_empty() {
            info!(count = closed.len(), "Pruned closed channel members");
        }
        closed.len()
    }

    pub fn member_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|state| state.members.len())
            .unwrap_or(0)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
