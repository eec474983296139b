//! Online roster, page status and targeted ephemeral events (pokes, reactions).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{
    send_broadcast, BroadcastEvent, Broker, BrokerEvent, ChannelRef, ChannelSpec, Concern,
    PokePayload, PresencePayload, PresenceState, ReactionPayload,
};
use crate::error::{RealtimeError, Result};
use crate::models::input::{ReactionInput, ValidateExt};
use crate::models::AuthUser;
use crate::notify::{Notification, NotificationGate, NotificationKind, Notifier};

/// How many incoming pokes/reactions are kept for display.
pub const INCOMING_HISTORY_LIMIT: usize = 50;

const PAGE_STATUS: &[(&str, &str)] = &[
    ("dashboard", "On the dashboard"),
    ("messages", "In messages"),
    ("grades", "Checking grades"),
    ("files", "Browsing files"),
    ("games", "Playing games"),
    ("calendar", "Viewing the calendar"),
    ("assignments", "Working on assignments"),
    ("students", "Viewing students"),
    ("profile", "Viewing a profile"),
    ("settings", "In settings"),
];

/// Human-readable status for a route, e.g. `/grades/42` -> "Checking grades".
pub fn status_for_path(path: &str) -> String {
    let segment = path
        .split(['/', '?', '#'])
        .find(|s| !s.is_empty())
        .unwrap_or("dashboard");
    if let Some((_, status)) = PAGE_STATUS.iter().find(|(page, _)| *page == segment) {
        return status.to_string();
    }
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Online".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectEvent {
    Poke(PokePayload),
    Reaction(ReactionPayload),
}

pub struct PresenceEngine {
    broker: Arc<dyn Broker>,
    notifier: Arc<dyn Notifier>,
    gate: Arc<NotificationGate>,
    user: Option<AuthUser>,
    channel: Option<ChannelRef>,
    /// What we last tracked
    current: Option<PresencePayload>,
    roster: Vec<PresencePayload>,
    /// Peer sessions already announced, keyed by (user id, online_at)
    sessions: HashSet<(String, DateTime<Utc>)>,
    incoming: VecDeque<DirectEvent>,
}

impl PresenceEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
        gate: Arc<NotificationGate>,
    ) -> Self {
        Self {
            broker,
            notifier,
            gate,
            user: None,
            channel: None,
            current: None,
            roster: Vec::new(),
            sessions: HashSet::new(),
            incoming: VecDeque::new(),
        }
    }

    /// Subscribe to the online-users channel and start tracking `user`.
    ///
    /// Returns the channel's event stream; feed it back through
    /// [`PresenceEngine::handle_event`].
    pub async fn join(
        &mut self,
        user: &AuthUser,
        current_page: Option<&str>,
    ) -> Result<mpsc::UnboundedReceiver<BrokerEvent>> {
        if self.channel.is_some() {
            self.leave().await?;
        }

        let spec = ChannelSpec::new(Concern::Presence.topic()).with_presence_key(user.id.clone());
        let subscription = self.broker.subscribe(spec).await?;
        if !subscription.status.is_subscribed() {
            warn!(user_id = %user.id, status = ?subscription.status, "Presence subscribe failed");
            return Err(RealtimeError::Subscribe {
                concern: Concern::Presence,
                status: subscription.status,
            });
        }

        let page = current_page.unwrap_or("/dashboard");
        let payload = PresencePayload {
            user_id: user.id.clone(),
            full_name: user.profile.full_name.clone(),
            email: user.profile.email.clone(),
            avatar_url: user.profile.avatar_url.clone(),
            role: user.profile.role.clone(),
            online_at: Utc::now(),
            current_page: Some(page.to_string()),
            status_text: status_for_path(page),
        };

        if let Err(e) = self.broker.track(&subscription.channel, &payload).await {
            if let Err(e) = self.broker.unsubscribe(&subscription.channel).await {
                warn!(channel_id = subscription.channel.id, error = %e, "Failed to release presence channel");
            }
            return Err(e.into());
        }

        info!(user_id = %user.id, page = %page, "Joined presence");
        self.user = Some(user.clone());
        self.channel = Some(subscription.channel);
        self.current = Some(payload);
        Ok(subscription.events)
    }

    /// Stop tracking and drop the channel. Safe to call when not joined.
    pub async fn leave(&mut self) -> Result<()> {
        self.roster.clear();
        self.sessions.clear();
        self.current = None;
        let Some(channel) = self.channel.take() else {
            return Ok(());
        };
        if let Err(e) = self.broker.untrack(&channel).await {
            warn!(error = %e, "Presence untrack failed");
        }
        if let Err(e) = self.broker.unsubscribe(&channel).await {
            warn!(error = %e, "Presence unsubscribe failed");
        }
        if let Some(user) = self.user.take() {
            info!(user_id = %user.id, "Left presence");
        }
        Ok(())
    }

    pub fn is_joined(&self) -> bool {
        self.channel.is_some()
    }

    /// Re-track with a new page. No-op when not joined or the page is unchanged.
    pub async fn update_page_status(&mut self, path: &str) -> Result<()> {
        let (Some(channel), Some(current)) = (&self.channel, &self.current) else {
            return Ok(());
        };
        if current.current_page.as_deref() == Some(path) {
            return Ok(());
        }

        let mut payload = current.clone();
        payload.current_page = Some(path.to_string());
        payload.status_text = status_for_path(path);
        self.broker.track(channel, &payload).await?;
        debug!(page = %path, status = %payload.status_text, "Updated presence page");
        self.current = Some(payload);
        Ok(())
    }

    pub async fn handle_event(&mut self, event: BrokerEvent) -> Result<()> {
        match event {
            BrokerEvent::PresenceSync => self.refresh_roster().await,
            BrokerEvent::PresenceJoin { key, new_presences } => {
                self.on_join(&key, &new_presences);
                Ok(())
            }
            BrokerEvent::PresenceLeave {
                key,
                left_presences,
            } => {
                self.on_leave(&key, &left_presences);
                Ok(())
            }
            BrokerEvent::Broadcast { event, payload } => {
                match BroadcastEvent::from_wire(&event, payload) {
                    Ok(BroadcastEvent::Poke(poke)) => self.on_poke(poke),
                    Ok(BroadcastEvent::EmojiReaction(reaction)) => self.on_reaction(reaction),
                    Ok(other) => debug!(event = other.name(), "Ignoring broadcast on presence channel"),
                    Err(e) => warn!(error = %e, "Dropping invalid presence broadcast"),
                }
                Ok(())
            }
            BrokerEvent::Insert { .. } | BrokerEvent::Update { .. } | BrokerEvent::Closed => Ok(()),
        }
    }

    async fn refresh_roster(&mut self) -> Result<()> {
        let Some(channel) = &self.channel else {
            return Ok(());
        };
        let state = self.broker.presence_state(channel).await?;
        self.apply_sync(state);
        Ok(())
    }

    /// Rebuild the roster keeping the most recent entry per key, newest first.
    pub fn apply_sync(&mut self, state: PresenceState) {
        let mut latest: HashMap<String, PresencePayload> = HashMap::new();
        for (key, entries) in state {
            if let Some(newest) = entries.into_iter().max_by_key(|p| p.online_at) {
                latest.insert(key, newest);
            }
        }
        let mut roster: Vec<PresencePayload> = latest.into_values().collect();
        roster.sort_by(|a, b| b.online_at.cmp(&a.online_at));
        debug!(online = roster.len(), "Presence synced");
        self.roster = roster;
    }

    fn self_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    fn on_join(&mut self, key: &str, new_presences: &[PresencePayload]) {
        if self.self_id() == Some(key) {
            return;
        }
        let Some(presence) = new_presences.first() else {
            return;
        };
        // Page changes re-track the same session and arrive as joins too
        if !self
            .sessions
            .insert((key.to_string(), presence.online_at))
        {
            return;
        }
        if self.gate.should_notify(key, NotificationKind::CameOnline) {
            self.notifier.notify(
                Notification::new(
                    NotificationKind::CameOnline,
                    format!("{} came online", presence.display_name()),
                    presence.status_text.clone(),
                )
                .about(key),
            );
        }
    }

    fn on_leave(&mut self, key: &str, left_presences: &[PresencePayload]) {
        if self.self_id() == Some(key) {
            return;
        }
        for presence in left_presences {
            self.sessions.remove(&(key.to_string(), presence.online_at));
        }
        let name = left_presences
            .first()
            .map(|p| p.display_name())
            .unwrap_or_else(|| "Someone".to_string());
        if self.gate.should_notify(key, NotificationKind::WentOffline) {
            self.notifier.notify(
                Notification::new(
                    NotificationKind::WentOffline,
                    format!("{} went offline", name),
                    String::new(),
                )
                .about(key),
            );
        }
    }

    fn is_for_me(&self, from_user_id: &str, to_user_id: &str) -> bool {
        match self.self_id() {
            Some(me) => to_user_id == me && from_user_id != me,
            None => false,
        }
    }

    fn remember(&mut self, event: DirectEvent) {
        self.incoming.push_back(event);
        while self.incoming.len() > INCOMING_HISTORY_LIMIT {
            self.incoming.pop_front();
        }
    }

    fn on_poke(&mut self, poke: PokePayload) {
        if !self.is_for_me(&poke.from_user_id, &poke.to_user_id) {
            return;
        }
        info!(from = %poke.from_user_id, "Received poke");
        if self.gate.should_notify(&poke.from_user_id, NotificationKind::Poke) {
            self.notifier.notify(
                Notification::new(
                    NotificationKind::Poke,
                    "👋 Poke!",
                    format!("{} poked you", poke.from_name),
                )
                .about(poke.from_user_id.clone()),
            );
        }
        self.remember(DirectEvent::Poke(poke));
    }

    fn on_reaction(&mut self, reaction: ReactionPayload) {
        if !self.is_for_me(&reaction.from_user_id, &reaction.to_user_id) {
            return;
        }
        info!(from = %reaction.from_user_id, emoji = %reaction.emoji, "Received reaction");
        if self
            .gate
            .should_notify(&reaction.from_user_id, NotificationKind::EmojiReaction)
        {
            self.notifier.notify(
                Notification::new(
                    NotificationKind::EmojiReaction,
                    reaction.emoji.clone(),
                    format!("{} sent you {}", reaction.from_name, reaction.emoji),
                )
                .about(reaction.from_user_id.clone()),
            );
        }
        self.remember(DirectEvent::Reaction(reaction));
    }

    fn sender(&self) -> Result<(&ChannelRef, &AuthUser)> {
        match (&self.channel, &self.user) {
            (Some(channel), Some(user)) => Ok((channel, user)),
            _ => Err(RealtimeError::PresenceNotJoined),
        }
    }

    fn name_of(&self, user_id: &str) -> String {
        self.roster
            .iter()
            .find(|p| p.user_id == user_id)
            .map(|p| p.display_name())
            .unwrap_or_else(|| "them".to_string())
    }

    pub async fn send_poke(&self, to_user_id: &str) -> Result<PokePayload> {
        let (channel, user) = self.sender()?;
        let poke = PokePayload {
            from_user_id: user.id.clone(),
            from_name: user.display_name(),
            to_user_id: to_user_id.to_string(),
            sent_at: Utc::now(),
        };
        send_broadcast(self.broker.as_ref(), channel, &BroadcastEvent::Poke(poke.clone())).await?;
        self.notifier.notify(
            Notification::new(
                NotificationKind::PokeSent,
                "Poke sent",
                format!("You poked {}", self.name_of(to_user_id)),
            )
            .about(to_user_id),
        );
        Ok(poke)
    }

    pub async fn send_emoji_reaction(&self, input: ReactionInput) -> Result<ReactionPayload> {
        input.validate_input()?;
        let (channel, user) = self.sender()?;
        let reaction = ReactionPayload {
            from_user_id: user.id.clone(),
            from_name: user.display_name(),
            to_user_id: input.to_user_id,
            emoji: input.emoji,
            sent_at: Utc::now(),
        };
        send_broadcast(
            self.broker.as_ref(),
            channel,
            &BroadcastEvent::EmojiReaction(reaction.clone()),
        )
        .await?;
        self.notifier.notify(
            Notification::new(
                NotificationKind::ReactionSent,
                reaction.emoji.clone(),
                format!("Sent {} to {}", reaction.emoji, self.name_of(&reaction.to_user_id)),
            )
            .about(reaction.to_user_id.clone()),
        );
        Ok(reaction)
    }

    pub fn online_users(&self) -> &[PresencePayload] {
        &self.roster
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.roster.iter().any(|p| p.user_id == user_id)
    }

    pub fn current_presence(&self) -> Option<&PresencePayload> {
        self.current.as_ref()
    }

    /// Pokes and reactions addressed to the local user, oldest first.
    pub fn incoming(&self) -> impl Iterator<Item = &DirectEvent> {
        self.incoming.iter()
    }
}
