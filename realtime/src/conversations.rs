//! Conversation list and per-conversation message caches.
//!
//! History comes from storage; live inserts arrive from the broker (or the
//! poller) at least once and in no particular order across channels. Every
//! merge here is idempotent on message id and keeps messages sorted by
//! `created_at`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::broker::{
    send_broadcast, BroadcastEvent, Broker, BrokerEvent, ChannelRef, ConversationChangedPayload,
};
use crate::error::{RealtimeError, Result, StorageError};
use crate::models::input::{CreateGroupInput, SendMessageInput, ValidateExt};
use crate::models::{AuthUser, Conversation, Message, NewConversation, NewMessage, NewParticipant};
use crate::notify::{Notification, NotificationGate, NotificationKind, Notifier};
use crate::storage::{ConversationFilter, SortOrder, Storage};

const MESSAGES_TABLE: &str = "messages";
const CONVERSATION_TABLES: &[&str] = &["conversations", "conversation_participants"];

/// Per-conversation message cache: absent -> loading -> loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageCache {
    /// Live inserts that arrived while the history was being fetched
    Loading(Vec<Message>),
    Loaded(Vec<Message>),
}

pub struct ConversationSync {
    storage: Arc<dyn Storage>,
    broker: Arc<dyn Broker>,
    notifier: Arc<dyn Notifier>,
    gate: Arc<NotificationGate>,
    user: Option<AuthUser>,
    conversations: Vec<Conversation>,
    messages: HashMap<String, MessageCache>,
    /// Newest message `created_at` already included in the loaded unread counts
    counted_through: HashMap<String, DateTime<Utc>>,
    active_conversation: Option<String>,
    conversations_channel: Option<ChannelRef>,
    messages_channel: Option<ChannelRef>,
    reuse_direct_conversations: bool,
}

impl ConversationSync {
    pub fn new(
        storage: Arc<dyn Storage>,
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
        gate: Arc<NotificationGate>,
    ) -> Self {
        Self {
            storage,
            broker,
            notifier,
            gate,
            user: None,
            conversations: Vec::new(),
            messages: HashMap::new(),
            counted_through: HashMap::new(),
            active_conversation: None,
            conversations_channel: None,
            messages_channel: None,
            reuse_direct_conversations: false,
        }
    }

    /// Look up an existing direct conversation before creating a new one.
    pub fn with_direct_reuse(mut self, reuse: bool) -> Self {
        self.reuse_direct_conversations = reuse;
        self
    }

    /// Switch user. Caches are dropped whenever the user actually changes.
    pub fn set_user(&mut self, user: Option<AuthUser>) {
        let changed = self.user.as_ref().map(|u| &u.id) != user.as_ref().map(|u| &u.id);
        self.user = user;
        if changed {
            self.reset();
        }
    }

    pub fn user(&self) -> Option<&AuthUser> {
        self.user.as_ref()
    }

    pub fn reset(&mut self) {
        self.conversations.clear();
        self.messages.clear();
        self.counted_through.clear();
        self.active_conversation = None;
    }

    /// Channels used for outbound `conversation-changed` and `message-insert`.
    pub fn attach(&mut self, conversations: ChannelRef, messages: Option<ChannelRef>) {
        self.conversations_channel = Some(conversations);
        self.messages_channel = messages;
    }

    pub fn detach(&mut self) -> Vec<ChannelRef> {
        self.conversations_channel
            .take()
            .into_iter()
            .chain(self.messages_channel.take())
            .collect()
    }

    fn require_user(&self) -> Result<AuthUser> {
        self.user.clone().ok_or(RealtimeError::NotAuthenticated)
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    fn conversation_mut(&mut self, conversation_id: &str) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
    }

    pub fn message_cache(&self, conversation_id: &str) -> Option<&MessageCache> {
        self.messages.get(conversation_id)
    }

    /// Cached messages, oldest first. `None` until loaded.
    pub fn messages(&self, conversation_id: &str) -> Option<&[Message]> {
        match self.messages.get(conversation_id) {
            Some(MessageCache::Loaded(messages)) => Some(messages),
            _ => None,
        }
    }

    pub fn active_conversation(&self) -> Option<&str> {
        self.active_conversation.as_deref()
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    pub fn unread_count(&self, conversation_id: &str) -> u32 {
        self.conversation(conversation_id)
            .map(|c| c.unread_count)
            .unwrap_or(0)
    }

    fn sort_conversations(&mut self) {
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    /// Reload every conversation the user created or actively participates in.
    /// On error the current list is kept.
    pub async fn load_conversations(&mut self) -> Result<()> {
        let user = self.require_user()?;

        let mut found = self
            .storage
            .list_conversations(&ConversationFilter::CreatedBy(user.id.clone()))
            .await?;
        found.extend(
            self.storage
                .list_conversations(&ConversationFilter::ActiveParticipant(user.id.clone()))
                .await?,
        );

        let mut seen = HashSet::new();
        let mut conversations = Vec::with_capacity(found.len());
        let mut counted_through = HashMap::new();
        for mut conversation in found {
            if !seen.insert(conversation.id.clone()) {
                continue;
            }
            conversation.participants = self.storage.list_participants(&conversation.id).await?;
            let history = self
                .storage
                .list_messages(&conversation.id, SortOrder::Descending)
                .await?;
            let last_read = conversation
                .participant(&user.id)
                .and_then(|p| p.last_read_at);
            conversation.unread_count = count_unread(&history, &user.id, last_read);
            if let Some(newest) = history.iter().map(|m| m.created_at).max() {
                counted_through.insert(conversation.id.clone(), newest);
            }
            conversation.last_message = history.into_iter().next();
            conversations.push(conversation);
        }

        info!(user_id = %user.id, count = conversations.len(), "Loaded conversations");
        self.conversations = conversations;
        self.counted_through = counted_through;
        self.sort_conversations();
        Ok(())
    }

    /// Replace the cached history for a conversation, then mark it read.
    pub async fn load_messages(&mut self, conversation_id: &str) -> Result<()> {
        self.require_user()?;
        let previous = self
            .messages
            .insert(conversation_id.to_string(), MessageCache::Loading(Vec::new()));

        match self
            .storage
            .list_messages(conversation_id, SortOrder::Ascending)
            .await
        {
            Ok(mut history) => {
                for message in self.take_buffered(conversation_id) {
                    if !history.iter().any(|m| m.id == message.id) {
                        history.push(message);
                    }
                }
                history.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                debug!(conversation_id = %conversation_id, count = history.len(), "Loaded messages");
                self.messages
                    .insert(conversation_id.to_string(), MessageCache::Loaded(history));
            }
            Err(e) => {
                let buffered = self.take_buffered(conversation_id);
                match previous {
                    Some(cache) => self.messages.insert(conversation_id.to_string(), cache),
                    None => self.messages.remove(conversation_id),
                };
                for message in buffered {
                    self.append_message(message);
                }
                error!(conversation_id = %conversation_id, error = %e, "Failed to load messages");
                return Err(e.into());
            }
        }

        self.mark_conversation_as_read(conversation_id).await
    }

    /// Select the conversation on screen; selecting one marks it read.
    pub async fn set_active_conversation(&mut self, conversation_id: Option<&str>) -> Result<()> {
        self.active_conversation = conversation_id.map(String::from);
        match conversation_id {
            Some(id) => self.mark_conversation_as_read(id).await,
            None => Ok(()),
        }
    }

    /// Send into the active conversation.
    pub async fn send_to_active(&mut self, content: &str) -> Result<Message> {
        let conversation_id = self
            .active_conversation
            .clone()
            .ok_or(RealtimeError::NoActiveConversation)?;
        self.send_message(&conversation_id, content).await
    }

    /// Insert remotely, then mirror the confirmed row locally.
    pub async fn send_message(&mut self, conversation_id: &str, content: &str) -> Result<Message> {
        let user = self.require_user()?;
        SendMessageInput {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
        }
        .validate_input()?;

        let mut message = self
            .storage
            .insert_message(NewMessage {
                conversation_id: conversation_id.to_string(),
                sender_id: user.id.clone(),
                content: content.to_string(),
                attachments: Vec::new(),
            })
            .await
            .inspect_err(|e| {
                error!(conversation_id = %conversation_id, error = %e, "Failed to send message")
            })?;
        if message.sender.is_none() {
            message.sender = Some(user.profile.clone());
        }

        self.append_message(message.clone());
        if let Some(conversation) = self.conversation_mut(conversation_id) {
            bump_last_message(conversation, &message);
        }
        self.sort_conversations();

        if let Some(channel) = &self.messages_channel {
            let event = BroadcastEvent::MessageInsert(message.clone());
            if let Err(e) = send_broadcast(self.broker.as_ref(), channel, &event).await {
                warn!(message_id = %message.id, error = %e, "Failed to broadcast message insert");
            }
        }
        Ok(message)
    }

    /// Insert into the cache unless the id is already there. Returns whether it was added.
    fn append_message(&mut self, message: Message) -> bool {
        let cache = self
            .messages
            .entry(message.conversation_id.clone())
            .or_insert_with(|| MessageCache::Loaded(Vec::new()));
        let messages = match cache {
            MessageCache::Loaded(messages) | MessageCache::Loading(messages) => messages,
        };
        if messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        let at = messages.partition_point(|m| m.created_at <= message.created_at);
        messages.insert(at, message);
        true
    }

    fn take_buffered(&mut self, conversation_id: &str) -> Vec<Message> {
        match self.messages.remove(conversation_id) {
            Some(MessageCache::Loading(buffered)) => buffered,
            Some(other) => {
                self.messages.insert(conversation_id.to_string(), other);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn is_cached(&self, message: &Message) -> bool {
        if let Some(MessageCache::Loaded(messages) | MessageCache::Loading(messages)) =
            self.messages.get(&message.conversation_id)
        {
            if messages.iter().any(|m| m.id == message.id) {
                return true;
            }
        }
        self.conversation(&message.conversation_id)
            .and_then(|c| c.last_message.as_ref())
            .is_some_and(|m| m.id == message.id)
    }

    async fn is_active_member(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        if let Some(conversation) = self.conversation(conversation_id) {
            return Ok(conversation.is_active_participant(user_id));
        }
        let participants = self.storage.list_participants(conversation_id).await?;
        Ok(participants
            .iter()
            .any(|p| p.user_id == user_id && p.is_active))
    }

    /// Merge a message delivered by the broker or the poller.
    pub async fn handle_live_insert(&mut self, mut message: Message) -> Result<()> {
        let Some(user) = self.user.clone() else {
            return Ok(());
        };
        if self.is_cached(&message) {
            debug!(message_id = %message.id, "Duplicate live insert ignored");
            return Ok(());
        }
        if !self
            .is_active_member(&message.conversation_id, &user.id)
            .await?
        {
            debug!(
                message_id = %message.id,
                conversation_id = %message.conversation_id,
                "Live insert for a conversation we no longer participate in"
            );
            return Ok(());
        }

        if message.sender.is_none() {
            if let Some(sender_id) = message.sender_id.clone() {
                message.sender = match self
                    .conversation(&message.conversation_id)
                    .and_then(|c| c.participant(&sender_id))
                    .and_then(|p| p.profile.clone())
                {
                    Some(profile) => Some(profile),
                    None => self.storage.get_profile(&sender_id).await.unwrap_or_else(|e| {
                        warn!(sender_id = %sender_id, error = %e, "Failed to fetch sender profile");
                        None
                    }),
                };
            }
        }

        let from_other = !message.is_from(&user.id);
        if from_other {
            if let Some(sender_id) = &message.sender_id {
                if self.gate.should_notify(sender_id, NotificationKind::NewMessage) {
                    self.notifier.notify(
                        Notification::new(
                            NotificationKind::NewMessage,
                            message.sender_name(),
                            message.payload().preview(),
                        )
                        .about(sender_id.clone())
                        .in_conversation(message.conversation_id.clone()),
                    );
                }
            }
        }

        let conversation_id = message.conversation_id.clone();
        self.append_message(message.clone());

        if self.conversation(&conversation_id).is_none() {
            // New conversation (or one created elsewhere): storage has the counts
            if let Err(e) = self.load_conversations().await {
                warn!(conversation_id = %conversation_id, error = %e, "Failed to reload conversations");
            }
            return Ok(());
        }

        let is_active = self.active_conversation.as_deref() == Some(conversation_id.as_str());
        // Stored before the last list load, so already part of its unread count
        let already_counted = self
            .counted_through
            .get(&conversation_id)
            .is_some_and(|at| message.created_at <= *at);
        if let Some(conversation) = self.conversation_mut(&conversation_id) {
            bump_last_message(conversation, &message);
            let last_read = conversation
                .participant(&user.id)
                .and_then(|p| p.last_read_at);
            if from_other
                && !is_active
                && !already_counted
                && last_read.map_or(true, |at| message.created_at > at)
            {
                conversation.unread_count += 1;
            }
        }
        self.sort_conversations();

        if is_active && from_other {
            self.mark_conversation_as_read(&conversation_id).await?;
        }
        Ok(())
    }

    /// Apply an edit or soft-delete in place.
    pub fn handle_message_update(&mut self, message: Message) {
        if let Some(MessageCache::Loaded(messages) | MessageCache::Loading(messages)) =
            self.messages.get_mut(&message.conversation_id)
        {
            if let Some(existing) = messages.iter_mut().find(|m| m.id == message.id) {
                existing.content = message.content.clone();
                existing.edited_at = message.edited_at;
                existing.is_deleted = message.is_deleted;
            }
        }
        if let Some(conversation) = self.conversation_mut(&message.conversation_id) {
            if let Some(last) = conversation
                .last_message
                .as_mut()
                .filter(|m| m.id == message.id)
            {
                last.content = message.content;
                last.edited_at = message.edited_at;
                last.is_deleted = message.is_deleted;
            }
        }
    }

    /// Route an inbound event from the conversations or messages channel.
    pub async fn handle_event(&mut self, event: BrokerEvent) -> Result<()> {
        match event {
            BrokerEvent::Insert { table, new } if table == MESSAGES_TABLE => {
                let message: Message = serde_json::from_value(new)
                    .map_err(|e| RealtimeError::InvalidEvent(format!("message row: {}", e)))?;
                self.handle_live_insert(message).await
            }
            BrokerEvent::Update { table, new } if table == MESSAGES_TABLE => {
                let message: Message = serde_json::from_value(new)
                    .map_err(|e| RealtimeError::InvalidEvent(format!("message row: {}", e)))?;
                self.handle_message_update(message);
                Ok(())
            }
            BrokerEvent::Insert { table, .. } | BrokerEvent::Update { table, .. }
                if CONVERSATION_TABLES.contains(&table.as_str()) =>
            {
                self.load_conversations().await
            }
            BrokerEvent::Broadcast { event, payload } => {
                match BroadcastEvent::from_wire(&event, payload)? {
                    BroadcastEvent::MessageInsert(message) => self.handle_live_insert(message).await,
                    BroadcastEvent::ConversationChanged(changed) => {
                        debug!(conversation_id = %changed.conversation_id, "Conversation changed elsewhere");
                        self.load_conversations().await
                    }
                    other => {
                        debug!(event = other.name(), "Ignoring broadcast on conversation channel");
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        }
    }

    /// Zero the unread count and stamp `last_read_at`. Storage failures are
    /// logged and not retried.
    pub async fn mark_conversation_as_read(&mut self, conversation_id: &str) -> Result<()> {
        let user = self.require_user()?;
        let now = Utc::now();

        let participant_id = match self.conversation_mut(conversation_id) {
            Some(conversation) => {
                conversation.unread_count = 0;
                conversation.participant_mut(&user.id).map(|p| {
                    p.last_read_at = Some(now);
                    p.id.clone()
                })
            }
            None => None,
        };
        let participant_id = match participant_id {
            Some(id) => Some(id),
            None => match self.storage.list_participants(conversation_id).await {
                Ok(participants) => participants
                    .into_iter()
                    .find(|p| p.user_id == user.id)
                    .map(|p| p.id),
                Err(e) => {
                    warn!(conversation_id = %conversation_id, error = %e, "Failed to look up participant");
                    None
                }
            },
        };

        if let Some(participant_id) = participant_id {
            if let Err(e) = self
                .storage
                .update_participant_last_read(&participant_id, now)
                .await
            {
                warn!(conversation_id = %conversation_id, error = %e, "Failed to mark conversation as read");
            }
        }
        Ok(())
    }

    fn find_direct(&self, self_id: &str, other_user_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| {
            if c.is_group {
                return false;
            }
            let members: HashSet<&str> = c
                .participants
                .iter()
                .filter(|p| p.is_active)
                .map(|p| p.user_id.as_str())
                .collect();
            let wanted: HashSet<&str> = [self_id, other_user_id].into_iter().collect();
            members == wanted
        })
    }

    /// Create a 1:1 conversation. With `other_user_id == self` this yields a
    /// notes-to-self conversation with a single participant row.
    pub async fn create_direct_conversation(&mut self, other_user_id: &str) -> Result<Conversation> {
        let user = self.require_user()?;
        if self.reuse_direct_conversations {
            if let Some(existing) = self.find_direct(&user.id, other_user_id) {
                debug!(conversation_id = %existing.id, "Reusing direct conversation");
                return Ok(existing.clone());
            }
        }

        let conversation = self
            .storage
            .insert_conversation(NewConversation {
                name: None,
                is_group: false,
                created_by: user.id.clone(),
            })
            .await?;

        let pair = [
            NewParticipant {
                conversation_id: conversation.id.clone(),
                user_id: user.id.clone(),
            },
            NewParticipant {
                conversation_id: conversation.id.clone(),
                user_id: other_user_id.to_string(),
            },
        ];
        let inserted = match self.storage.insert_participants(&pair).await {
            Err(StorageError::UniqueViolation(detail)) => {
                debug!(conversation_id = %conversation.id, detail = %detail, "Participant collision, inserting creator only");
                self.storage.insert_participants(&pair[..1]).await
            }
            other => other,
        };
        if let Err(e) = inserted {
            self.discard(&conversation.id).await;
            return Err(e.into());
        }

        self.finish_create(conversation).await
    }

    pub async fn create_group_conversation(
        &mut self,
        name: &str,
        participant_ids: &[String],
    ) -> Result<Conversation> {
        let user = self.require_user()?;
        CreateGroupInput {
            name: name.to_string(),
            participant_ids: participant_ids.to_vec(),
        }
        .validate_input()?;

        let conversation = self
            .storage
            .insert_conversation(NewConversation {
                name: Some(name.trim().to_string()),
                is_group: true,
                created_by: user.id.clone(),
            })
            .await?;

        let mut members = vec![user.id.clone()];
        for id in participant_ids {
            if !members.contains(id) {
                members.push(id.clone());
            }
        }
        let rows: Vec<NewParticipant> = members
            .into_iter()
            .map(|user_id| NewParticipant {
                conversation_id: conversation.id.clone(),
                user_id,
            })
            .collect();
        if let Err(e) = self.storage.insert_participants(&rows).await {
            self.discard(&conversation.id).await;
            return Err(e.into());
        }

        self.finish_create(conversation).await
    }

    async fn discard(&self, conversation_id: &str) {
        if let Err(e) = self.storage.delete_conversation(conversation_id).await {
            warn!(conversation_id = %conversation_id, error = %e, "Failed to clean up conversation");
        }
    }

    async fn finish_create(&mut self, conversation: Conversation) -> Result<Conversation> {
        info!(conversation_id = %conversation.id, is_group = conversation.is_group, "Created conversation");
        if let Err(e) = self.load_conversations().await {
            warn!(conversation_id = %conversation.id, error = %e, "Failed to reload conversations after create");
        }
        self.announce_change(&conversation.id).await;
        Ok(self
            .conversation(&conversation.id)
            .cloned()
            .unwrap_or(conversation))
    }

    async fn announce_change(&self, conversation_id: &str) {
        let Some(channel) = &self.conversations_channel else {
            return;
        };
        let event = BroadcastEvent::ConversationChanged(ConversationChangedPayload {
            conversation_id: conversation_id.to_string(),
        });
        if let Err(e) = send_broadcast(self.broker.as_ref(), channel, &event).await {
            warn!(conversation_id = %conversation_id, error = %e, "Failed to announce conversation change");
        }
    }

    pub async fn delete_conversation(&mut self, conversation_id: &str) -> Result<()> {
        self.require_user()?;
        self.storage.delete_conversation(conversation_id).await?;

        self.conversations.retain(|c| c.id != conversation_id);
        self.messages.remove(conversation_id);
        self.counted_through.remove(conversation_id);
        if self.active_conversation.as_deref() == Some(conversation_id) {
            self.active_conversation = None;
        }
        info!(conversation_id = %conversation_id, "Deleted conversation");
        self.announce_change(conversation_id).await;
        Ok(())
    }
}

/// Messages from others newer than `last_read`. Never counts the user's own.
pub fn count_unread(messages: &[Message], self_id: &str, last_read: Option<DateTime<Utc>>) -> u32 {
    messages
        .iter()
        .filter(|m| !m.is_from(self_id) && !m.is_deleted)
        .filter(|m| last_read.map_or(true, |at| m.created_at > at))
        .count() as u32
}

fn bump_last_message(conversation: &mut Conversation, message: &Message) {
    let newer = conversation
        .last_message
        .as_ref()
        .map_or(true, |last| message.created_at >= last.created_at);
    if newer {
        conversation.last_message = Some(message.clone());
    }
    if message.created_at > conversation.updated_at {
        conversation.updated_at = message.created_at;
    }
}
