//! Shared fixtures for the realtime integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use classroom_realtime::models::{AuthUser, NewConversation, NewParticipant, Profile};
use classroom_realtime::{
    ChannelManager, ChannelNotifier, Hub, LocalBroker, Notification, NotificationKind,
    RealtimeConfig, SqliteStorage, Storage,
};
use tokio::sync::mpsc;

pub const SETTLE: Duration = Duration::from_millis(50);

pub fn user(id: &str, name: &str) -> AuthUser {
    AuthUser::new(Profile::new(id, name))
}

pub fn storage_with_profiles(users: &[&AuthUser]) -> Arc<SqliteStorage> {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    for user in users {
        storage.upsert_profile(&user.profile).unwrap();
    }
    storage
}

/// Conversation created by `creator` with every id in `members` as participant.
pub async fn seed_conversation(
    storage: &SqliteStorage,
    creator: &str,
    members: &[&str],
    is_group: bool,
) -> String {
    let conversation = storage
        .insert_conversation(NewConversation {
            name: is_group.then(|| "Study group".to_string()),
            is_group,
            created_by: creator.to_string(),
        })
        .await
        .unwrap();
    let rows: Vec<NewParticipant> = members
        .iter()
        .map(|user_id| NewParticipant {
            conversation_id: conversation.id.clone(),
            user_id: user_id.to_string(),
        })
        .collect();
    storage.insert_participants(&rows).await.unwrap();
    conversation.id
}

pub struct Client {
    pub manager: ChannelManager,
    pub notes: mpsc::UnboundedReceiver<Notification>,
}

impl Client {
    pub fn new(hub: &Arc<Hub>, storage: Arc<dyn Storage>, config: RealtimeConfig) -> Self {
        let (notifier, notes) = ChannelNotifier::new();
        let manager = ChannelManager::new(
            Arc::new(LocalBroker::new(hub.clone())),
            storage,
            Arc::new(notifier),
            config,
        );
        Self { manager, notes }
    }

    pub async fn connected(hub: &Arc<Hub>, storage: Arc<dyn Storage>, user: &AuthUser) -> Self {
        let mut client = Self::new(hub, storage, RealtimeConfig::default());
        client.manager.connect(user.clone()).await.unwrap();
        client
    }

    pub async fn settle(&mut self) -> usize {
        self.manager.drain(SETTLE).await
    }

    pub fn take_notes(&mut self, kind: NotificationKind) -> Vec<Notification> {
        let mut matching = Vec::new();
        while let Ok(note) = self.notes.try_recv() {
            if note.kind == kind {
                matching.push(note);
            }
        }
        matching
    }
}
