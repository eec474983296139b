//! The persistent store the engine talks to through typed CRUD calls.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::models::{Conversation, Message, NewConversation, NewMessage, NewParticipant, Participant, Profile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationFilter {
    CreatedBy(String),
    ActiveParticipant(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Request/response storage collaborator.
///
/// Conversations come back without `participants`, `last_message` or
/// `unread_count` filled in; the synchronizer derives those.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, StorageError>;

    async fn list_participants(&self, conversation_id: &str)
        -> Result<Vec<Participant>, StorageError>;

    async fn list_messages(
        &self,
        conversation_id: &str,
        order: SortOrder,
    ) -> Result<Vec<Message>, StorageError>;

    async fn insert_message(&self, row: NewMessage) -> Result<Message, StorageError>;

    async fn insert_conversation(&self, row: NewConversation) -> Result<Conversation, StorageError>;

    /// All-or-nothing. Fails with `UniqueViolation` if a (conversation, user) pair repeats.
    async fn insert_participants(
        &self,
        rows: &[NewParticipant],
    ) -> Result<Vec<Participant>, StorageError>;

    async fn update_participant_last_read(
        &self,
        participant_id: &str,
        last_read_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), StorageError>;

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, StorageError>;
}
