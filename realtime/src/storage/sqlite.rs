use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row};
use tracing::debug;

use super::{ConversationFilter, SortOrder, Storage};
use crate::error::StorageError;
use crate::models::{
    Attachment, Conversation, Message, NewConversation, NewMessage, NewParticipant, Participant,
    Profile,
};

const SCHEMA: &str = "
    -- Profile directory (denormalized into participants and messages on read)
    CREATE TABLE IF NOT EXISTS profiles (
        id TEXT PRIMARY KEY,
        full_name TEXT,
        email TEXT,
        avatar_url TEXT,
        role TEXT
    );

    -- Conversations (direct and group)
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        name TEXT,
        is_group INTEGER NOT NULL DEFAULT 0,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    -- Conversation participants
    CREATE TABLE IF NOT EXISTS conversation_participants (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id),
        user_id TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        last_read_at INTEGER,
        joined_at INTEGER NOT NULL,
        UNIQUE (conversation_id, user_id)
    );

    -- Messages
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id),
        sender_id TEXT,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        edited_at INTEGER,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        attachments TEXT NOT NULL DEFAULT '[]'
    );

    CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id);
    CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);
    CREATE INDEX IF NOT EXISTS idx_participants_user_id ON conversation_participants(user_id);
";

const PROFILE_COLUMNS: &str = "p.id, p.full_name, p.email, p.avatar_url, p.role";

/// `Storage` backed by a single SQLite connection.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Opened SQLite storage");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    pub fn upsert_profile(&self, profile: &Profile) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO profiles (id, full_name, email, avatar_url, role) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                full_name = excluded.full_name,
                email = excluded.email,
                avatar_url = excluded.avatar_url,
                role = excluded.role",
            (
                &profile.id,
                &profile.full_name,
                &profile.email,
                &profile.avatar_url,
                &profile.role,
            ),
        )?;
        Ok(())
    }

    /// Mark a participant as having left the conversation.
    pub fn set_participant_active(
        &self,
        conversation_id: &str,
        user_id: &str,
        is_active: bool,
    ) -> Result<(), StorageError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE conversation_participants SET is_active = ?1 WHERE conversation_id = ?2 AND user_id = ?3",
            (is_active as i32, conversation_id, user_id),
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound {
                entity: "participant",
                id: format!("{}/{}", conversation_id, user_id),
            });
        }
        Ok(())
    }

    /// Soft-delete or edit a message in place.
    pub fn update_message(
        &self,
        message_id: &str,
        content: Option<&str>,
        is_deleted: bool,
    ) -> Result<Message, StorageError> {
        let conn = self.lock()?;
        let now = Utc::now().timestamp_millis();
        let updated = conn.execute(
            "UPDATE messages SET content = COALESCE(?1, content), is_deleted = ?2, edited_at = ?3 WHERE id = ?4",
            (content, is_deleted as i32, now, message_id),
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound {
                entity: "message",
                id: message_id.to_string(),
            });
        }
        Ok(conn.query_row(
            &format!("{} WHERE m.id = ?1", message_select()),
            [message_id],
            message_from_row,
        )?)
    }
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn optional_millis(idx: usize, ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(|ms| from_millis(idx, ms)).transpose()
}

fn map_constraint(err: rusqlite::Error) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            StorageError::UniqueViolation(err.to_string())
        }
        _ => StorageError::Sqlite(err),
    }
}

fn profile_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Option<Profile>> {
    let id: Option<String> = row.get(offset)?;
    Ok(match id {
        Some(id) => Some(Profile {
            id,
            full_name: row.get(offset + 1)?,
            email: row.get(offset + 2)?,
            avatar_url: row.get(offset + 3)?,
            role: row.get(offset + 4)?,
        }),
        None => None,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        name: row.get(1)?,
        is_group: row.get::<_, i32>(2)? == 1,
        created_by: row.get(3)?,
        created_at: from_millis(4, row.get(4)?)?,
        updated_at: from_millis(5, row.get(5)?)?,
        participants: Vec::new(),
        last_message: None,
        unread_count: 0,
    })
}

fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<Participant> {
    Ok(Participant {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_id: row.get(2)?,
        is_active: row.get::<_, i32>(3)? == 1,
        last_read_at: optional_millis(4, row.get(4)?)?,
        joined_at: from_millis(5, row.get(5)?)?,
        profile: profile_from_row(row, 6)?,
    })
}

fn message_select() -> String {
    format!(
        "SELECT m.id, m.conversation_id, m.sender_id, m.content, m.created_at, m.edited_at,
                m.is_deleted, m.attachments, {}
         FROM messages m
         LEFT JOIN profiles p ON p.id = m.sender_id",
        PROFILE_COLUMNS
    )
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let attachments_json: String = row.get(7)?;
    let attachments: Vec<Attachment> = serde_json::from_str(&attachments_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        created_at: from_millis(4, row.get(4)?)?,
        edited_at: optional_millis(5, row.get(5)?)?,
        is_deleted: row.get::<_, i32>(6)? == 1,
        attachments,
        sender: profile_from_row(row, 8)?,
    })
}

fn query_profile(conn: &Connection, user_id: &str) -> Result<Option<Profile>, StorageError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM profiles p WHERE p.id = ?1", PROFILE_COLUMNS),
            [user_id],
            |row| profile_from_row(row, 0),
        )
        .optional()?
        .flatten())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, StorageError> {
        let conn = self.lock()?;
        let (sql, user_id) = match filter {
            ConversationFilter::CreatedBy(user_id) => (
                "SELECT c.id, c.name, c.is_group, c.created_by, c.created_at, c.updated_at
                 FROM conversations c
                 WHERE c.created_by = ?1
                 ORDER BY c.updated_at DESC",
                user_id,
            ),
            ConversationFilter::ActiveParticipant(user_id) => (
                "SELECT c.id, c.name, c.is_group, c.created_by, c.created_at, c.updated_at
                 FROM conversations c
                 JOIN conversation_participants cp ON cp.conversation_id = c.id
                 WHERE cp.user_id = ?1 AND cp.is_active = 1
                 ORDER BY c.updated_at DESC",
                user_id,
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let conversations = stmt
            .query_map([user_id], conversation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conversations)
    }

    async fn list_participants(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Participant>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT cp.id, cp.conversation_id, cp.user_id, cp.is_active, cp.last_read_at, cp.joined_at, {}
             FROM conversation_participants cp
             LEFT JOIN profiles p ON p.id = cp.user_id
             WHERE cp.conversation_id = ?1
             ORDER BY cp.joined_at ASC, cp.rowid ASC",
            PROFILE_COLUMNS
        ))?;
        let participants = stmt
            .query_map([conversation_id], participant_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(participants)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        order: SortOrder,
    ) -> Result<Vec<Message>, StorageError> {
        let conn = self.lock()?;
        let direction = match order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let mut stmt = conn.prepare(&format!(
            "{} WHERE m.conversation_id = ?1 ORDER BY m.created_at {dir}, m.rowid {dir}",
            message_select(),
            dir = direction
        ))?;
        let messages = stmt
            .query_map([conversation_id], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    async fn insert_message(&self, row: NewMessage) -> Result<Message, StorageError> {
        let mut conn = self.lock()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let attachments = serde_json::to_string(&row.attachments)?;

        let tx = conn.transaction()?;
        let bumped = tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            (now_ms, &row.conversation_id),
        )?;
        if bumped == 0 {
            return Err(StorageError::NotFound {
                entity: "conversation",
                id: row.conversation_id,
            });
        }
        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, content, created_at, attachments)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                &id,
                &row.conversation_id,
                &row.sender_id,
                &row.content,
                now_ms,
                &attachments,
            ),
        )
        .map_err(map_constraint)?;
        tx.commit()?;

        let sender = query_profile(&conn, &row.sender_id)?;
        Ok(Message {
            id,
            conversation_id: row.conversation_id,
            sender_id: Some(row.sender_id),
            content: row.content,
            created_at: from_millis(0, now_ms)?,
            edited_at: None,
            is_deleted: false,
            sender,
            attachments: row.attachments,
        })
    }

    async fn insert_conversation(
        &self,
        row: NewConversation,
    ) -> Result<Conversation, StorageError> {
        let conn = self.lock()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now_ms = Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO conversations (id, name, is_group, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (&id, &row.name, row.is_group as i32, &row.created_by, now_ms, now_ms),
        )
        .map_err(map_constraint)?;
        let created = from_millis(0, now_ms)?;
        Ok(Conversation {
            id,
            name: row.name,
            is_group: row.is_group,
            created_by: row.created_by,
            created_at: created,
            updated_at: created,
            participants: Vec::new(),
            last_message: None,
            unread_count: 0,
        })
    }

    async fn insert_participants(
        &self,
        rows: &[NewParticipant],
    ) -> Result<Vec<Participant>, StorageError> {
        let mut conn = self.lock()?;
        let now_ms = Utc::now().timestamp_millis();
        let joined_at = from_millis(0, now_ms)?;

        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO conversation_participants (id, conversation_id, user_id, is_active, joined_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                (&id, &row.conversation_id, &row.user_id, now_ms),
            )
            .map_err(map_constraint)?;
            ids.push(id);
        }
        tx.commit()?;

        let mut inserted = Vec::with_capacity(rows.len());
        for (row, id) in rows.iter().zip(ids) {
            inserted.push(Participant {
                id,
                conversation_id: row.conversation_id.clone(),
                user_id: row.user_id.clone(),
                is_active: true,
                last_read_at: None,
                joined_at,
                profile: query_profile(&conn, &row.user_id)?,
            });
        }
        Ok(inserted)
    }

    async fn update_participant_last_read(
        &self,
        participant_id: &str,
        last_read_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE conversation_participants SET last_read_at = ?1 WHERE id = ?2",
            (last_read_at.timestamp_millis(), participant_id),
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound {
                entity: "participant",
                id: participant_id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [conversation_id])?;
        tx.execute(
            "DELETE FROM conversation_participants WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        let deleted = tx.execute("DELETE FROM conversations WHERE id = ?1", [conversation_id])?;
        if deleted == 0 {
            return Err(StorageError::NotFound {
                entity: "conversation",
                id: conversation_id.to_string(),
            });
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, StorageError> {
        let conn = self.lock()?;
        query_profile(&conn, user_id)
    }
}
