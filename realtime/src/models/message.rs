use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::MessagePayload;
use super::profile::Profile;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: Option<String>,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// `None` for system messages.
    pub sender_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub sender: Option<Profile>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn payload(&self) -> MessagePayload {
        MessagePayload::parse(&self.content)
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id.as_deref() == Some(user_id)
    }

    pub fn sender_name(&self) -> String {
        match (&self.sender, &self.sender_id) {
            (Some(profile), _) => profile.display_name(),
            (None, Some(_)) => "Someone".to_string(),
            (None, None) => "System".to_string(),
        }
    }
}

/// Row handed to storage when sending.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}
