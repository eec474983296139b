use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;
use super::profile::Profile;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub is_active: bool,
    pub last_read_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
    pub profile: Option<Profile>,
}

impl Participant {
    pub fn display_name(&self) -> String {
        self.profile
            .as_ref()
            .map(Profile::display_name)
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub name: Option<String>,
    pub is_group: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn is_active_participant(&self, user_id: &str) -> bool {
        self.participant(user_id).is_some_and(|p| p.is_active)
    }

    /// Group name, or for direct chats the other participant's name.
    pub fn display_name(&self, self_id: &str) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        if self.is_group {
            return "Group".to_string();
        }
        self.participants
            .iter()
            .find(|p| p.user_id != self_id && p.is_active)
            .map(Participant::display_name)
            .unwrap_or_else(|| "Notes to self".to_string())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NewConversation {
    pub name: Option<String>,
    pub is_group: bool,
    pub created_by: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NewParticipant {
    pub conversation_id: String,
    pub user_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(user_id: &str, name: &str, is_active: bool) -> Participant {
        Participant {
            id: format!("p-{}", user_id),
            conversation_id: "c1".to_string(),
            user_id: user_id.to_string(),
            is_active,
            last_read_at: None,
            joined_at: Utc::now(),
            profile: Some(Profile::new(user_id, name)),
        }
    }

    fn conversation(participants: Vec<Participant>) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: "c1".to_string(),
            name: None,
            is_group: false,
            created_by: "alice".to_string(),
            created_at: now,
            updated_at: now,
            participants,
            last_message: None,
            unread_count: 0,
        }
    }

    #[test]
    fn test_direct_conversation_uses_other_participant_name() {
        let conv = conversation(vec![
            participant("alice", "Alice", true),
            participant("bob", "Bob", true),
        ]);
        assert_eq!(conv.display_name("alice"), "Bob");
        assert_eq!(conv.display_name("bob"), "Alice");
    }

    #[test]
    fn test_self_conversation_name() {
        let conv = conversation(vec![participant("alice", "Alice", true)]);
        assert_eq!(conv.display_name("alice"), "Notes to self");
    }

    #[test]
    fn test_inactive_participant_is_not_active_member() {
        let conv = conversation(vec![
            participant("alice", "Alice", true),
            participant("bob", "Bob", false),
        ]);
        assert!(conv.is_active_participant("alice"));
        assert!(!conv.is_active_participant("bob"));
        assert!(!conv.is_active_participant("carol"));
    }
}
