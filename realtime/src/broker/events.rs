use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RealtimeError;
use crate::models::Message;

/// Presence entry tracked on the online-users channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub role: Option<String>,
    pub online_at: DateTime<Utc>,
    pub current_page: Option<String>,
    pub status_text: String,
}

impl PresencePayload {
    pub fn display_name(&self) -> String {
        self.full_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .map(String::from)
            .unwrap_or_else(|| "Someone".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub conversation_id: String,
    pub user_id: String,
    pub user_name: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PokePayload {
    pub from_user_id: String,
    pub from_name: String,
    pub to_user_id: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub from_user_id: String,
    pub from_name: String,
    pub to_user_id: String,
    pub emoji: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationChangedPayload {
    pub conversation_id: String,
}

/// Broadcast events carried on realtime channels.
///
/// The transport only sees an event name and a JSON payload; everything is
/// decoded into one of these variants before any handler runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum BroadcastEvent {
    Typing(TypingPayload),
    Poke(PokePayload),
    EmojiReaction(ReactionPayload),
    MessageInsert(Message),
    ConversationChanged(ConversationChangedPayload),
}

impl BroadcastEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BroadcastEvent::Typing(_) => "typing",
            BroadcastEvent::Poke(_) => "poke",
            BroadcastEvent::EmojiReaction(_) => "emoji-reaction",
            BroadcastEvent::MessageInsert(_) => "message-insert",
            BroadcastEvent::ConversationChanged(_) => "conversation-changed",
        }
    }

    pub fn to_wire(&self) -> Result<(&'static str, serde_json::Value), serde_json::Error> {
        let payload = match self {
            BroadcastEvent::Typing(p) => serde_json::to_value(p)?,
            BroadcastEvent::Poke(p) => serde_json::to_value(p)?,
            BroadcastEvent::EmojiReaction(p) => serde_json::to_value(p)?,
            BroadcastEvent::MessageInsert(m) => serde_json::to_value(m)?,
            BroadcastEvent::ConversationChanged(p) => serde_json::to_value(p)?,
        };
        Ok((self.name(), payload))
    }

    /// Decode and validate a raw broadcast.
    pub fn from_wire(event: &str, payload: serde_json::Value) -> Result<Self, RealtimeError> {
        let decoded: BroadcastEvent = serde_json::from_value(serde_json::json!({
            "event": event,
            "payload": payload,
        }))
        .map_err(|e| RealtimeError::InvalidEvent(format!("{}: {}", event, e)))?;
        decoded.validate()?;
        Ok(decoded)
    }

    fn validate(&self) -> Result<(), RealtimeError> {
        let required: Vec<(&str, &str)> = match self {
            BroadcastEvent::Typing(p) => vec![
                ("conversation_id", p.conversation_id.as_str()),
                ("user_id", p.user_id.as_str()),
            ],
            BroadcastEvent::Poke(p) => vec![
                ("from_user_id", p.from_user_id.as_str()),
                ("to_user_id", p.to_user_id.as_str()),
            ],
            BroadcastEvent::EmojiReaction(p) => vec![
                ("from_user_id", p.from_user_id.as_str()),
                ("to_user_id", p.to_user_id.as_str()),
                ("emoji", p.emoji.as_str()),
            ],
            BroadcastEvent::MessageInsert(m) => vec![
                ("id", m.id.as_str()),
                ("conversation_id", m.conversation_id.as_str()),
            ],
            BroadcastEvent::ConversationChanged(p) => {
                vec![("conversation_id", p.conversation_id.as_str())]
            }
        };
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(RealtimeError::InvalidEvent(format!(
                    "{}: empty {}",
                    self.name(),
                    field
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typing_from_wire() {
        let event = BroadcastEvent::from_wire(
            "typing",
            json!({
                "conversation_id": "c1",
                "user_id": "u1",
                "user_name": "Ada",
                "is_typing": true
            }),
        )
        .unwrap();
        match event {
            BroadcastEvent::Typing(p) => {
                assert_eq!(p.conversation_id, "c1");
                assert!(p.is_typing);
            }
            other => panic!("Expected Typing, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let err = BroadcastEvent::from_wire("confetti", json!({})).unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidEvent(_)));
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        let err = BroadcastEvent::from_wire("poke", json!({ "to_user_id": 7 })).unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidEvent(_)));
    }

    #[test]
    fn test_empty_target_is_rejected() {
        let err = BroadcastEvent::from_wire(
            "emoji-reaction",
            json!({
                "from_user_id": "u1",
                "from_name": "Ada",
                "to_user_id": "",
                "emoji": "🎉",
                "sent_at": "2026-01-01T00:00:00Z"
            }),
        )
        .unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidEvent(_)));
    }

    #[test]
    fn test_to_wire_uses_kebab_case_names() {
        let event = BroadcastEvent::ConversationChanged(ConversationChangedPayload {
            conversation_id: "c9".to_string(),
        });
        let (name, payload) = event.to_wire().unwrap();
        assert_eq!(name, "conversation-changed");
        assert_eq!(payload["conversation_id"], "c9");
    }
}
