use serde::{Deserialize, Serialize};

use super::{BrokerEvent, ChannelSpec, PresencePayload, PresenceState, SubscribeStatus};

/// Frames a client sends to the relay (shared between relay and `WsBroker`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "connect")]
    Connect {
        user_id: String,
        token: Option<String>,
    },
    #[serde(rename = "join")]
    Join { ref_id: u64, spec: ChannelSpec },
    #[serde(rename = "leave")]
    Leave { channel_id: u64 },
    #[serde(rename = "track")]
    Track {
        channel_id: u64,
        payload: PresencePayload,
    },
    #[serde(rename = "untrack")]
    Untrack { channel_id: u64 },
    #[serde(rename = "broadcast")]
    Broadcast {
        channel_id: u64,
        event: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "presence_state")]
    PresenceState { ref_id: u64, channel_id: u64 },
    /// Row change injected by a storage-side forwarder.
    #[serde(rename = "publish")]
    Publish { topic: String, event: BrokerEvent },
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "auth_response")]
    AuthResponse { success: bool, message: String },
    #[serde(rename = "joined")]
    Joined {
        ref_id: u64,
        channel_id: u64,
        topic: String,
        status: SubscribeStatus,
    },
    #[serde(rename = "event")]
    Event { channel_id: u64, event: BrokerEvent },
    #[serde(rename = "presence_state")]
    PresenceState { ref_id: u64, state: PresenceState },
    #[serde(rename = "error")]
    Error {
        ref_id: Option<u64>,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_frame_serialization() {
        let frame = ClientFrame::Connect {
            user_id: "user123".to_string(),
            token: None,
        };

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"connect\""));
        assert!(json.contains("\"user_id\":\"user123\""));
    }

    #[test]
    fn test_join_frame_from_client_format() {
        let json = r#"{"type":"join","ref_id":7,"spec":{"topic":"typing","presence_key":null,"receive_own_broadcasts":false}}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        if let ClientFrame::Join { ref_id, spec } = frame {
            assert_eq!(ref_id, 7);
            assert_eq!(spec.topic, "typing");
        } else {
            panic!("Expected Join");
        }
    }

    #[test]
    fn test_event_frame_nests_broker_event() {
        let frame = ServerFrame::Event {
            channel_id: 3,
            event: BrokerEvent::Broadcast {
                event: "poke".to_string(),
                payload: json!({"to_user_id": "u2"}),
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["type"], "broadcast");
        assert_eq!(json["event"]["event"], "poke");

        let parsed: ServerFrame = serde_json::from_value(json).unwrap();
        assert!(matches!(parsed, ServerFrame::Event { channel_id: 3, .. }));
    }

    #[test]
    fn test_joined_frame_carries_status() {
        let frame = ServerFrame::Joined {
            ref_id: 1,
            channel_id: 9,
            topic: "messages".to_string(),
            status: SubscribeStatus::ChannelError("denied".to_string()),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["status"]["status"], "channel_error");
        assert_eq!(json["status"]["reason"], "denied");
    }
}
