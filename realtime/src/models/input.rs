//! Input DTOs with garde validation for user-initiated operations.
//!
//! These structs validate caller data before anything reaches storage or the broker.

use garde::Validate;
use serde::Deserialize;

use crate::error::RealtimeError;

/// Validation constants
const MAX_ID_LENGTH: usize = 128;
const MAX_GROUP_NAME_LENGTH: usize = 100;
const MAX_GROUP_PARTICIPANTS: usize = 256;
const MAX_EMOJI_LENGTH: usize = 32;
/// Media is inlined as data URLs, so content can be large.
pub const MAX_CONTENT_LENGTH: usize = 8 * 1024 * 1024;

fn validate_not_blank(value: &str, _ctx: &()) -> garde::Result {
    if value.trim().is_empty() {
        return Err(garde::Error::new("must not be blank"));
    }
    Ok(())
}

/// Input for sending a message
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct SendMessageInput {
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub conversation_id: String,
    #[garde(length(min = 1, max = MAX_CONTENT_LENGTH), custom(validate_not_blank))]
    pub content: String,
}

/// Input for creating a group conversation
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct CreateGroupInput {
    #[garde(length(min = 1, max = MAX_GROUP_NAME_LENGTH), custom(validate_not_blank))]
    pub name: String,
    #[garde(length(min = 1, max = MAX_GROUP_PARTICIPANTS), inner(length(min = 1, max = MAX_ID_LENGTH)))]
    pub participant_ids: Vec<String>,
}

/// Input for a targeted emoji reaction
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct ReactionInput {
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub to_user_id: String,
    #[garde(length(min = 1, max = MAX_EMOJI_LENGTH), custom(validate_not_blank))]
    pub emoji: String,
}

/// Helper trait to convert garde validation errors into the crate error
pub trait ValidateExt {
    fn validate_input(&self) -> Result<(), RealtimeError>;
}

impl<T: Validate<Context = ()>> ValidateExt for T {
    fn validate_input(&self) -> Result<(), RealtimeError> {
        self.validate()
            .map_err(|e| RealtimeError::Validation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_message_rejected() {
        let input = SendMessageInput {
            conversation_id: "c1".to_string(),
            content: "   ".to_string(),
        };
        assert!(matches!(
            input.validate_input(),
            Err(RealtimeError::Validation(_))
        ));
    }

    #[test]
    fn test_group_requires_participants() {
        let input = CreateGroupInput {
            name: "Period 3 Biology".to_string(),
            participant_ids: vec![],
        };
        assert!(input.validate_input().is_err());

        let input = CreateGroupInput {
            name: "Period 3 Biology".to_string(),
            participant_ids: vec!["u1".to_string(), "u2".to_string()],
        };
        assert!(input.validate_input().is_ok());
    }

    #[test]
    fn test_reaction_requires_emoji() {
        let input = ReactionInput {
            to_user_id: "u1".to_string(),
            emoji: String::new(),
        };
        assert!(input.validate_input().is_err());
    }
}
