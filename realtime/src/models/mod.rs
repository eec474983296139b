mod conversation;
pub mod input;
mod message;
mod payload;
mod profile;

pub use conversation::{Conversation, NewConversation, NewParticipant, Participant};
pub use message::{Attachment, Message, NewMessage};
pub use payload::{MediaPayload, MessagePayload};
pub use profile::{AuthUser, Profile};
