//! User-facing alerts. The engine decides *that* and *what* to show;
//! rendering belongs to whoever implements [`Notifier`].

mod gate;

pub use gate::{NotificationGate, DEFAULT_COOLDOWN};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewMessage,
    CameOnline,
    WentOffline,
    Poke,
    PokeSent,
    EmojiReaction,
    ReactionSent,
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    /// The peer the alert is about (sender, peer coming online, target of a poke).
    pub subject_id: Option<String>,
    pub title: String,
    pub body: String,
    pub conversation_id: Option<String>,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            subject_id: None,
            title: title.into(),
            body: body.into(),
            conversation_id: None,
        }
    }

    pub fn about(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Outbound UI effect. Implementations must not block and must not fail the
/// state change that produced the notification.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Forwards notifications into an mpsc channel for a UI loop (or a test) to consume.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        // Receiver gone means nobody is rendering; drop silently
        let _ = self.tx.send(notification);
    }
}

/// Writes notifications to the log. Used by headless deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        info!(
            kind = ?notification.kind,
            subject_id = ?notification.subject_id,
            conversation_id = ?notification.conversation_id,
            "{}: {}",
            notification.title,
            notification.body
        );
    }
}
