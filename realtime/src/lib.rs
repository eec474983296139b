//! Realtime messaging, typing indicators and presence for the classroom app.
//!
//! [`ChannelManager`] owns one subscription group per signed-in user and feeds
//! broker events into [`ConversationSync`], [`TypingCoordinator`] and
//! [`PresenceEngine`]. Storage and the pub/sub transport sit behind the
//! [`Storage`] and [`Broker`] traits.

pub mod broker;
pub mod channels;
pub mod config;
pub mod conversations;
pub mod error;
pub mod logging;
pub mod models;
pub mod notify;
pub mod poller;
pub mod presence;
pub mod storage;
pub mod typing;

pub use broker::{Broker, Hub, LocalBroker, WsBroker};
pub use channels::{ChannelManager, ConnectionState, EventRouter, Inbound};
pub use config::{DeliveryMode, RealtimeConfig};
pub use conversations::{ConversationSync, MessageCache};
pub use error::{RealtimeError, Result};
pub use notify::{ChannelNotifier, Notification, NotificationGate, NotificationKind, Notifier, TracingNotifier};
pub use presence::{DirectEvent, PresenceEngine};
pub use storage::{SqliteStorage, Storage};
pub use typing::TypingCoordinator;
