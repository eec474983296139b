//! Polling delivery: periodically list messages from storage and feed the new
//! ones into the same inbound path the broker uses.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::broker::{BrokerEvent, Concern};
use crate::channels::EventRouter;
use crate::error::StorageError;
use crate::models::Message;
use crate::storage::{ConversationFilter, SortOrder, Storage};

/// Shortest interval `spawn` will poll at.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Newest `created_at` seen in a conversation plus the ids sharing it.
#[derive(Debug, Default)]
struct Watermark {
    at: Option<DateTime<Utc>>,
    ids: HashSet<String>,
}

impl Watermark {
    fn is_new(&self, message: &Message) -> bool {
        match self.at {
            None => true,
            Some(at) => {
                message.created_at > at || (message.created_at == at && !self.ids.contains(&message.id))
            }
        }
    }

    fn advance(&mut self, message: &Message) {
        match self.at {
            Some(at) if message.created_at < at => {}
            Some(at) if message.created_at == at => {
                self.ids.insert(message.id.clone());
            }
            _ => {
                self.at = Some(message.created_at);
                self.ids.clear();
                self.ids.insert(message.id.clone());
            }
        }
    }
}

pub struct MessagePoller {
    storage: Arc<dyn Storage>,
    user_id: String,
    marks: HashMap<String, Watermark>,
    baselined: bool,
}

impl MessagePoller {
    pub fn new(storage: Arc<dyn Storage>, user_id: impl Into<String>) -> Self {
        Self {
            storage,
            user_id: user_id.into(),
            marks: HashMap::new(),
            baselined: false,
        }
    }

    /// One pass over the user's conversations. The first pass only records
    /// where each conversation stands and returns nothing.
    pub async fn poll(&mut self) -> Result<Vec<Message>, StorageError> {
        let conversations = self
            .storage
            .list_conversations(&ConversationFilter::ActiveParticipant(self.user_id.clone()))
            .await?;

        let mut fresh = Vec::new();
        for conversation in conversations {
            let messages = self
                .storage
                .list_messages(&conversation.id, SortOrder::Ascending)
                .await?;
            let mark = self.marks.entry(conversation.id.clone()).or_default();
            for message in messages {
                if mark.is_new(&message) {
                    mark.advance(&message);
                    if self.baselined {
                        fresh.push(message);
                    }
                }
            }
        }

        if !self.baselined {
            self.baselined = true;
            debug!(user_id = %self.user_id, conversations = self.marks.len(), "Polling baseline recorded");
        }
        Ok(fresh)
    }

    /// Poll every `interval`, delivering new messages as `messages` inserts
    /// tagged with `generation`. Stops when the router's receiver is gone.
    pub fn spawn(mut self, interval: Duration, router: EventRouter, generation: u64) -> JoinHandle<()> {
        let interval = interval.max(MIN_POLL_INTERVAL);
        tokio::spawn(async move {
            info!(user_id = %self.user_id, interval_ms = interval.as_millis() as u64, "Message polling started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let messages = match self.poll().await {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(error = %e, "Message poll failed");
                        continue;
                    }
                };
                for message in messages {
                    let new = match serde_json::to_value(&message) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(message_id = %message.id, error = %e, "Failed to encode polled message");
                            continue;
                        }
                    };
                    let event = BrokerEvent::Insert {
                        table: "messages".to_string(),
                        new,
                    };
                    if !router.deliver(Concern::Messages, generation, event) {
                        debug!("Inbound queue closed, polling stopped");
                        return;
                    }
                }
            }
        })
    }
}
