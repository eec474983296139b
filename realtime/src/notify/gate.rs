use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::NotificationKind;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Per (subject, kind) cooldown for user-facing alerts.
///
/// Independent of the components that ask it, so the same gate can be shared
/// (wrap it in an `Arc`) by the presence engine and the conversation sync.
pub struct NotificationGate {
    cooldown: chrono::Duration,
    last_fired: DashMap<(String, NotificationKind), DateTime<Utc>>,
}

impl NotificationGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            last_fired: DashMap::new(),
        }
    }

    pub fn should_notify(&self, subject_id: &str, kind: NotificationKind) -> bool {
        self.should_notify_at(subject_id, kind, Utc::now())
    }

    /// Returns false, leaving state untouched, while the key is inside its
    /// cooldown. Otherwise records `now` and evicts every expired entry.
    pub fn should_notify_at(
        &self,
        subject_id: &str,
        kind: NotificationKind,
        now: DateTime<Utc>,
    ) -> bool {
        let key = (subject_id.to_string(), kind);
        if let Some(last) = self.last_fired.get(&key) {
            if now.signed_duration_since(*last) < self.cooldown {
                debug!(subject_id = %subject_id, kind = ?kind, "Notification suppressed by cooldown");
                return false;
            }
        }

        self.last_fired.insert(key, now);
        let cooldown = self.cooldown;
        self.last_fired
            .retain(|_, fired| now.signed_duration_since(*fired) < cooldown);
        true
    }

    pub fn len(&self) -> usize {
        self.last_fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_fired.is_empty()
    }

    pub fn clear(&self) {
        self.last_fired.clear();
    }
}

impl Default for NotificationGate {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_second_call_within_window_is_suppressed() {
        let gate = NotificationGate::default();
        assert!(gate.should_notify_at("bob", NotificationKind::CameOnline, at(0)));
        assert!(!gate.should_notify_at("bob", NotificationKind::CameOnline, at(10)));
    }

    #[test]
    fn test_fires_again_after_window() {
        let gate = NotificationGate::default();
        assert!(gate.should_notify_at("bob", NotificationKind::CameOnline, at(0)));
        assert!(!gate.should_notify_at("bob", NotificationKind::CameOnline, at(29)));
        assert!(gate.should_notify_at("bob", NotificationKind::CameOnline, at(30)));
    }

    #[test]
    fn test_suppressed_call_does_not_extend_window() {
        let gate = NotificationGate::default();
        assert!(gate.should_notify_at("bob", NotificationKind::Poke, at(0)));
        assert!(!gate.should_notify_at("bob", NotificationKind::Poke, at(20)));
        // Window still counts from t=0
        assert!(gate.should_notify_at("bob", NotificationKind::Poke, at(31)));
    }

    #[test]
    fn test_keys_are_independent() {
        let gate = NotificationGate::default();
        assert!(gate.should_notify_at("bob", NotificationKind::CameOnline, at(0)));
        assert!(gate.should_notify_at("bob", NotificationKind::WentOffline, at(1)));
        assert!(gate.should_notify_at("carol", NotificationKind::CameOnline, at(2)));
        assert_eq!(gate.len(), 3);
    }

    #[test]
    fn test_expired_entries_are_evicted() {
        let gate = NotificationGate::default();
        gate.should_notify_at("bob", NotificationKind::CameOnline, at(0));
        gate.should_notify_at("carol", NotificationKind::CameOnline, at(5));
        assert_eq!(gate.len(), 2);

        gate.should_notify_at("dave", NotificationKind::NewMessage, at(100));
        assert_eq!(gate.len(), 1);
    }

    #[test]
    fn test_custom_cooldown() {
        let gate = NotificationGate::new(Duration::from_secs(2));
        assert!(gate.should_notify_at("bob", NotificationKind::NewMessage, at(0)));
        assert!(!gate.should_notify_at("bob", NotificationKind::NewMessage, at(1)));
        assert!(gate.should_notify_at("bob", NotificationKind::NewMessage, at(2)));
    }
}
