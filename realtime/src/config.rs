use std::time::Duration;

use tracing::info;

use crate::error::ConfigError;

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:9001";
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const RELAY_URL: &str = "CLASSROOM_RELAY_URL";
const RELAY_TOKEN: &str = "CLASSROOM_RELAY_TOKEN";
const SUBSCRIBE_TIMEOUT: &str = "CLASSROOM_SUBSCRIBE_TIMEOUT_SECS";
const SESSION_TIMEOUT: &str = "CLASSROOM_SESSION_TIMEOUT_SECS";
const NOTIFY_COOLDOWN: &str = "CLASSROOM_NOTIFY_COOLDOWN_SECS";
const DELIVERY: &str = "CLASSROOM_DELIVERY";
const POLL_INTERVAL: &str = "CLASSROOM_POLL_INTERVAL_SECS";
const REUSE_DIRECT: &str = "CLASSROOM_REUSE_DIRECT_CONVERSATIONS";

/// How new messages reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Row inserts and `message-insert` broadcasts on the messages channel.
    Broker,
    /// Periodically list messages from storage.
    Polling { interval: Duration },
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub relay_url: String,
    pub access_token: Option<String>,
    /// Bound on each channel subscribe.
    pub subscribe_timeout: Duration,
    /// Bound on the initial conversation load after connecting.
    pub session_timeout: Duration,
    pub notification_cooldown: Duration,
    pub delivery: DeliveryMode,
    pub reuse_direct_conversations: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            access_token: None,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            notification_cooldown: crate::notify::DEFAULT_COOLDOWN,
            delivery: DeliveryMode::Broker,
            reuse_direct_conversations: false,
        }
    }
}

impl RealtimeConfig {
    /// Read configuration from the process environment (after loading `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        // Priority: build-time env -> runtime env -> default
        let build_time_url = option_env!("CLASSROOM_RELAY_URL").map(String::from);
        let config = Self::from_lookup(|key| match key {
            RELAY_URL => build_time_url.clone().or_else(|| std::env::var(key).ok()),
            _ => std::env::var(key).ok(),
        })?;
        info!(
            url = %config.relay_url,
            delivery = ?config.delivery,
            "Loaded realtime configuration"
        );
        Ok(config)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let delivery = match lookup(DELIVERY).as_deref().map(str::trim) {
            None | Some("") | Some("broker") => DeliveryMode::Broker,
            Some("polling") => DeliveryMode::Polling {
                interval: nonzero_secs(&lookup, POLL_INTERVAL)?.unwrap_or(DEFAULT_POLL_INTERVAL),
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: DELIVERY,
                    value: other.to_string(),
                })
            }
        };

        let reuse_direct_conversations = match lookup(REUSE_DIRECT).as_deref().map(str::trim) {
            None | Some("") => defaults.reuse_direct_conversations,
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: REUSE_DIRECT,
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            relay_url: lookup(RELAY_URL)
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(defaults.relay_url),
            access_token: lookup(RELAY_TOKEN).filter(|t| !t.is_empty()),
            subscribe_timeout: secs(&lookup, SUBSCRIBE_TIMEOUT)?.unwrap_or(defaults.subscribe_timeout),
            session_timeout: secs(&lookup, SESSION_TIMEOUT)?.unwrap_or(defaults.session_timeout),
            notification_cooldown: secs(&lookup, NOTIFY_COOLDOWN)?
                .unwrap_or(defaults.notification_cooldown),
            delivery,
            reuse_direct_conversations,
        })
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|s| Some(Duration::from_secs(s)))
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

fn nonzero_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match secs(lookup, key)? {
        Some(d) if d.is_zero() => Err(ConfigError::InvalidValue {
            key,
            value: "0".to_string(),
        }),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RealtimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(config.subscribe_timeout, Duration::from_secs(15));
        assert_eq!(config.session_timeout, Duration::from_secs(20));
        assert_eq!(config.notification_cooldown, Duration::from_secs(30));
        assert_eq!(config.delivery, DeliveryMode::Broker);
        assert!(!config.reuse_direct_conversations);
    }

    #[test]
    fn test_polling_mode() {
        let config = RealtimeConfig::from_lookup(lookup(&[
            ("CLASSROOM_DELIVERY", "polling"),
            ("CLASSROOM_POLL_INTERVAL_SECS", "2"),
            ("CLASSROOM_REUSE_DIRECT_CONVERSATIONS", "true"),
        ]))
        .unwrap();
        assert_eq!(
            config.delivery,
            DeliveryMode::Polling {
                interval: Duration::from_secs(2)
            }
        );
        assert!(config.reuse_direct_conversations);
    }

    #[test]
    fn test_invalid_values() {
        let err = RealtimeConfig::from_lookup(lookup(&[("CLASSROOM_SUBSCRIBE_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == SUBSCRIBE_TIMEOUT));

        let err = RealtimeConfig::from_lookup(lookup(&[("CLASSROOM_DELIVERY", "carrier-pigeon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == DELIVERY));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let err = RealtimeConfig::from_lookup(lookup(&[
            ("CLASSROOM_DELIVERY", "polling"),
            ("CLASSROOM_POLL_INTERVAL_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == POLL_INTERVAL));

        // Ignored outside polling mode
        let config = RealtimeConfig::from_lookup(lookup(&[("CLASSROOM_POLL_INTERVAL_SECS", "0")])).unwrap();
        assert_eq!(config.delivery, DeliveryMode::Broker);
    }
}
