use std::sync::Arc;

use classroom_realtime::Hub;
use dashmap::DashMap;
use tracing::info;

pub const ACCESS_TOKEN_ENV: &str = "CLASSROOM_RELAY_TOKEN";

/// Relay state shared by every connection.
pub struct RelayState {
    hub: Arc<Hub>,
    /// user_id -> number of open sockets (a user may have several tabs)
    connections: DashMap<String, usize>,
    access_token: Option<String>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub::new()),
            connections: DashMap::new(),
            access_token: None,
        }
    }

    /// Require `CLASSROOM_RELAY_TOKEN` on connect when it is set and non-empty.
    pub fn from_env() -> Self {
        let token = std::env::var(ACCESS_TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty());
        if token.is_some() {
            info!("Relay access token required");
        }
        Self::new().with_access_token(token)
    }

    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Check a token presented on connect.
    pub fn authorize(&self, token: Option<&str>) -> bool {
        match &self.access_token {
            Some(expected) => token == Some(expected.as_str()),
            None => true,
        }
    }

    pub fn add_client(&self, user_id: &str) {
        *self.connections.entry(user_id.to_string()).or_insert(0) += 1;
    }

    pub fn remove_client(&self, user_id: &str) {
        let now_empty = match self.connections.get_mut(user_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if now_empty {
            self.connections.remove_if(user_id, |_, count| *count == 0);
        }
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    pub fn connected_users(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}
