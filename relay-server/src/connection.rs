use std::collections::HashMap;
use std::sync::Arc;

use classroom_realtime::broker::wire::{ClientFrame, ServerFrame};
use classroom_realtime::broker::{BroadcastEvent, BrokerEvent, ChannelRef, SubscribeStatus};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::state::RelayState;

const AUTH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Handle a single WebSocket connection
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (user_id, token) = match wait_for_connect(&mut ws_receiver).await {
        Some(connect) => connect,
        None => {
            warn!("Connection closed before authentication");
            return;
        }
    };

    let authorized = !user_id.trim().is_empty() && state.authorize(token.as_deref());
    let auth_response = ServerFrame::AuthResponse {
        success: authorized,
        message: if authorized {
            "Connected to relay".to_string()
        } else {
            "Authentication failed".to_string()
        },
    };
    match serde_json::to_string(&auth_response) {
        Ok(json) => {
            if let Err(e) = ws_sender.send(Message::Text(json.into())).await {
                error!(user_id = %user_id, error = %e, "Failed to send auth response");
                return;
            }
        }
        Err(e) => {
            error!(user_id = %user_id, error = %e, "Failed to serialize auth response");
            return;
        }
    }
    if !authorized {
        warn!(user_id = %user_id, "Authentication failed");
        let _ = ws_sender.close().await;
        return;
    }

    info!(user_id = %user_id, "User connected");
    state.add_client(&user_id);

    // Everything bound for this client goes through one queue
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut session = Session::new(user_id.clone(), tx);

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            res = ws_receiver.next() => {
                match res {
                    Some(Ok(Message::Text(text))) => {
                        session.handle_text(&text, &state);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(user_id = %user_id, "Client sent close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(user_id = %user_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        info!(user_id = %user_id, "WebSocket stream ended");
                        break;
                    }
                    _ => {}
                }
            }
            _ = &mut send_task => {
                info!(user_id = %user_id, "Send task finished (likely connection lost)");
                break;
            }
        }
    }

    session.close(&state);
    send_task.abort();
    state.remove_client(&user_id);
    info!(user_id = %user_id, "User disconnected");
}

/// Wait for the Connect frame from a new connection
async fn wait_for_connect(
    receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
) -> Option<(String, Option<String>)> {
    let connect = tokio::time::timeout(AUTH_TIMEOUT, async {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Text(text)) = result {
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Connect { user_id, token }) => return Some((user_id, token)),
                    Ok(_) => warn!("Frame received before connect, ignoring"),
                    Err(e) => warn!(error = %e, "Failed to parse connect frame"),
                }
            }
        }
        None
    });

    match connect.await {
        Ok(result) => result,
        Err(_) => {
            warn!("Authentication timeout");
            None
        }
    }
}

/// One authenticated client: the channels it joined on the hub and the queue
/// its frames are written to.
pub struct Session {
    user_id: String,
    /// Name from this connection's own presence, used as the sender name
    display_name: Option<String>,
    out: mpsc::UnboundedSender<String>,
    channels: HashMap<u64, ChannelRef>,
    forwarders: HashMap<u64, JoinHandle<()>>,
}

impl Session {
    pub fn new(user_id: String, out: mpsc::UnboundedSender<String>) -> Self {
        Self {
            user_id,
            display_name: None,
            out,
            channels: HashMap::new(),
            forwarders: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn handle_text(&mut self, text: &str, state: &RelayState) {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => self.handle_frame(frame, state),
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "Failed to parse frame");
                self.reply_error(None, format!("Malformed frame: {}", e));
            }
        }
    }

    /// Apply one client frame. Identity fields are overwritten with the
    /// authenticated user before anything reaches other members.
    pub fn handle_frame(&mut self, frame: ClientFrame, state: &RelayState) {
        match frame {
            ClientFrame::Connect { .. } => {
                debug!(user_id = %self.user_id, "Already authenticated, ignoring connect");
            }
            ClientFrame::Join { ref_id, mut spec } => {
                if spec.topic.trim().is_empty() {
                    self.reply(&ServerFrame::Joined {
                        ref_id,
                        channel_id: 0,
                        topic: spec.topic,
                        status: SubscribeStatus::ChannelError("Empty topic".to_string()),
                    });
                    return;
                }
                // Presence is only ever keyed by the authenticated user
                if spec.presence_key.is_some() {
                    spec.presence_key = Some(self.user_id.clone());
                }
                let (channel, events) = state.hub().join(&spec);
                // Reply before the forwarder can emit events for this channel
                self.reply(&ServerFrame::Joined {
                    ref_id,
                    channel_id: channel.id,
                    topic: channel.topic.clone(),
                    status: SubscribeStatus::Subscribed,
                });
                let forwarder = self.forward(channel.id, events);
                debug!(user_id = %self.user_id, channel_id = channel.id, topic = %channel.topic, "Joined");
                self.forwarders.insert(channel.id, forwarder);
                self.channels.insert(channel.id, channel);
            }
            ClientFrame::Leave { channel_id } => {
                if let Some(channel) = self.channels.remove(&channel_id) {
                    self.leave(&channel, state);
                } else {
                    debug!(user_id = %self.user_id, channel_id, "Leave for unknown channel");
                }
            }
            ClientFrame::Track {
                channel_id,
                mut payload,
            } => {
                let Some(channel) = self.owned(channel_id, None) else {
                    return;
                };
                payload.user_id = self.user_id.clone();
                self.display_name = payload
                    .full_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from);
                if let Err(e) = state.hub().track(&channel, payload) {
                    self.reply_error(None, e.to_string());
                }
            }
            ClientFrame::Untrack { channel_id } => {
                let Some(channel) = self.owned(channel_id, None) else {
                    return;
                };
                if let Err(e) = state.hub().untrack(&channel) {
                    self.reply_error(None, e.to_string());
                }
            }
            ClientFrame::Broadcast {
                channel_id,
                event,
                payload,
            } => {
                let Some(channel) = self.owned(channel_id, None) else {
                    return;
                };
                let decoded = match BroadcastEvent::from_wire(&event, payload) {
                    Ok(decoded) => self.stamp_sender(decoded),
                    Err(e) => {
                        warn!(user_id = %self.user_id, error = %e, "Rejected broadcast");
                        self.reply_error(None, e.to_string());
                        return;
                    }
                };
                let result = decoded
                    .to_wire()
                    .map_err(|e| e.to_string())
                    .and_then(|(name, payload)| {
                        state
                            .hub()
                            .broadcast(&channel, name, payload)
                            .map_err(|e| e.to_string())
                    });
                if let Err(e) = result {
                    error!(user_id = %self.user_id, error = %e, "Broadcast failed");
                    self.reply_error(None, e);
                }
            }
            ClientFrame::PresenceState { ref_id, channel_id } => {
                let Some(channel) = self.owned(channel_id, Some(ref_id)) else {
                    return;
                };
                match state.hub().presence_state(&channel) {
                    Ok(presence) => self.reply(&ServerFrame::PresenceState {
                        ref_id,
                        state: presence,
                    }),
                    Err(e) => self.reply_error(Some(ref_id), e.to_string()),
                }
            }
            ClientFrame::Publish { topic, event } => match event {
                BrokerEvent::Insert { .. } | BrokerEvent::Update { .. } => {
                    let delivered = state.hub().publish(&topic, event);
                    debug!(user_id = %self.user_id, topic = %topic, delivered, "Published row change");
                }
                _ => self.reply_error(None, "Only row changes can be published".to_string()),
            },
        }
    }

    /// Leave every channel this session joined.
    pub fn close(&mut self, state: &RelayState) {
        let channels: Vec<ChannelRef> = self.channels.drain().map(|(_, c)| c).collect();
        for channel in &channels {
            self.leave(channel, state);
        }
    }

    fn leave(&mut self, channel: &ChannelRef, state: &RelayState) {
        if let Some(forwarder) = self.forwarders.remove(&channel.id) {
            forwarder.abort();
        }
        if let Err(e) = state.hub().leave(channel) {
            warn!(user_id = %self.user_id, channel_id = channel.id, error = %e, "Leave failed");
        }
    }

    fn owned(&self, channel_id: u64, ref_id: Option<u64>) -> Option<ChannelRef> {
        let channel = self.channels.get(&channel_id).cloned();
        if channel.is_none() {
            warn!(user_id = %self.user_id, channel_id, "Frame for a channel this client has not joined");
            self.reply_error(ref_id, format!("Unknown channel {}", channel_id));
        }
        channel
    }

    fn stamp_sender(&self, event: BroadcastEvent) -> BroadcastEvent {
        let user_id = self.user_id.clone();
        let name = self
            .display_name
            .clone()
            .unwrap_or_else(|| self.user_id.clone());
        match event {
            BroadcastEvent::Typing(mut p) => {
                p.user_id = user_id;
                BroadcastEvent::Typing(p)
            }
            BroadcastEvent::Poke(mut p) => {
                p.from_user_id = user_id;
                p.from_name = name;
                BroadcastEvent::Poke(p)
            }
            BroadcastEvent::EmojiReaction(mut p) => {
                p.from_user_id = user_id;
                p.from_name = name;
                BroadcastEvent::EmojiReaction(p)
            }
            BroadcastEvent::MessageInsert(mut m) => {
                m.sender_id = Some(user_id);
                BroadcastEvent::MessageInsert(m)
            }
            other @ BroadcastEvent::ConversationChanged(_) => other,
        }
    }

    fn forward(
        &self,
        channel_id: u64,
        mut events: mpsc::UnboundedReceiver<BrokerEvent>,
    ) -> JoinHandle<()> {
        let out = self.out.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let json = match serde_json::to_string(&ServerFrame::Event { channel_id, event }) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(channel_id, error = %e, "Failed to serialize event");
                        continue;
                    }
                };
                if out.send(json).is_err() {
                    break;
                }
            }
        })
    }

    fn reply(&self, frame: &ServerFrame) {
        match serde_json::to_string(frame) {
            Ok(json) => {
                let _ = self.out.send(json);
            }
            Err(e) => error!(user_id = %self.user_id, error = %e, "Failed to serialize reply"),
        }
    }

    fn reply_error(&self, ref_id: Option<u64>, message: String) {
        self.reply(&ServerFrame::Error { ref_id, message });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
    }
}
