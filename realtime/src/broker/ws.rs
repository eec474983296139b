use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::wire::{ClientFrame, ServerFrame};
use super::{
    Broker, BrokerEvent, ChannelRef, ChannelSpec, PresencePayload, PresenceState,
    SubscribeStatus, Subscription,
};
use crate::error::BrokerError;

/// Internal message type for the write channel
enum WriteMessage {
    Frame(ClientFrame),
    Close,
}

enum Reply {
    Joined {
        channel_id: u64,
        topic: String,
        status: SubscribeStatus,
        events: mpsc::UnboundedReceiver<BrokerEvent>,
    },
    PresenceState(PresenceState),
    Error(String),
}

type Pending = Arc<DashMap<u64, oneshot::Sender<Reply>>>;
type Channels = Arc<DashMap<u64, mpsc::UnboundedSender<BrokerEvent>>>;

/// `Broker` speaking the relay's WebSocket protocol.
///
/// There is no reconnect loop: when the socket drops, every open
/// subscription receives [`BrokerEvent::Closed`] and the owner decides
/// whether to connect again.
pub struct WsBroker {
    write_tx: mpsc::UnboundedSender<WriteMessage>,
    pending: Pending,
    channels: Channels,
    connected: Arc<AtomicBool>,
    next_ref: AtomicU64,
    request_timeout: Duration,
    io_task: JoinHandle<()>,
}

impl WsBroker {
    /// Connect to the relay and authenticate as `user_id`.
    pub async fn connect(
        url: &str,
        user_id: &str,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        info!(url = %url, "Connecting to relay");
        let (ws_stream, _) = tokio::time::timeout(request_timeout, connect_async(url))
            .await
            .map_err(|_| BrokerError::TimedOut)?
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let connect = serde_json::to_string(&ClientFrame::Connect {
            user_id: user_id.to_string(),
            token,
        })?;
        ws_write
            .send(Message::Text(connect.into()))
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        // Wait for auth response
        let auth = tokio::time::timeout(request_timeout, async {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(ServerFrame::AuthResponse { success, message }) =
                            serde_json::from_str::<ServerFrame>(&text)
                        {
                            return Ok((success, message));
                        }
                        warn!("Unexpected frame during auth");
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => return Err(BrokerError::Transport(e.to_string())),
                }
            }
            Err(BrokerError::NotConnected)
        })
        .await
        .map_err(|_| BrokerError::TimedOut)??;

        match auth {
            (true, message) => info!(user_id = %user_id, "Authenticated with relay: {}", message),
            (false, message) => {
                error!(user_id = %user_id, "Relay authentication failed: {}", message);
                return Err(BrokerError::Rejected(message));
            }
        }

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WriteMessage>();
        let pending: Pending = Arc::new(DashMap::new());
        let channels: Channels = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(true));

        let io_pending = pending.clone();
        let io_channels = channels.clone();
        let io_connected = connected.clone();
        let io_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Send outgoing frames
                    Some(msg) = write_rx.recv() => {
                        match msg {
                            WriteMessage::Frame(frame) => {
                                let json = match serde_json::to_string(&frame) {
                                    Ok(json) => json,
                                    Err(e) => {
                                        error!(error = %e, "Failed to serialize frame");
                                        continue;
                                    }
                                };
                                if ws_write.send(Message::Text(json.into())).await.is_err() {
                                    error!("Failed to send frame to relay");
                                    break;
                                }
                            }
                            WriteMessage::Close => {
                                info!("Close requested, sending close frame");
                                if let Err(e) = ws_write.send(Message::Close(None)).await {
                                    warn!(error = %e, "Failed to send close frame");
                                }
                                break;
                            }
                        }
                    }
                    // Receive frames from the relay
                    msg = ws_read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerFrame>(&text) {
                                    Ok(frame) => {
                                        if let Some(leave) = route_frame(frame, &io_pending, &io_channels) {
                                            if let Ok(json) = serde_json::to_string(&leave) {
                                                let _ = ws_write.send(Message::Text(json.into())).await;
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        let preview: String = text.chars().take(100).collect();
                                        warn!(error = %e, preview = %preview, "Unparseable frame from relay");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("Relay closed connection");
                                break;
                            }
                            Some(Err(e)) => {
                                error!(error = %e, "WebSocket error");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }

            // Cleanup
            io_connected.store(false, Ordering::SeqCst);
            for entry in io_channels.iter() {
                let _ = entry.value().send(BrokerEvent::Closed);
            }
            io_channels.clear();
            io_pending.clear();
            info!("Disconnected from relay");
        });

        Ok(Self {
            write_tx,
            pending,
            channels,
            connected,
            next_ref: AtomicU64::new(1),
            request_timeout,
            io_task,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Gracefully close the socket.
    pub fn disconnect(&self) {
        info!("Initiating graceful disconnect");
        let _ = self.write_tx.send(WriteMessage::Close);
    }

    fn send_frame(&self, frame: ClientFrame) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.write_tx
            .send(WriteMessage::Frame(frame))
            .map_err(|_| BrokerError::NotConnected)
    }

    /// Send a frame carrying a fresh ref id and wait for the matching reply.
    async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientFrame,
    ) -> Result<Option<Reply>, BrokerError> {
        let ref_id = self.next_ref.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(ref_id, tx);
        if let Err(e) = self.send_frame(build(ref_id)) {
            self.pending.remove(&ref_id);
            return Err(e);
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(BrokerError::NotConnected),
            Err(_) => {
                self.pending.remove(&ref_id);
                Ok(None)
            }
        }
    }
}

/// Dispatch one relay frame. Returns a frame to send back when a join reply
/// arrives after its requester gave up waiting or was dropped.
fn route_frame(frame: ServerFrame, pending: &Pending, channels: &Channels) -> Option<ClientFrame> {
    match frame {
        ServerFrame::Joined {
            ref_id,
            channel_id,
            topic,
            status,
        } => {
            let (tx, rx) = mpsc::unbounded_channel();
            if status.is_subscribed() {
                channels.insert(channel_id, tx);
            }
            // The waiter is gone if the request timed out or its caller was cancelled
            let delivered = match pending.remove(&ref_id) {
                Some((_, waiter)) => waiter
                    .send(Reply::Joined {
                        channel_id,
                        topic,
                        status,
                        events: rx,
                    })
                    .is_ok(),
                None => false,
            };
            if delivered {
                return None;
            }
            debug!(channel_id, "Join reply without a waiter, leaving channel");
            channels.remove(&channel_id);
            Some(ClientFrame::Leave { channel_id })
        }
        ServerFrame::Event { channel_id, event } => {
            if let Some(tx) = channels.get(&channel_id) {
                let _ = tx.send(event);
            } else {
                debug!(channel_id, "Event for unknown channel dropped");
            }
            None
        }
        ServerFrame::PresenceState { ref_id, state } => {
            if let Some((_, waiter)) = pending.remove(&ref_id) {
                let _ = waiter.send(Reply::PresenceState(state));
            }
            None
        }
        ServerFrame::Error { ref_id, message } => {
            warn!(message = %message, "Relay reported error");
            if let Some((_, waiter)) = ref_id.and_then(|id| pending.remove(&id)) {
                let _ = waiter.send(Reply::Error(message));
            }
            None
        }
        ServerFrame::AuthResponse { .. } => None,
    }
}

impl Drop for WsBroker {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}

#[async_trait]
impl Broker for WsBroker {
    async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, BrokerError> {
        let topic = spec.topic.clone();
        let reply = self
            .request(|ref_id| ClientFrame::Join { ref_id, spec })
            .await?;
        let unattached = |status| {
            let (_tx, events) = mpsc::unbounded_channel();
            Subscription {
                channel: ChannelRef {
                    id: 0,
                    topic: topic.clone(),
                },
                status,
                events,
            }
        };
        match reply {
            Some(Reply::Joined {
                channel_id,
                topic,
                status,
                events,
            }) => Ok(Subscription {
                channel: ChannelRef {
                    id: channel_id,
                    topic,
                },
                status,
                events,
            }),
            Some(Reply::Error(message)) => Ok(unattached(SubscribeStatus::ChannelError(message))),
            Some(Reply::PresenceState(_)) => Ok(unattached(SubscribeStatus::ChannelError(
                "unexpected reply".to_string(),
            ))),
            None => Ok(unattached(SubscribeStatus::TimedOut)),
        }
    }

    async fn unsubscribe(&self, channel: &ChannelRef) -> Result<(), BrokerError> {
        self.channels.remove(&channel.id);
        self.send_frame(ClientFrame::Leave {
            channel_id: channel.id,
        })
    }

    async fn track(
        &self,
        channel: &ChannelRef,
        payload: &PresencePayload,
    ) -> Result<(), BrokerError> {
        self.send_frame(ClientFrame::Track {
            channel_id: channel.id,
            payload: payload.clone(),
        })
    }

    async fn untrack(&self, channel: &ChannelRef) -> Result<(), BrokerError> {
        self.send_frame(ClientFrame::Untrack {
            channel_id: channel.id,
        })
    }

    async fn send(
        &self,
        channel: &ChannelRef,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), BrokerError> {
        self.send_frame(ClientFrame::Broadcast {
            channel_id: channel.id,
            event: event.to_string(),
            payload,
        })
    }

    async fn presence_state(&self, channel: &ChannelRef) -> Result<PresenceState, BrokerError> {
        let channel_id = channel.id;
        match self
            .request(|ref_id| ClientFrame::PresenceState { ref_id, channel_id })
            .await?
        {
            Some(Reply::PresenceState(state)) => Ok(state),
            Some(Reply::Error(message)) => Err(BrokerError::Rejected(message)),
            Some(Reply::Joined { .. }) => Err(BrokerError::Rejected("unexpected reply".to_string())),
            None => Err(BrokerError::TimedOut),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(ref_id: u64, channel_id: u64) -> ServerFrame {
        ServerFrame::Joined {
            ref_id,
            channel_id,
            topic: "typing".to_string(),
            status: SubscribeStatus::Subscribed,
        }
    }

    #[test]
    fn test_join_reply_reaches_waiter() {
        let pending: Pending = Arc::new(DashMap::new());
        let channels: Channels = Arc::new(DashMap::new());
        let (tx, mut rx) = oneshot::channel();
        pending.insert(1, tx);

        assert!(route_frame(joined(1, 7), &pending, &channels).is_none());
        assert!(matches!(rx.try_recv(), Ok(Reply::Joined { channel_id: 7, .. })));
        assert!(channels.contains_key(&7));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_join_reply_for_dropped_waiter_leaves() {
        let pending: Pending = Arc::new(DashMap::new());
        let channels: Channels = Arc::new(DashMap::new());
        let (tx, rx) = oneshot::channel();
        pending.insert(1, tx);
        // Caller cancelled before its own timeout could clean up
        drop(rx);

        let reply = route_frame(joined(1, 7), &pending, &channels);
        assert!(matches!(reply, Some(ClientFrame::Leave { channel_id: 7 })));
        assert!(channels.is_empty());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_join_reply_without_request_leaves() {
        let pending: Pending = Arc::new(DashMap::new());
        let channels: Channels = Arc::new(DashMap::new());

        let reply = route_frame(joined(9, 3), &pending, &channels);
        assert!(matches!(reply, Some(ClientFrame::Leave { channel_id: 3 })));
        assert!(channels.is_empty());
    }
}
