//! Realtime WebSocket Client
//!
//! Connects to a Supabase Realtime endpoint and implements `ChangeFeed` on
//! top of Phoenix channels. One socket is shared by every channel the
//! client joins.
//!
//! # Stream URL
//!
//! `wss://<project>.supabase.co/realtime/v1/websocket?apikey=<key>&vsn=1.0.0`
//!
//! # Protocol
//!
//! Each channel is joined with a `phx_join` carrying its `postgres_changes`
//! bindings and confirmed by a `phx_reply`. A `heartbeat` on the `phoenix`
//! topic keeps the socket alive; an unanswered heartbeat at the next tick
//! closes the connection. There is no reconnect: when the socket ends,
//! every open change stream ends with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::messages::{self, Inbound, PHOENIX_TOPIC, PhoenixMessage, ReplyOutcome};
use crate::application::ports::{
    ChangeFeed, ChangeNotification, ChangeStream, ChannelId, ChannelRequest, FeedError,
};
use crate::infrastructure::config::{Credentials, DEFAULT_CHANNEL_CAPACITY, SupabaseSettings};
use crate::infrastructure::metrics;

const OUTBOUND_CAPACITY: usize = 256;

// =============================================================================
// Error Type
// =============================================================================

/// Errors raised by the realtime client.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// Project URL has an unsupported scheme.
    #[error("invalid realtime URL: {0}")]
    InvalidUrl(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Outbound frame could not be serialized.
    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Heartbeat was not answered in time.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the realtime client.
#[derive(Debug, Clone)]
pub struct RealtimeClientConfig {
    /// WebSocket URL, including `apikey` and `vsn`.
    pub url: String,
    /// API credentials, also sent as each channel's access token.
    pub credentials: Credentials,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// How long to wait for join and leave replies.
    pub join_timeout: Duration,
    /// Buffered notifications per channel.
    pub channel_capacity: usize,
}

impl RealtimeClientConfig {
    /// Build the client configuration from the project settings.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl` if the project URL is not http(s) or ws(s).
    pub fn from_settings(
        settings: &SupabaseSettings,
        channel_capacity: usize,
    ) -> Result<Self, RealtimeError> {
        Ok(Self {
            url: websocket_url(&settings.url, settings.credentials.api_key())?,
            credentials: settings.credentials.clone(),
            heartbeat_interval: settings.heartbeat_interval,
            join_timeout: settings.join_timeout,
            channel_capacity,
        })
    }

    /// Configuration pointing straight at a WebSocket URL.
    #[must_use]
    pub fn new(url: String, credentials: Credentials) -> Self {
        Self {
            url,
            credentials,
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// URL without the query string, safe to log.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.url.split('?').next().unwrap_or_default()
    }
}

fn websocket_url(project_url: &str, api_key: &str) -> Result<String, RealtimeError> {
    let base = project_url.trim().trim_end_matches('/');
    let ws_base = if let Some(host) = base.strip_prefix("https://") {
        format!("wss://{host}")
    } else if let Some(host) = base.strip_prefix("http://") {
        format!("ws://{host}")
    } else if base.starts_with("wss://") || base.starts_with("ws://") {
        base.to_string()
    } else {
        return Err(RealtimeError::InvalidUrl(project_url.to_string()));
    };

    Ok(format!(
        "{ws_base}/realtime/v1/websocket?apikey={api_key}&vsn=1.0.0"
    ))
}

/// Phoenix topic for a channel. The id keeps repeated joins of one name apart.
fn topic_for(request: &ChannelRequest) -> String {
    format!("realtime:{}:{}", request.name, request.id)
}

// =============================================================================
// Socket State
// =============================================================================

struct JoinedChannel {
    id: ChannelId,
    name: String,
    join_ref: String,
    tx: mpsc::Sender<ChangeNotification>,
}

/// State shared between the client and its socket task.
struct SocketState {
    pending: Mutex<HashMap<String, oneshot::Sender<ReplyOutcome>>>,
    channels: Mutex<HashMap<String, JoinedChannel>>,
    connected: AtomicBool,
    next_ref: AtomicU64,
}

impl SocketState {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            next_ref: AtomicU64::new(1),
        }
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn handle_text(&self, text: &str, awaiting_heartbeat: &mut Option<String>) {
        let inbound = match messages::decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable realtime frame");
                return;
            }
        };

        match inbound {
            Inbound::Reply {
                topic,
                msg_ref,
                outcome,
            } => {
                if topic == PHOENIX_TOPIC
                    && msg_ref.is_some()
                    && msg_ref.as_deref() == awaiting_heartbeat.as_deref()
                {
                    *awaiting_heartbeat = None;
                    return;
                }
                let waiter = msg_ref.and_then(|r| self.pending.lock().remove(&r));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(outcome);
                } else {
                    tracing::trace!(%topic, "Reply without waiter");
                }
            }
            Inbound::Change {
                topic,
                notification,
            } => self.route(&topic, notification),
            Inbound::ChannelError { topic } | Inbound::ChannelClose { topic } => {
                let removed = self.channels.lock().remove(&topic);
                if let Some(channel) = removed {
                    tracing::warn!(channel = %channel.name, %topic, "Server ended channel");
                }
            }
            Inbound::Other { topic, event } => {
                tracing::trace!(%topic, %event, "Ignoring realtime event");
            }
        }
    }

    fn route(&self, topic: &str, notification: ChangeNotification) {
        let channels = self.channels.lock();
        let Some(channel) = channels.get(topic) else {
            tracing::debug!(%topic, "Change for unknown channel");
            return;
        };

        match channel.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                metrics::record_notification_dropped(&dropped.table);
                tracing::warn!(
                    channel = %channel.name,
                    table = %dropped.table,
                    "Channel buffer full, dropping notification"
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(channel = %channel.name, "Channel receiver gone");
            }
        }
    }

    fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().clear();
        self.channels.lock().clear();
    }
}

// =============================================================================
// Realtime Client
// =============================================================================

/// Supabase Realtime change feed.
pub struct RealtimeClient {
    config: RealtimeClientConfig,
    outbound: mpsc::Sender<PhoenixMessage>,
    state: Arc<SocketState>,
    cancel: CancellationToken,
}

impl RealtimeClient {
    /// Open the socket and spawn the task that drives it.
    ///
    /// # Errors
    ///
    /// Returns `RealtimeError` if the WebSocket handshake fails.
    pub async fn connect(
        config: RealtimeClientConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, RealtimeError> {
        tracing::info!(url = %config.endpoint(), "Connecting to realtime endpoint");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(config.url.as_str()).await?;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let state = Arc::new(SocketState::new());

        tokio::spawn(run_socket(
            ws_stream,
            outbound_rx,
            Arc::clone(&state),
            config.heartbeat_interval,
            cancel.clone(),
        ));

        tracing::info!(url = %config.endpoint(), "Realtime socket connected");

        Ok(Arc::new(Self {
            config,
            outbound: outbound_tx,
            state,
            cancel,
        }))
    }

    /// Whether the socket task is still running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Number of joined channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.state.channels.lock().len()
    }

    /// Close the socket. Every open change stream ends.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Send a frame and wait for its reply. `None` means the wait timed out.
    async fn call(&self, frame: PhoenixMessage) -> Result<Option<ReplyOutcome>, FeedError> {
        let msg_ref = frame.msg_ref.clone().unwrap_or_default();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.state.pending.lock().insert(msg_ref.clone(), reply_tx);

        if self.outbound.send(frame).await.is_err() {
            self.state.pending.lock().remove(&msg_ref);
            return Err(FeedError::Disconnected);
        }

        match tokio::time::timeout(self.config.join_timeout, reply_rx).await {
            Ok(Ok(outcome)) => Ok(Some(outcome)),
            Ok(Err(_)) => Err(FeedError::Disconnected),
            Err(_) => {
                self.state.pending.lock().remove(&msg_ref);
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("endpoint", &self.config.endpoint())
            .field("connected", &self.is_connected())
            .field("channels", &self.channel_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChangeFeed for RealtimeClient {
    async fn subscribe(&self, request: ChannelRequest) -> Result<ChangeStream, FeedError> {
        if !self.is_connected() {
            return Err(FeedError::Disconnected);
        }

        let topic = topic_for(&request);
        let join_ref = self.state.next_ref();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));

        {
            let mut channels = self.state.channels.lock();
            if channels.values().any(|c| c.id == request.id) {
                return Err(FeedError::ChannelExists(request.id));
            }
            // Registered before the join so no change racing the reply is lost.
            channels.insert(
                topic.clone(),
                JoinedChannel {
                    id: request.id,
                    name: request.name.clone(),
                    join_ref: join_ref.clone(),
                    tx,
                },
            );
        }

        let frame = PhoenixMessage::join(
            &topic,
            &join_ref,
            &request,
            self.config.credentials.api_key(),
        );
        tracing::debug!(channel = %request.name, %topic, "Joining channel");

        let outcome = self.call(frame).await;
        match outcome {
            Ok(Some(ReplyOutcome::Ok(_))) => {
                tracing::info!(channel = %request.name, %topic, "Channel joined");
                Ok(rx)
            }
            Ok(Some(ReplyOutcome::Error(reason))) => {
                self.state.channels.lock().remove(&topic);
                Err(FeedError::JoinRejected {
                    channel: request.name,
                    reason,
                })
            }
            Ok(None) => {
                self.state.channels.lock().remove(&topic);
                let leave = PhoenixMessage::leave(&topic, &self.state.next_ref(), &join_ref);
                let _ = self.outbound.try_send(leave);
                Err(FeedError::JoinTimeout(request.name))
            }
            Err(e) => {
                self.state.channels.lock().remove(&topic);
                Err(e)
            }
        }
    }

    async fn remove_channel(&self, id: ChannelId) -> Result<(), FeedError> {
        let removed = {
            let mut channels = self.state.channels.lock();
            let topic = channels
                .iter()
                .find(|(_, c)| c.id == id)
                .map(|(topic, _)| topic.clone());
            topic.and_then(|t| channels.remove(&t).map(|c| (t, c)))
        };
        let Some((topic, channel)) = removed else {
            return Err(FeedError::UnknownChannel(id));
        };

        let leave = PhoenixMessage::leave(&topic, &self.state.next_ref(), &channel.join_ref);
        match self.call(leave).await? {
            Some(ReplyOutcome::Ok(_)) => {
                tracing::info!(channel = %channel.name, %topic, "Channel left");
                Ok(())
            }
            Some(ReplyOutcome::Error(reason)) => Err(FeedError::Transport(format!(
                "leave of {} rejected: {reason}",
                channel.name
            ))),
            None => Err(FeedError::Transport(format!(
                "leave of {} timed out",
                channel.name
            ))),
        }
    }
}

// =============================================================================
// Socket Task
// =============================================================================

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn run_socket(
    ws_stream: Socket,
    outbound: mpsc::Receiver<PhoenixMessage>,
    state: Arc<SocketState>,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
) {
    match drive_socket(ws_stream, outbound, &state, heartbeat_interval, &cancel).await {
        Ok(()) => tracing::info!("Realtime socket closed"),
        Err(e) => tracing::warn!(error = %e, "Realtime socket ended"),
    }
    state.shutdown();
}

async fn drive_socket(
    ws_stream: Socket,
    mut outbound: mpsc::Receiver<PhoenixMessage>,
    state: &SocketState,
    heartbeat_interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), RealtimeError> {
    let (mut write, mut read) = ws_stream.split();
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );
    let mut awaiting_heartbeat: Option<String> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                };
                send_frame(&mut write, &frame).await?;
            }
            _ = heartbeat.tick() => {
                if let Some(missed) = awaiting_heartbeat.take() {
                    tracing::warn!(heartbeat_ref = %missed, "Heartbeat timeout");
                    return Err(RealtimeError::HeartbeatTimeout);
                }
                let msg_ref = state.next_ref();
                send_frame(&mut write, &PhoenixMessage::heartbeat(&msg_ref)).await?;
                awaiting_heartbeat = Some(msg_ref);
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.handle_text(&text, &mut awaiting_heartbeat);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            state.handle_text(text, &mut awaiting_heartbeat);
                        } else {
                            tracing::warn!(len = data.len(), "Received non-UTF8 binary frame");
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("Server sent close frame");
                        return Err(RealtimeError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(RealtimeError::ConnectionClosed),
                }
            }
        }
    }
}

async fn send_frame<W>(write: &mut W, frame: &PhoenixMessage) -> Result<(), RealtimeError>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = frame.to_json()?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}
