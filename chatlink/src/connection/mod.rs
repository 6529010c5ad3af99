//! Persistent chat socket with heartbeat and bounded reconnection.
//!
//! [`ConnectionManager`] owns at most one live socket. It moves through
//! `Disconnected → Connecting → Connected`, and on an abnormal close to
//! `Reconnecting`, retrying with a fixed backoff until the attempt budget is
//! spent. Lifecycle changes and inbound frames are published through a
//! [`ListenerRegistry`] keyed by [`EventKind`].
//!
//! The actual socket is opened by a [`Connector`]:
//! - [`websocket::WsConnector`] over `tokio-tungstenite`
//! - [`loopback::LoopbackConnector`] in-process, for tests
//!
//! Every connection attempt gets a generation number. The heartbeat, reader
//! and reconnect tasks capture the generation they were started for and do
//! nothing once it is stale, so a task that loses a race with `disconnect()`
//! or a newer attempt cannot act on the wrong socket.

pub mod loopback;
pub mod websocket;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

use chatlink_proto::codec;
use chatlink_proto::frame::{ClientFrame, ServerFrame};
use chatlink_proto::message::MessageId;

use crate::auth::TokenSource;
use crate::events::{ListenerId, ListenerRegistry};

/// Close code for a normal, client- or server-initiated shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Default number of reconnect attempts after an abnormal close.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay before each reconnect attempt.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);

/// Default interval between heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);

/// Default time allowed for opening the socket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of the chat socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket and no reconnect pending.
    Disconnected,
    /// A socket is being opened.
    Connecting,
    /// The socket is open.
    Connected,
    /// Waiting for the backoff before the next attempt.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Errors produced by the connection layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The token source has no token.
    #[error("no access token available")]
    NoCredential,

    /// The socket is not open.
    #[error("chat socket is not connected")]
    NotConnected,

    /// The socket failed to open or reported an error.
    #[error("chat socket transport error: {0}")]
    Transport(String),

    /// Opening the socket took longer than the connect timeout.
    #[error("chat socket connect timed out")]
    Timeout,

    /// Every reconnect attempt failed; no further attempts will be made.
    #[error("gave up reconnecting after {attempts} attempts")]
    MaxReconnectExceeded {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// An outbound frame could not be encoded.
    #[error("frame encode error: {0}")]
    Encode(String),
}

/// Kinds of events published by the [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The socket opened.
    Connected,
    /// The socket closed.
    Disconnected,
    /// A transport or lifecycle error.
    Error,
    /// A decoded inbound frame.
    Message,
}

/// Payload of a connection event.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The socket opened.
    Connected,
    /// The socket closed with the given code (`None` when the transport
    /// dropped without a close frame).
    Disconnected {
        /// WebSocket close code.
        code: Option<u16>,
    },
    /// A transport or lifecycle error.
    Error(ConnectionError),
    /// A decoded inbound frame.
    Frame(ServerFrame),
}

impl ConnectionEvent {
    /// The registry key this event is published under.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Error(_) => EventKind::Error,
            Self::Frame(_) => EventKind::Message,
        }
    }
}

/// Commands from the manager to an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Send a text frame.
    Text(String),
    /// Close the socket with the given code.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// Events from an open socket to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text frame arrived.
    Text(String),
    /// The transport reported an error. A `Closed` event follows if the
    /// socket did not survive it.
    Error(String),
    /// The socket closed. Nothing follows.
    Closed {
        /// WebSocket close code, if a close frame was received.
        code: Option<u16>,
    },
}

/// Channel pair for one open socket.
#[derive(Debug)]
pub struct Link {
    /// Commands to the socket.
    pub outbound: mpsc::UnboundedSender<LinkCommand>,
    /// Events from the socket.
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens sockets for the [`ConnectionManager`].
pub trait Connector: Send + Sync + 'static {
    /// Opens a socket to `url`.
    ///
    /// Resolves once the socket is open and able to carry frames.
    fn open(&self, url: &Url) -> impl Future<Output = Result<Link, ConnectionError>> + Send;
}

/// Settings for the [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Socket endpoint, e.g. `ws://localhost:8000/ws/chat/`. The token is
    /// appended as a query parameter on each attempt.
    pub url: Url,
    /// Reconnect attempts after an abnormal close before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay before each reconnect attempt.
    pub reconnect_interval: Duration,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Time allowed for opening the socket.
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// Creates a config for `url` with default timings.
    #[must_use]
    pub const fn new(url: Url) -> Self {
        Self {
            url,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

struct Inner {
    state: ConnectionState,
    attempts: u32,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<LinkCommand>>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Inner {
    fn stop_tasks(&mut self) {
        for handle in [
            self.reader.take(),
            self.heartbeat.take(),
            self.reconnect.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// Owner of the chat socket.
///
/// Always held in an [`Arc`]; background tasks keep only weak references.
pub struct ConnectionManager<C> {
    connector: C,
    tokens: Arc<dyn TokenSource>,
    config: ConnectionConfig,
    events: ListenerRegistry<EventKind, ConnectionEvent>,
    inner: Mutex<Inner>,
}

impl<C> fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionManager")
            .field("url", &self.config.url.as_str())
            .field("state", &inner.state)
            .field("attempts", &inner.attempts)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates a disconnected manager.
    #[must_use]
    pub fn new(connector: C, tokens: Arc<dyn TokenSource>, config: ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            connector,
            tokens,
            config,
            events: ListenerRegistry::new(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                attempts: 0,
                generation: 0,
                outbound: None,
                reader: None,
                heartbeat: None,
                reconnect: None,
            }),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether the socket is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnect attempts made since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    /// The manager's settings.
    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Subscribes to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, callback)
    }

    /// Unsubscribes a listener added with [`on`](Self::on).
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.events.off(&kind, id)
    }

    fn emit(&self, event: &ConnectionEvent) {
        self.events.emit(&event.kind(), event);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    /// Opens the socket.
    ///
    /// Does nothing while already connecting or connected. Without a token,
    /// publishes [`ConnectionError::NoCredential`] and stays disconnected.
    /// A failed open is handled like an abnormal close: an error event, a
    /// `Disconnected` event, then the reconnect policy.
    pub async fn connect(self: &Arc<Self>) {
        let (generation, token) = {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    tracing::debug!(state = %inner.state, "connect ignored");
                    return;
                }
                ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
            }
            let Some(token) = self.tokens.token() else {
                if inner.state == ConnectionState::Reconnecting {
                    inner.state = ConnectionState::Disconnected;
                }
                drop(inner);
                tracing::warn!("no access token, chat socket stays disconnected");
                self.emit(&ConnectionEvent::Error(ConnectionError::NoCredential));
                return;
            };
            if let Some(pending) = inner.reconnect.take() {
                pending.abort();
            }
            inner.state = ConnectionState::Connecting;
            inner.generation += 1;
            (inner.generation, token)
        };

        let url = endpoint_with_token(&self.config.url, &token);
        tracing::debug!(url = %self.config.url, generation, "opening chat socket");

        let link = match tokio::time::timeout(self.config.connect_timeout, self.connector.open(&url))
            .await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                self.fail_open(generation, e);
                return;
            }
            Err(_) => {
                self.fail_open(generation, ConnectionError::Timeout);
                return;
            }
        };

        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                tracing::debug!(generation, "socket opened after disconnect, closing it");
                let _ = link.outbound.send(LinkCommand::Close {
                    code: NORMAL_CLOSURE,
                    reason: "superseded".into(),
                });
                return;
            }
            inner.state = ConnectionState::Connected;
            inner.attempts = 0;
            inner.outbound = Some(link.outbound.clone());
        }

        tracing::info!(url = %self.config.url, "chat socket connected");
        self.emit(&ConnectionEvent::Connected);

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.reader = Some(tokio::spawn(read_loop(
            Arc::downgrade(self),
            generation,
            link.inbound,
        )));
        inner.heartbeat = Some(self.spawn_heartbeat(generation, link.outbound));
    }

    /// Closes the socket with code 1000 and cancels any pending reconnect.
    pub fn disconnect(&self) {
        let outbound = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.stop_tasks();
            inner.attempts = 0;
            inner.state = ConnectionState::Disconnected;
            inner.outbound.take()
        };
        if let Some(outbound) = outbound {
            let _ = outbound.send(LinkCommand::Close {
                code: NORMAL_CLOSURE,
                reason: "client disconnect".into(),
            });
        }
        tracing::info!("chat socket disconnected by client");
        self.emit(&ConnectionEvent::Disconnected {
            code: Some(NORMAL_CLOSURE),
        });
    }

    /// Sends `frame` over the open socket.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] unless the socket is open,
    /// and [`ConnectionError::Encode`] if the frame cannot be serialized.
    pub fn send(&self, frame: &ClientFrame) -> Result<(), ConnectionError> {
        let outbound = {
            let inner = self.inner.lock();
            if inner.state != ConnectionState::Connected {
                return Err(ConnectionError::NotConnected);
            }
            inner.outbound.clone().ok_or(ConnectionError::NotConnected)?
        };
        let text = codec::encode(frame).map_err(|e| ConnectionError::Encode(e.to_string()))?;
        outbound
            .send(LinkCommand::Text(text))
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Tells the server that `message_id` was read. Best effort: failures
    /// are logged and otherwise ignored.
    pub fn mark_as_read(&self, message_id: MessageId) {
        if let Err(e) = self.send(&ClientFrame::Read { message_id }) {
            tracing::debug!(%message_id, error = %e, "socket read receipt not sent");
        }
    }

    fn fail_open(self: &Arc<Self>, generation: u64, error: ConnectionError) {
        tracing::warn!(url = %self.config.url, error = %error, "chat socket open failed");
        self.emit(&ConnectionEvent::Error(error));
        self.handle_close(generation, None);
    }

    fn handle_close(self: &Arc<Self>, generation: u64, code: Option<u16>) {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.outbound = None;
            if let Some(heartbeat) = inner.heartbeat.take() {
                heartbeat.abort();
            }
            // May be the calling task; dropping the handle detaches it.
            inner.reader = None;
        }

        tracing::info!(?code, "chat socket closed");
        self.emit(&ConnectionEvent::Disconnected { code });
        if code == Some(NORMAL_CLOSURE) {
            return;
        }

        let exhausted = {
            let mut inner = self.inner.lock();
            // A listener may have reconnected or disconnected meanwhile.
            if inner.generation != generation || inner.state != ConnectionState::Disconnected {
                return;
            }
            if inner.attempts >= self.config.max_reconnect_attempts {
                Some(inner.attempts)
            } else {
                inner.attempts += 1;
                inner.state = ConnectionState::Reconnecting;
                let attempt = inner.attempts;
                inner.reconnect = Some(self.spawn_reconnect(generation, attempt));
                None
            }
        };

        if let Some(attempts) = exhausted {
            tracing::error!(attempts, "chat socket reconnect attempts exhausted");
            self.emit(&ConnectionEvent::Error(
                ConnectionError::MaxReconnectExceeded { attempts },
            ));
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, generation: u64, attempt: u32) -> JoinHandle<()> {
        let delay = self.config.reconnect_interval;
        tracing::info!(
            attempt,
            max = self.config.max_reconnect_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling chat socket reconnect"
        );
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            {
                let mut inner = manager.inner.lock();
                if inner.generation != generation || inner.state != ConnectionState::Reconnecting {
                    return;
                }
                // Detach our own handle so connect() does not abort us.
                inner.reconnect = None;
            }
            manager.connect().await;
        })
    }

    fn spawn_heartbeat(
        &self,
        generation: u64,
        outbound: mpsc::UnboundedSender<LinkCommand>,
    ) -> JoinHandle<()> {
        let period = self.config.heartbeat_interval;
        let ping = codec::encode(&ClientFrame::Ping);
        tokio::spawn(async move {
            let ping = match ping {
                Ok(ping) => ping,
                Err(e) => {
                    tracing::error!(error = %e, "cannot encode heartbeat");
                    return;
                }
            };
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if outbound.send(LinkCommand::Text(ping.clone())).is_err() {
                    tracing::debug!(generation, "heartbeat stopped, socket gone");
                    return;
                }
                tracing::trace!(generation, "heartbeat sent");
            }
        })
    }
}

impl<C> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.stop_tasks();
        if let Some(outbound) = inner.outbound.take() {
            let _ = outbound.send(LinkCommand::Close {
                code: NORMAL_CLOSURE,
                reason: "client shutdown".into(),
            });
        }
    }
}

/// Background task draining one socket's inbound events.
///
/// Frames that fail to decode are logged and skipped. The loop ends on a
/// close event or when the socket's channel ends (treated as an abnormal
/// close).
async fn read_loop<C: Connector>(
    manager: Weak<ConnectionManager<C>>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
) {
    let mut close_code = None;
    while let Some(event) = inbound.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        if !manager.is_current(generation) {
            return;
        }
        match event {
            LinkEvent::Text(text) => match codec::decode::<ServerFrame>(&text) {
                Ok(ServerFrame::Pong) => tracing::trace!("heartbeat answered"),
                Ok(ServerFrame::Unknown) => {
                    tracing::debug!(frame = %text, "ignoring unknown frame type");
                }
                Ok(frame) => manager.emit(&ConnectionEvent::Frame(frame)),
                Err(e) => tracing::warn!(error = %e, "malformed chat frame, skipping"),
            },
            LinkEvent::Error(reason) => {
                tracing::warn!(%reason, "chat socket error");
                manager.emit(&ConnectionEvent::Error(ConnectionError::Transport(reason)));
            }
            LinkEvent::Closed { code } => {
                close_code = code;
                break;
            }
        }
    }
    if let Some(manager) = manager.upgrade() {
        manager.handle_close(generation, close_code);
    }
}

fn endpoint_with_token(base: &Url, token: &str) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut().append_pair("token", token);
    url
}
