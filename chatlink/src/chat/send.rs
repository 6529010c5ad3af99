//! Outbound message delivery.
//!
//! A send goes over the socket when it is open: the frame carries a fresh
//! [`ClientRef`] and the coordinator waits for the server to echo the stored
//! message back. Without a confirmation inside the ack timeout, or when the
//! socket is not open, the message is created through the REST API instead.
//! Either way the result is normalized into a canonical [`Message`] and
//! published as a [`SendEvent::Delivered`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use chatlink_proto::frame::{ClientFrame, ServerFrame};
use chatlink_proto::message::{
    ClientRef, ConversationKey, GroupId, Message, MessageDefaults, MessageKind, NewMessage,
    RawMessage, UserId, UserRef,
};

use super::{DeliveryPath, SendError};
use crate::api::ChatApi;
use crate::connection::{ConnectionEvent, ConnectionManager, Connector, EventKind};
use crate::events::{ListenerId, ListenerRegistry};

/// Default time to wait for a socket confirmation.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Settings for the [`SendCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendConfig {
    /// How long to wait for the server to confirm a socket send.
    pub ack_timeout: Duration,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// Kinds of events published by the [`SendCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendEventKind {
    /// A message reached the server.
    Delivered,
}

/// Payload of a send event.
#[derive(Debug, Clone)]
pub enum SendEvent {
    /// A message reached the server.
    Delivered {
        /// Conversation the message belongs to.
        key: ConversationKey,
        /// The stored message, normalized.
        message: Message,
        /// Which path carried it.
        via: DeliveryPath,
    },
}

impl SendEvent {
    /// The registry key this event is published under.
    #[must_use]
    pub const fn kind(&self) -> SendEventKind {
        match self {
            Self::Delivered { .. } => SendEventKind::Delivered,
        }
    }
}

/// Correlation state of one in-flight socket send.
struct PendingSend {
    client_ref: ClientRef,
    target: ConversationKey,
    content: String,
    deadline: Instant,
    tx: oneshot::Sender<RawMessage>,
}

type PendingTable = Arc<Mutex<Vec<PendingSend>>>;

enum SocketOutcome {
    Confirmed(RawMessage, ClientRef),
    Unavailable,
    TimedOut,
}

/// Sends messages over the socket with REST fallback.
pub struct SendCoordinator<A, C: Connector> {
    api: Arc<A>,
    connection: Arc<ConnectionManager<C>>,
    me: UserRef,
    config: SendConfig,
    pending: PendingTable,
    listener: ListenerId,
    events: ListenerRegistry<SendEventKind, SendEvent>,
}

impl<A, C: Connector> SendCoordinator<A, C> {
    /// Subscribes to send events.
    pub fn on<F>(&self, kind: SendEventKind, callback: F) -> ListenerId
    where
        F: Fn(&SendEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, callback)
    }

    /// Unsubscribes a listener added with [`on`](Self::on).
    pub fn off(&self, kind: SendEventKind, id: ListenerId) -> bool {
        self.events.off(&kind, id)
    }

    /// Number of socket sends waiting for a confirmation.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl<A: ChatApi, C: Connector> SendCoordinator<A, C> {
    /// Creates a coordinator sending as `me` and subscribes it to the
    /// connection's inbound frames.
    #[must_use]
    pub fn new(
        api: Arc<A>,
        connection: Arc<ConnectionManager<C>>,
        me: UserRef,
        config: SendConfig,
    ) -> Self {
        let pending: PendingTable = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let pending = Arc::clone(&pending);
            let me = me.id;
            connection.on(EventKind::Message, move |event| {
                if let ConnectionEvent::Frame(frame) = event {
                    resolve_pending(&pending, me, frame);
                }
            })
        };
        Self {
            api,
            connection,
            me,
            config,
            pending,
            listener,
            events: ListenerRegistry::new(),
        }
    }

    /// Sends a text message to `peer`.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_message(
        &self,
        peer: UserId,
        content: impl Into<String>,
    ) -> Result<Message, SendError> {
        self.send(NewMessage::direct(peer, content)).await
    }

    /// Sends a text message to a group chat.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_group_message(
        &self,
        group: GroupId,
        content: impl Into<String>,
    ) -> Result<Message, SendError> {
        self.send(NewMessage::group(group, content)).await
    }

    /// Sends `message`, over the socket if possible and otherwise over REST.
    ///
    /// Direct messages with an attachment always go over REST; the socket
    /// frame for direct messages has no attachment fields.
    ///
    /// # Errors
    ///
    /// - [`SendError::EmptyContent`] / [`SendError::NoRecipient`] for an
    ///   invalid message; nothing is sent.
    /// - [`SendError::DeliveryTimeout`] when the socket confirmation timed
    ///   out and the REST fallback failed.
    /// - [`SendError::Undelivered`] when the socket was unavailable and the
    ///   REST fallback failed.
    pub async fn send(&self, message: NewMessage) -> Result<Message, SendError> {
        message.validate()?;
        let key = message.conversation_key().ok_or(SendError::NoRecipient)?;

        let (raw, client_ref, via) = match self.send_over_socket(&message, key).await {
            SocketOutcome::Confirmed(raw, client_ref) => (raw, Some(client_ref), DeliveryPath::Socket),
            SocketOutcome::Unavailable => {
                tracing::debug!(%key, "socket unavailable, sending over HTTP");
                let raw = self
                    .api
                    .send_message(&message)
                    .await
                    .map_err(SendError::Undelivered)?;
                (raw, None, DeliveryPath::Http)
            }
            SocketOutcome::TimedOut => {
                tracing::warn!(
                    %key,
                    timeout_ms = u64::try_from(self.config.ack_timeout.as_millis()).unwrap_or(u64::MAX),
                    "no socket confirmation, falling back to HTTP"
                );
                let raw = self
                    .api
                    .send_message(&message)
                    .await
                    .map_err(SendError::DeliveryTimeout)?;
                (raw, None, DeliveryPath::Http)
            }
        };

        let mut delivered = raw.normalize(&MessageDefaults {
            sender: self.me.clone(),
            recipient: message.recipient.map(UserRef::id_only),
            group_id: message.group_id,
            timestamp: Utc::now(),
        });
        if delivered.client_ref.is_none() {
            delivered.client_ref = client_ref;
        }

        tracing::debug!(%key, %via, id = ?delivered.id, "message delivered");
        let event = SendEvent::Delivered {
            key,
            message: delivered.clone(),
            via,
        };
        self.events.emit(&event.kind(), &event);
        Ok(delivered)
    }

    async fn send_over_socket(&self, message: &NewMessage, key: ConversationKey) -> SocketOutcome {
        if !self.connection.is_connected() {
            return SocketOutcome::Unavailable;
        }
        let client_ref = ClientRef::new();
        let frame = match key {
            ConversationKey::Direct(peer) => {
                if message.file.is_some() || message.image.is_some() {
                    return SocketOutcome::Unavailable;
                }
                ClientFrame::Message {
                    recipient_id: peer,
                    content: message.content.clone(),
                    message_type: MessageKind::Text,
                    client_ref: Some(client_ref.clone()),
                }
            }
            ConversationKey::Group(group) => ClientFrame::GroupMessage {
                group_id: group,
                content: message.content.clone(),
                file: message.file.clone(),
                image: message.image.clone(),
                client_ref: Some(client_ref.clone()),
            },
        };

        let deadline = Instant::now() + self.config.ack_timeout;
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().push(PendingSend {
            client_ref: client_ref.clone(),
            target: key,
            content: message.content.clone(),
            deadline,
            tx,
        });

        if let Err(e) = self.connection.send(&frame) {
            tracing::debug!(error = %e, "socket dispatch failed");
            self.take_pending(&client_ref);
            return SocketOutcome::Unavailable;
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(raw)) => SocketOutcome::Confirmed(raw, client_ref),
            Ok(Err(_)) => SocketOutcome::TimedOut,
            Err(_) => {
                // The confirmation may have landed between the timer firing
                // and the removal; whoever removes the entry wins.
                if self.take_pending(&client_ref).is_none()
                    && let Ok(raw) = rx.try_recv()
                {
                    return SocketOutcome::Confirmed(raw, client_ref);
                }
                SocketOutcome::TimedOut
            }
        }
    }

    fn take_pending(&self, client_ref: &ClientRef) -> Option<PendingSend> {
        let mut table = self.pending.lock();
        let index = table.iter().position(|p| &p.client_ref == client_ref)?;
        Some(table.remove(index))
    }
}

impl<A, C: Connector> Drop for SendCoordinator<A, C> {
    fn drop(&mut self) {
        self.connection.off(EventKind::Message, self.listener);
    }
}

/// Matches an inbound frame against the pending table and resolves the
/// matching send, removing it from the table.
///
/// A frame carrying a `client_ref` resolves exactly that send. A frame
/// without one resolves the oldest unexpired send with the same target and
/// content, provided the message names the current user as its sender.
fn resolve_pending(pending: &Mutex<Vec<PendingSend>>, me: UserId, frame: &ServerFrame) {
    let Some(raw) = frame.message() else {
        return;
    };
    let mut table = pending.lock();
    let index = if let Some(client_ref) = frame.client_ref() {
        table.iter().position(|p| &p.client_ref == client_ref)
    } else {
        if !raw.sender.as_ref().is_some_and(|s| s.id == me) {
            return;
        }
        let target = raw
            .group_id
            .map(ConversationKey::Group)
            .or_else(|| raw.recipient.as_ref().map(|r| ConversationKey::Direct(r.id)));
        let now = Instant::now();
        table.iter().position(|p| {
            Some(p.target) == target
                && raw.content.as_deref() == Some(p.content.as_str())
                && p.deadline > now
        })
    };

    if let Some(index) = index {
        let entry = table.remove(index);
        drop(table);
        tracing::trace!(client_ref = %entry.client_ref, "socket send confirmed");
        let _ = entry.tx.send(raw.clone());
    }
}
