//! Composition root tying the connection, delivery, store and counter
//! together.
//!
//! [`ChatClient`] owns one of each component and wires their events:
//! inbound socket frames feed the [`ConversationStore`], and every message
//! the [`SendCoordinator`] delivers is merged into it as well. Front ends
//! talk to the client (or reach through it to a component) and never wire
//! listeners themselves.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use chatlink_proto::message::{ConversationKey, GroupId, Message, UserId, UserRef};

use crate::api::{ApiError, ChatApi};
use crate::chat::SendError;
use crate::chat::send::{SendConfig, SendCoordinator, SendEvent, SendEventKind};
use crate::chat::store::{ConversationStore, Preview, StoreConfig};
use crate::connection::{ConnectionEvent, ConnectionManager, Connector, EventKind};
use crate::events::ListenerId;
use crate::notify::NotificationAggregator;

/// A signed-in messaging session.
pub struct ChatClient<A, C: Connector> {
    connection: Arc<ConnectionManager<C>>,
    sender: SendCoordinator<A, C>,
    store: Arc<ConversationStore<A, C>>,
    notifications: Arc<NotificationAggregator<A>>,
    frame_listener: ListenerId,
    delivered_listener: ListenerId,
    receipt_worker: Mutex<Option<JoinHandle<()>>>,
}

impl<A: ChatApi, C: Connector> ChatClient<A, C> {
    /// Builds a client for user `me`.
    ///
    /// Must be called inside a Tokio runtime: the read-receipt worker is
    /// spawned here.
    #[must_use]
    pub fn new(
        api: Arc<A>,
        connection: Arc<ConnectionManager<C>>,
        me: UserRef,
        send_config: SendConfig,
        store_config: StoreConfig,
    ) -> Self {
        let notifications = Arc::new(NotificationAggregator::new(Arc::clone(&api)));
        let store = Arc::new(ConversationStore::new(
            Arc::clone(&api),
            Arc::clone(&connection),
            Arc::clone(&notifications),
            me.clone(),
            store_config,
        ));
        let sender = SendCoordinator::new(api, Arc::clone(&connection), me, send_config);

        let frame_listener = {
            let store = Arc::downgrade(&store);
            connection.on(EventKind::Message, move |event| {
                if let ConnectionEvent::Frame(frame) = event
                    && let Some(store) = store.upgrade()
                {
                    store.handle_frame(frame);
                }
            })
        };
        let delivered_listener = {
            let store = Arc::downgrade(&store);
            sender.on(SendEventKind::Delivered, move |event| {
                let SendEvent::Delivered { key, message, .. } = event;
                if let Some(store) = store.upgrade() {
                    store.apply_sent(*key, message);
                }
            })
        };
        let receipt_worker = store.spawn_receipt_worker();

        Self {
            connection,
            sender,
            store,
            notifications,
            frame_listener,
            delivered_listener,
            receipt_worker: Mutex::new(receipt_worker),
        }
    }

    /// Asks the server who the token belongs to and builds a client for
    /// that user.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the profile request.
    pub async fn for_current_user(
        api: Arc<A>,
        connection: Arc<ConnectionManager<C>>,
        send_config: SendConfig,
        store_config: StoreConfig,
    ) -> Result<Self, ApiError> {
        let me = api.current_user().await?;
        tracing::info!(user = %me.id, name = %me.label(), "signed in");
        Ok(Self::new(api, connection, me, send_config, store_config))
    }

    #[must_use]
    pub const fn connection(&self) -> &Arc<ConnectionManager<C>> {
        &self.connection
    }

    #[must_use]
    pub const fn sender(&self) -> &SendCoordinator<A, C> {
        &self.sender
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<ConversationStore<A, C>> {
        &self.store
    }

    #[must_use]
    pub const fn notifications(&self) -> &Arc<NotificationAggregator<A>> {
        &self.notifications
    }

    /// The signed-in user.
    #[must_use]
    pub fn me(&self) -> &UserRef {
        self.store.me()
    }

    /// Opens the socket. Failures are reported through connection events
    /// and retried per the reconnect policy.
    pub async fn connect(&self) {
        self.connection.connect().await;
    }

    /// Closes the socket and stops reconnecting.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Sends a text message to `peer`.
    ///
    /// # Errors
    ///
    /// See [`SendCoordinator::send`].
    pub async fn send_message(
        &self,
        peer: UserId,
        content: impl Into<String>,
    ) -> Result<Message, SendError> {
        self.sender.send_message(peer, content).await
    }

    /// Sends a text message to a group chat.
    ///
    /// # Errors
    ///
    /// See [`SendCoordinator::send`].
    pub async fn send_group_message(
        &self,
        group: GroupId,
        content: impl Into<String>,
    ) -> Result<Message, SendError> {
        self.sender.send_group_message(group, content).await
    }

    /// Loads the newest page of `key` with the configured page size and
    /// makes it the open conversation.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the history request.
    pub async fn open(&self, key: ConversationKey) -> Result<(), ApiError> {
        let page_size = self.store.config().page_size;
        self.store.fetch(key, 1, page_size).await?;
        Ok(())
    }

    /// Refreshes the conversation list and the unread counter.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the list request.
    pub async fn refresh_conversations(&self) -> Result<Vec<Preview>, ApiError> {
        self.store.fetch_conversations().await
    }

    /// Current value of the global unread counter.
    #[must_use]
    pub fn unread_count(&self) -> u64 {
        self.notifications.unread_count()
    }

    /// Receiver observing the global unread counter.
    #[must_use]
    pub fn watch_unread(&self) -> watch::Receiver<u64> {
        self.notifications.subscribe()
    }
}

impl<A, C: Connector> Drop for ChatClient<A, C> {
    fn drop(&mut self) {
        self.connection.off(EventKind::Message, self.frame_listener);
        // The sender unsubscribes itself when dropped; only our own
        // listener on it needs removing.
        self.sender
            .off(SendEventKind::Delivered, self.delivered_listener);
        if let Some(worker) = self.receipt_worker.lock().take() {
            worker.abort();
        }
    }
}
