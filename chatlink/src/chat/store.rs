//! Conversation history, previews and read receipts.
//!
//! [`ConversationStore`] keeps one [`Conversation`] per loaded peer or
//! group, always in ascending timestamp order. Messages arrive from three
//! directions: paged history over REST, inbound socket frames, and our own
//! deliveries from the send coordinator. All of them go through the same
//! merge, keyed by message id (or client reference while the id is unknown),
//! so a message seen twice is stored once.
//!
//! Unread accounting: an inbound message from someone else bumps its
//! preview's unread count and the global counter, unless it lands in the
//! conversation the user has open. Those are queued for a read receipt
//! instead, which the receipt worker sends in the background.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chatlink_proto::conversation::{GroupChat, LastMessage, NewGroupChat};
use chatlink_proto::frame::ServerFrame;
use chatlink_proto::message::{
    ConversationKey, GroupId, Message, MessageDefaults, MessageId, MessageUpdate, RawMessage,
    UserId, UserRef,
};
use chatlink_proto::page::{DEFAULT_PAGE_SIZE, Pagination};

use crate::api::{ApiError, ChatApi};
use crate::connection::{ConnectionManager, Connector};
use crate::notify::NotificationAggregator;

/// Settings for the [`ConversationStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Messages per history page.
    pub page_size: u32,
    /// Whether messages arriving in the open conversation skip the unread
    /// counters (and get an automatic read receipt instead).
    pub suppress_open_unread: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            suppress_open_unread: true,
        }
    }
}

/// A loaded conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    /// Peer or group this history belongs to.
    pub key: ConversationKey,
    /// Ascending by timestamp.
    pub messages: Vec<Message>,
    /// Cursor of the loaded pages.
    pub pagination: Pagination,
}

/// One entry of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    /// Conversation the entry opens.
    pub key: ConversationKey,
    /// Peer label or group name.
    pub title: String,
    /// Summary of the newest message, if any.
    pub last_message: Option<LastMessage>,
    /// Messages not yet read in this conversation.
    pub unread_count: u32,
}

#[derive(Default)]
struct State {
    conversations: HashMap<ConversationKey, Conversation>,
    open: Option<ConversationKey>,
    previews: Vec<Preview>,
    groups: HashMap<GroupId, GroupChat>,
    /// Ids already accounted for by the unread counters.
    seen: HashSet<MessageId>,
}

impl State {
    fn title_for(&self, key: ConversationKey, message: &Message) -> String {
        match key {
            ConversationKey::Group(id) => self
                .groups
                .get(&id)
                .map_or_else(|| format!("group {id}"), |g| g.name.clone()),
            ConversationKey::Direct(_) => message.sender.label(),
        }
    }

    /// Moves the preview for `key` to the front with `message` as its last
    /// message, creating it if needed.
    fn touch_preview(&mut self, key: ConversationKey, message: &Message, unread: bool) {
        let existing = self.previews.iter().position(|p| p.key == key);
        let mut preview = match existing {
            Some(index) => self.previews.remove(index),
            None => Preview {
                key,
                title: self.title_for(key, message),
                last_message: None,
                unread_count: 0,
            },
        };
        preview.last_message = Some(LastMessage::from(message));
        if unread {
            preview.unread_count = preview.unread_count.saturating_add(1);
        }
        self.previews.insert(0, preview);
    }

    fn find_key(&self, id: MessageId) -> Option<ConversationKey> {
        self.conversations
            .values()
            .find(|c| c.messages.iter().any(|m| m.id == Some(id)))
            .map(|c| c.key)
    }
}

/// Inserts `message` in timestamp order, or replaces the stored message
/// with the same identity. Returns `true` if the message was new.
fn merge_message(messages: &mut Vec<Message>, mut message: Message) -> bool {
    let existing = messages.iter().position(|m| m.same_identity(&message));
    let is_new = existing.is_none();
    if let Some(index) = existing {
        let old = messages.remove(index);
        if message.client_ref.is_none() {
            message.client_ref = old.client_ref;
        }
        if message.id.is_none() {
            message.id = old.id;
        }
    }
    let at = messages.partition_point(|m| m.timestamp <= message.timestamp);
    messages.insert(at, message);
    is_new
}

/// Owner of all conversation state.
pub struct ConversationStore<A, C> {
    api: Arc<A>,
    connection: Arc<ConnectionManager<C>>,
    notifications: Arc<NotificationAggregator<A>>,
    me: UserRef,
    config: StoreConfig,
    state: Mutex<State>,
    receipts: mpsc::UnboundedSender<MessageId>,
    receipt_rx: Mutex<Option<mpsc::UnboundedReceiver<MessageId>>>,
}

impl<A: ChatApi, C: Connector> ConversationStore<A, C> {
    /// Creates an empty store for user `me`.
    #[must_use]
    pub fn new(
        api: Arc<A>,
        connection: Arc<ConnectionManager<C>>,
        notifications: Arc<NotificationAggregator<A>>,
        me: UserRef,
        config: StoreConfig,
    ) -> Self {
        let (receipts, receipt_rx) = mpsc::unbounded_channel();
        Self {
            api,
            connection,
            notifications,
            me,
            config,
            state: Mutex::new(State::default()),
            receipts,
            receipt_rx: Mutex::new(Some(receipt_rx)),
        }
    }

    /// The signed-in user.
    #[must_use]
    pub const fn me(&self) -> &UserRef {
        &self.me
    }

    /// The store's settings.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    // -- Queries ------------------------------------------------------------

    /// Snapshot of a loaded conversation.
    #[must_use]
    pub fn conversation(&self, key: ConversationKey) -> Option<Conversation> {
        self.state.lock().conversations.get(&key).cloned()
    }

    /// Snapshot of the conversation list, most recent first.
    #[must_use]
    pub fn previews(&self) -> Vec<Preview> {
        self.state.lock().previews.clone()
    }

    /// A known group chat.
    #[must_use]
    pub fn group(&self, id: GroupId) -> Option<GroupChat> {
        self.state.lock().groups.get(&id).cloned()
    }

    /// The conversation the user is looking at.
    #[must_use]
    pub fn open_conversation(&self) -> Option<ConversationKey> {
        self.state.lock().open
    }

    /// Marks `key` as the conversation the user is looking at and clears
    /// its preview's unread count.
    pub fn set_open_conversation(&self, key: ConversationKey) {
        let mut state = self.state.lock();
        state.open = Some(key);
        if let Some(preview) = state.previews.iter_mut().find(|p| p.key == key) {
            preview.unread_count = 0;
        }
    }

    /// Clears the open conversation.
    pub fn close_conversation(&self) {
        self.state.lock().open = None;
    }

    // -- History ------------------------------------------------------------

    /// Loads one page of a direct conversation. See [`fetch`](Self::fetch).
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the history request.
    pub async fn fetch_conversation(
        &self,
        peer: UserId,
        page: u32,
        page_size: u32,
    ) -> Result<Pagination, ApiError> {
        self.fetch(ConversationKey::Direct(peer), page, page_size)
            .await
    }

    /// Loads one page of a group conversation. See [`fetch`](Self::fetch).
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the history request.
    pub async fn fetch_group_conversation(
        &self,
        group: GroupId,
        page: u32,
        page_size: u32,
    ) -> Result<Pagination, ApiError> {
        self.fetch(ConversationKey::Group(group), page, page_size)
            .await
    }

    /// Loads the next older page if the server reported one.
    ///
    /// Returns `Ok(None)` without a request when there is nothing more.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the history request.
    pub async fn load_more_messages(
        &self,
        key: ConversationKey,
    ) -> Result<Option<Pagination>, ApiError> {
        let next = {
            let state = self.state.lock();
            match state.conversations.get(&key) {
                Some(c) if c.pagination.has_next => {
                    Some((c.pagination.page + 1, c.pagination.page_size))
                }
                _ => None,
            }
        };
        let Some((page, page_size)) = next else {
            tracing::debug!(%key, "no older messages to load");
            return Ok(None);
        };
        self.fetch(key, page, page_size).await.map(Some)
    }

    /// Loads page `page` of `key`'s history.
    ///
    /// Page 1 replaces the conversation, opens it, marks its unread
    /// messages addressed to the user as read (REST and socket, one at a
    /// time, failures logged), and then refreshes the global counter. Later
    /// pages are prepended, skipping messages already present.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the history request. Read-receipt and
    /// counter failures are only logged.
    pub async fn fetch(
        &self,
        key: ConversationKey,
        page: u32,
        page_size: u32,
    ) -> Result<Pagination, ApiError> {
        let response = self.api.get_messages(key, page, page_size).await?;
        let cursor = response.cursor(page, page_size);
        let defaults = self.history_defaults(key);

        let mut batch: Vec<Message> = Vec::with_capacity(response.messages.len());
        for raw in response.messages {
            merge_message(&mut batch, raw.normalize(&defaults));
        }
        tracing::debug!(%key, page, count = batch.len(), "history page loaded");

        let to_mark = {
            let mut state = self.state.lock();
            for id in batch.iter().filter_map(|m| m.id) {
                state.seen.insert(id);
            }
            if page <= 1 {
                let unread: Vec<MessageId> = batch
                    .iter()
                    .filter(|m| !m.is_read && m.is_addressed_to(self.me.id))
                    .filter_map(|m| m.id)
                    .collect();
                state.conversations.insert(
                    key,
                    Conversation {
                        key,
                        messages: batch,
                        pagination: cursor,
                    },
                );
                state.open = Some(key);
                if let Some(preview) = state.previews.iter_mut().find(|p| p.key == key) {
                    preview.unread_count = 0;
                }
                unread
            } else {
                let conversation = state.conversations.entry(key).or_insert_with(|| Conversation {
                    key,
                    messages: Vec::new(),
                    pagination: Pagination::empty(page_size),
                });
                let older: Vec<Message> = batch
                    .into_iter()
                    .filter(|m| !conversation.messages.iter().any(|e| e.same_identity(m)))
                    .collect();
                conversation.messages.splice(0..0, older);
                conversation.pagination = Pagination {
                    has_previous: true,
                    ..cursor
                };
                Vec::new()
            }
        };

        if page <= 1 {
            for id in to_mark {
                self.send_read_receipt(id).await;
            }
            self.notifications.fetch_unread_count().await;
        }
        Ok(cursor)
    }

    fn history_defaults(&self, key: ConversationKey) -> MessageDefaults {
        match key {
            ConversationKey::Direct(peer) => MessageDefaults {
                sender: UserRef::id_only(peer),
                recipient: Some(self.me.clone()),
                group_id: None,
                timestamp: Utc::now(),
            },
            ConversationKey::Group(group) => MessageDefaults {
                sender: self.me.clone(),
                recipient: None,
                group_id: Some(group),
                timestamp: Utc::now(),
            },
        }
    }

    // -- Live updates -------------------------------------------------------

    /// Applies one inbound socket frame.
    pub fn handle_frame(&self, frame: &ServerFrame) {
        match frame {
            ServerFrame::Message { message, .. } | ServerFrame::GroupMessage { message, .. } => {
                let mut raw = message.clone();
                if raw.client_ref.is_none() {
                    raw.client_ref = frame.client_ref().cloned();
                }
                self.handle_incoming_raw(raw);
            }
            ServerFrame::Read { message_id } => self.mark_read_locally(*message_id),
            ServerFrame::Pong | ServerFrame::Unknown => {}
        }
    }

    fn handle_incoming_raw(&self, raw: RawMessage) {
        // Without a sender the frame is our own echo.
        let message = raw.normalize(&MessageDefaults {
            sender: self.me.clone(),
            recipient: None,
            group_id: None,
            timestamp: Utc::now(),
        });
        self.handle_incoming_message(message);
    }

    /// Merges a message pushed by the server.
    ///
    /// Updates the loaded conversation (if any) and the preview list. A
    /// message from someone else that was not seen before counts as unread,
    /// unless it arrives in the open conversation, where it is queued for a
    /// read receipt instead. Redelivery of a known message only refreshes
    /// its stored copy.
    pub fn handle_incoming_message(&self, message: Message) {
        let Some(key) = message.conversation_key(self.me.id) else {
            tracing::debug!(id = ?message.id, "inbound message without conversation, dropped");
            return;
        };
        let own = message.sender.id == self.me.id;

        let (count, receipt) = {
            let mut state = self.state.lock();
            let mut fresh = message.id.is_none_or(|id| state.seen.insert(id));
            if let Some(conversation) = state.conversations.get_mut(&key) {
                fresh &= merge_message(&mut conversation.messages, message.clone());
            }
            if !fresh {
                tracing::trace!(%key, id = ?message.id, "redelivered message merged");
                return;
            }

            let open = state.open == Some(key);
            let suppressed = self.config.suppress_open_unread && open;
            let count = !own && !suppressed;
            state.touch_preview(key, &message, count);
            let receipt = if !own && suppressed && !message.is_read {
                message.id
            } else {
                None
            };
            (count, receipt)
        };

        if count {
            self.notifications.increment();
        }
        if let Some(id) = receipt {
            let _ = self.receipts.send(id);
        }
        tracing::debug!(%key, own, counted = count, "inbound message applied");
    }

    /// Merges a message we sent, as confirmed by the send coordinator.
    pub fn apply_sent(&self, key: ConversationKey, message: &Message) {
        let mut state = self.state.lock();
        if let Some(id) = message.id {
            state.seen.insert(id);
        }
        if let Some(conversation) = state.conversations.get_mut(&key) {
            merge_message(&mut conversation.messages, message.clone());
        }
        state.touch_preview(key, message, false);
    }

    /// Flags a message as read wherever it is stored.
    pub fn mark_read_locally(&self, id: MessageId) {
        let mut state = self.state.lock();
        for conversation in state.conversations.values_mut() {
            for message in conversation.messages.iter_mut().filter(|m| m.id == Some(id)) {
                message.is_read = true;
            }
        }
    }

    // -- Read receipts ------------------------------------------------------

    async fn send_read_receipt(&self, id: MessageId) -> bool {
        let delivered = match self.api.mark_as_read(id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(message = %id, error = %e, "failed to mark message read");
                false
            }
        };
        self.connection.mark_as_read(id);
        if delivered {
            self.mark_read_locally(id);
        }
        delivered
    }

    /// Spawns the task that sends queued read receipts. Returns `None` if
    /// the worker was already started.
    pub fn spawn_receipt_worker(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.receipt_rx.lock().take()?;
        let store = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                let Some(store) = store.upgrade() else {
                    return;
                };
                store.send_read_receipt(id).await;
            }
            tracing::debug!("read receipt worker exiting");
        }))
    }

    // -- Conversation list --------------------------------------------------

    /// Replaces the previews with the server's conversation list, then
    /// refreshes the global counter.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the list request.
    pub async fn fetch_conversations(&self) -> Result<Vec<Preview>, ApiError> {
        let list = self.api.list_conversations().await?;
        let previews = {
            let mut state = self.state.lock();
            let mut previews: Vec<Preview> = list
                .private_chats
                .into_iter()
                .map(|c| Preview {
                    key: ConversationKey::Direct(c.user.id),
                    title: c.user.label(),
                    last_message: c.last_message,
                    unread_count: c.unread_count,
                })
                .collect();
            for group in list.group_chats {
                previews.push(Preview {
                    key: ConversationKey::Group(group.id),
                    title: group.name.clone(),
                    last_message: group.last_message.clone(),
                    unread_count: group.unread_count,
                });
                state.groups.insert(group.id, group);
            }
            previews.sort_by(|a, b| {
                let ts = |p: &Preview| p.last_message.as_ref().and_then(|m| m.timestamp);
                ts(b).cmp(&ts(a))
            });
            state.previews.clone_from(&previews);
            previews
        };
        self.notifications.fetch_unread_count().await;
        Ok(previews)
    }

    // -- Groups -------------------------------------------------------------

    /// Reloads the group chats the user belongs to and renames their
    /// previews to match.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the list request.
    pub async fn fetch_group_chats(&self) -> Result<Vec<GroupChat>, ApiError> {
        let groups = self.api.list_group_chats().await?;
        let mut state = self.state.lock();
        for group in &groups {
            let key = ConversationKey::Group(group.id);
            if let Some(preview) = state.previews.iter_mut().find(|p| p.key == key) {
                preview.title.clone_from(&group.name);
            }
            state.groups.insert(group.id, group.clone());
        }
        tracing::debug!(count = groups.len(), "group chats loaded");
        Ok(groups)
    }

    /// Creates a group chat with the given members.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the create request.
    pub async fn create_group_chat(
        &self,
        name: impl Into<String>,
        members: Vec<UserId>,
    ) -> Result<GroupChat, ApiError> {
        let group = self
            .api
            .create_group_chat(&NewGroupChat {
                name: name.into(),
                members,
            })
            .await?;
        tracing::info!(group = %group.id, name = %group.name, "group chat created");
        let mut state = self.state.lock();
        state.previews.insert(
            0,
            Preview {
                key: ConversationKey::Group(group.id),
                title: group.name.clone(),
                last_message: None,
                unread_count: 0,
            },
        );
        state.groups.insert(group.id, group.clone());
        Ok(group)
    }

    /// Adds `user` to a group chat.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the request.
    pub async fn add_group_member(&self, group: GroupId, user: UserId) -> Result<(), ApiError> {
        self.api.add_group_member(group, user).await?;
        if let Some(chat) = self.state.lock().groups.get_mut(&group)
            && !chat.members.iter().any(|m| m.id == user)
        {
            chat.members.push(UserRef::id_only(user));
        }
        Ok(())
    }

    /// Removes `user` from a group chat.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the request.
    pub async fn remove_group_member(&self, group: GroupId, user: UserId) -> Result<(), ApiError> {
        self.api.remove_group_member(group, user).await?;
        if let Some(chat) = self.state.lock().groups.get_mut(&group) {
            chat.members.retain(|m| m.id != user);
        }
        Ok(())
    }

    // -- Edits --------------------------------------------------------------

    /// Replaces a message's text.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the request.
    pub async fn update_message(
        &self,
        id: MessageId,
        content: impl Into<String>,
    ) -> Result<Message, ApiError> {
        let raw = self
            .api
            .update_message(
                id,
                &MessageUpdate {
                    content: content.into(),
                },
            )
            .await?;
        Ok(self.replace_stored(id, raw))
    }

    /// Revokes a message. The server keeps a revoked placeholder.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the request.
    pub async fn revoke_message(&self, id: MessageId) -> Result<Message, ApiError> {
        let raw = self.api.revoke_message(id).await?;
        Ok(self.replace_stored(id, raw))
    }

    /// Deletes a message and removes it from every loaded conversation.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the request.
    pub async fn delete_message(&self, id: MessageId) -> Result<(), ApiError> {
        self.api.delete_message(id).await?;
        let mut state = self.state.lock();
        for conversation in state.conversations.values_mut() {
            conversation.messages.retain(|m| m.id != Some(id));
        }
        Ok(())
    }

    /// Merges the server's copy of an edited message over the stored one.
    fn replace_stored(&self, id: MessageId, raw: RawMessage) -> Message {
        let mut state = self.state.lock();
        let key = state.find_key(id);
        let stored = key
            .and_then(|k| state.conversations.get(&k))
            .and_then(|c| c.messages.iter().find(|m| m.id == Some(id)))
            .cloned();
        let defaults = stored.as_ref().map_or_else(
            || MessageDefaults {
                sender: self.me.clone(),
                recipient: None,
                group_id: None,
                timestamp: Utc::now(),
            },
            |m| MessageDefaults {
                sender: m.sender.clone(),
                recipient: m.recipient.clone(),
                group_id: m.group_id,
                timestamp: m.timestamp,
            },
        );
        let mut message = RawMessage {
            id: raw.id.or(Some(id)),
            ..raw
        }
        .normalize(&defaults);
        if let Some(stored) = stored
            && message.client_ref.is_none()
        {
            message.client_ref = stored.client_ref;
        }
        if let Some(conversation) = key.and_then(|k| state.conversations.get_mut(&k)) {
            merge_message(&mut conversation.messages, message.clone());
        }
        message
    }
}
