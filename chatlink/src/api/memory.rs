//! In-process [`ChatApi`] that behaves like a small chat server.
//!
//! Holds messages, group chats and notifications in memory, answers
//! paginated history the way the real service does (page 1 is the newest
//! slice, returned oldest-first), and records every call so tests can
//! assert on traffic.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use chatlink_proto::conversation::{
    ConversationList, ConversationSummary, GroupChat, LastMessage, NewGroupChat,
};
use chatlink_proto::message::{
    ConversationKey, GroupId, Message, MessageDefaults, MessageId, MessageUpdate, NewMessage,
    RawMessage, UserId, UserRef,
};
use chatlink_proto::notification::Notification;
use chatlink_proto::page::{MessagePage, Pagination};

use super::{ApiError, ChatApi};

/// A request received by [`InMemoryApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    CurrentUser,
    ListConversations,
    GetMessages {
        key: ConversationKey,
        page: u32,
        page_size: u32,
    },
    SendMessage(NewMessage),
    UpdateMessage(MessageId),
    DeleteMessage(MessageId),
    RevokeMessage(MessageId),
    MarkAsRead(MessageId),
    ListGroupChats,
    GetGroupChat(GroupId),
    CreateGroupChat(NewGroupChat),
    AddGroupMember(GroupId, UserId),
    RemoveGroupMember(GroupId, UserId),
    ListNotifications,
    MarkNotificationRead(u64),
    MarkAllNotificationsRead,
    UnreadCount,
}

struct State {
    me: UserRef,
    messages: Vec<Message>,
    groups: Vec<GroupChat>,
    notifications: Vec<Notification>,
    next_id: u64,
    offline: bool,
    failing_reads: HashSet<MessageId>,
    calls: Vec<ApiCall>,
}

impl State {
    fn record(&mut self, call: ApiCall) -> Result<(), ApiError> {
        self.calls.push(call);
        if self.offline {
            return Err(ApiError::Unavailable("in-memory service offline".into()));
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> MessageId {
        self.next_id += 1;
        MessageId::new(self.next_id)
    }

    fn message_mut(&mut self, id: MessageId) -> Result<&mut Message, ApiError> {
        self.messages
            .iter_mut()
            .find(|m| m.id == Some(id))
            .ok_or_else(|| not_found("message", id))
    }

    fn group_mut(&mut self, id: GroupId) -> Result<&mut GroupChat, ApiError> {
        self.groups
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or_else(|| not_found("group chat", id))
    }

    fn in_conversation(&self, message: &Message, key: ConversationKey) -> bool {
        message.conversation_key(self.me.id) == Some(key)
    }

    fn unread_for_me(&self, message: &Message) -> bool {
        !message.is_read && message.sender.id != self.me.id
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> ApiError {
    ApiError::Status {
        status: 404,
        body: format!("{what} {id} not found"),
    }
}

/// In-memory chat service. Clones share state.
#[derive(Clone)]
pub struct InMemoryApi {
    state: Arc<Mutex<State>>,
}

impl InMemoryApi {
    /// Creates an empty service whose signed-in user is `me`.
    #[must_use]
    pub fn new(me: UserRef) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                me,
                messages: Vec::new(),
                groups: Vec::new(),
                notifications: Vec::new(),
                next_id: 0,
                offline: false,
                failing_reads: HashSet::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Stores `message`, assigning an id if it has none. Returns the stored copy.
    pub fn insert_message(&self, mut message: Message) -> Message {
        let mut state = self.state.lock();
        match message.id {
            Some(id) => state.next_id = state.next_id.max(id.get()),
            None => message.id = Some(state.allocate_id()),
        }
        state.messages.push(message.clone());
        message
    }

    /// Stores a group chat.
    pub fn insert_group(&self, group: GroupChat) {
        self.state.lock().groups.push(group);
    }

    /// Stores a notification.
    pub fn insert_notification(&self, notification: Notification) {
        self.state.lock().notifications.push(notification);
    }

    /// While offline, every call fails with [`ApiError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Makes `mark_as_read` fail for `id`.
    pub fn fail_mark_read(&self, id: MessageId) {
        self.state.lock().failing_reads.insert(id);
    }

    /// Every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count_calls(&self, predicate: impl Fn(&ApiCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    /// A stored message by id.
    #[must_use]
    pub fn message(&self, id: MessageId) -> Option<Message> {
        self.state
            .lock()
            .messages
            .iter()
            .find(|m| m.id == Some(id))
            .cloned()
    }
}

impl ChatApi for InMemoryApi {
    async fn current_user(&self) -> Result<UserRef, ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::CurrentUser)?;
        Ok(state.me.clone())
    }

    async fn list_conversations(&self) -> Result<ConversationList, ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::ListConversations)?;

        let mut private: Vec<(UserRef, Vec<&Message>)> = Vec::new();
        for message in &state.messages {
            if message.group_id.is_some() {
                continue;
            }
            let peer = if message.sender.id == state.me.id {
                match &message.recipient {
                    Some(r) => r.clone(),
                    None => continue,
                }
            } else {
                message.sender.clone()
            };
            match private.iter_mut().find(|(u, _)| u.id == peer.id) {
                Some((_, list)) => list.push(message),
                None => private.push((peer, vec![message])),
            }
        }

        let summarize = |messages: &[&Message]| -> (Option<LastMessage>, u32) {
            let last = messages.iter().max_by_key(|m| m.timestamp).map(|m| LastMessage::from(*m));
            let unread = messages.iter().filter(|m| state.unread_for_me(m)).count();
            (last, u32::try_from(unread).unwrap_or(u32::MAX))
        };

        let mut private_chats: Vec<ConversationSummary> = private
            .iter()
            .map(|(user, messages)| {
                let (last_message, unread_count) = summarize(messages.as_slice());
                ConversationSummary {
                    user: user.clone(),
                    last_message,
                    unread_count,
                }
            })
            .collect();
        private_chats.sort_by(|a, b| {
            let ts = |s: &ConversationSummary| s.last_message.as_ref().and_then(|m| m.timestamp);
            ts(b).cmp(&ts(a))
        });

        let group_chats = state
            .groups
            .iter()
            .map(|group| {
                let messages: Vec<&Message> = state
                    .messages
                    .iter()
                    .filter(|m| m.group_id == Some(group.id))
                    .collect();
                let (last_message, unread_count) = summarize(messages.as_slice());
                GroupChat {
                    last_message: last_message.or_else(|| group.last_message.clone()),
                    unread_count,
                    ..group.clone()
                }
            })
            .collect();

        Ok(ConversationList {
            private_chats,
            group_chats,
        })
    }

    async fn get_messages(
        &self,
        key: ConversationKey,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::GetMessages {
            key,
            page,
            page_size,
        })?;

        let mut thread: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| state.in_conversation(m, key))
            .collect();
        thread.sort_by_key(|m| m.timestamp);

        let total = thread.len();
        let size = page_size.max(1) as usize;
        let skip_newest = (page.max(1) as usize - 1) * size;
        let end = total.saturating_sub(skip_newest);
        let start = end.saturating_sub(size);
        let slice: Vec<RawMessage> = thread[start..end]
            .iter()
            .map(|m| RawMessage::from((*m).clone()))
            .collect();

        Ok(MessagePage::new(
            slice,
            Pagination {
                count: total as u64,
                page,
                page_size,
                has_next: start > 0,
                has_previous: page > 1,
            },
        ))
    }

    async fn send_message(&self, message: &NewMessage) -> Result<RawMessage, ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::SendMessage(message.clone()))?;
        message.validate().map_err(|e| ApiError::Status {
            status: 400,
            body: e.to_string(),
        })?;
        if let Some(group) = message.group_id {
            state.group_mut(group)?;
        }

        let id = state.allocate_id();
        let stored = RawMessage {
            id: Some(id),
            content: Some(message.content.clone()),
            file: message.file.clone(),
            image: message.image.clone(),
            ..RawMessage::default()
        }
        .normalize(&MessageDefaults {
            sender: state.me.clone(),
            recipient: message.recipient.map(UserRef::id_only),
            group_id: message.group_id,
            timestamp: Utc::now(),
        });
        state.messages.push(stored.clone());
        Ok(stored.into())
    }

    async fn update_message(
        &self,
        id: MessageId,
        update: &MessageUpdate,
    ) -> Result<RawMessage, ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::UpdateMessage(id))?;
        let message = state.message_mut(id)?;
        message.content.clone_from(&update.content);
        message.is_edited = true;
        Ok(message.clone().into())
    }

    async fn delete_message(&self, id: MessageId) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::DeleteMessage(id))?;
        state.message_mut(id)?;
        state.messages.retain(|m| m.id != Some(id));
        Ok(())
    }

    async fn revoke_message(&self, id: MessageId) -> Result<RawMessage, ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::RevokeMessage(id))?;
        let message = state.message_mut(id)?;
        message.is_revoked = true;
        message.content.clear();
        Ok(message.clone().into())
    }

    async fn mark_as_read(&self, id: MessageId) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::MarkAsRead(id))?;
        if state.failing_reads.contains(&id) {
            return Err(ApiError::Status {
                status: 500,
                body: "read receipt failed".into(),
            });
        }
        state.message_mut(id)?.is_read = true;
        Ok(())
    }

    async fn list_group_chats(&self) -> Result<Vec<GroupChat>, ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::ListGroupChats)?;
        Ok(state.groups.clone())
    }

    async fn get_group_chat(&self, id: GroupId) -> Result<GroupChat, ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::GetGroupChat(id))?;
        state.group_mut(id).map(|g| g.clone())
    }

    async fn create_group_chat(&self, group: &NewGroupChat) -> Result<GroupChat, ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::CreateGroupChat(group.clone()))?;
        let id = GroupId::new(state.groups.iter().map(|g| g.id.get()).max().unwrap_or(0) + 1);
        let mut members = vec![state.me.clone()];
        members.extend(
            group
                .members
                .iter()
                .filter(|m| **m != state.me.id)
                .map(|m| UserRef::id_only(*m)),
        );
        let created = GroupChat {
            id,
            name: group.name.clone(),
            members,
            last_message: None,
            unread_count: 0,
        };
        state.groups.push(created.clone());
        Ok(created)
    }

    async fn add_group_member(&self, group: GroupId, user: UserId) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::AddGroupMember(group, user))?;
        let chat = state.group_mut(group)?;
        if !chat.members.iter().any(|m| m.id == user) {
            chat.members.push(UserRef::id_only(user));
        }
        Ok(())
    }

    async fn remove_group_member(&self, group: GroupId, user: UserId) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::RemoveGroupMember(group, user))?;
        state.group_mut(group)?.members.retain(|m| m.id != user);
        Ok(())
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>, ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::ListNotifications)?;
        let mut notifications = state.notifications.clone();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notifications)
    }

    async fn mark_notification_read(&self, id: u64) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::MarkNotificationRead(id))?;
        let notification = state
            .notifications
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| not_found("notification", id))?;
        notification.is_read = true;
        Ok(())
    }

    async fn mark_all_notifications_read(&self) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::MarkAllNotificationsRead)?;
        for notification in &mut state.notifications {
            notification.is_read = true;
        }
        Ok(())
    }

    /// Unread messages addressed to the user plus unread notifications.
    async fn unread_count(&self) -> Result<u64, ApiError> {
        let mut state = self.state.lock();
        state.record(ApiCall::UnreadCount)?;
        let messages = state
            .messages
            .iter()
            .filter(|m| {
                state.unread_for_me(m) && (m.group_id.is_some() || m.is_addressed_to(state.me.id))
            })
            .count();
        let notifications = state.notifications.iter().filter(|n| !n.is_read).count();
        Ok((messages + notifications) as u64)
    }
}
