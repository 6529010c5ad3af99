//! REST side of the chat service.
//!
//! [`ChatApi`] is the request/response surface the client falls back to when
//! the socket is unavailable, and the only source of history, conversation
//! lists and notifications. Implementations:
//! - [`http::HttpApi`] over `reqwest`
//! - [`memory::InMemoryApi`] in-process, for tests and offline demos

pub mod http;
pub mod memory;

use std::future::Future;

use chatlink_proto::conversation::{ConversationList, GroupChat, NewGroupChat};
use chatlink_proto::message::{
    ConversationKey, GroupId, MessageId, MessageUpdate, NewMessage, RawMessage, UserId, UserRef,
};
use chatlink_proto::notification::Notification;
use chatlink_proto::page::MessagePage;

/// Errors from REST calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The token source has no token.
    #[error("no access token available")]
    NoCredential,

    /// The server rejected the token (HTTP 401).
    #[error("access token rejected")]
    Unauthorized,

    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The request could not be sent or the response could not be read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The base URL cannot address the endpoint.
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    /// The service is unreachable (used by in-process implementations).
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// The chat service's REST surface.
pub trait ChatApi: Send + Sync + 'static {
    /// The signed-in user.
    fn current_user(&self) -> impl Future<Output = Result<UserRef, ApiError>> + Send;

    /// Direct and group conversations with their previews.
    fn list_conversations(
        &self,
    ) -> impl Future<Output = Result<ConversationList, ApiError>> + Send;

    /// One page of a conversation's history. Page 1 holds the newest messages.
    fn get_messages(
        &self,
        key: ConversationKey,
        page: u32,
        page_size: u32,
    ) -> impl Future<Output = Result<MessagePage, ApiError>> + Send;

    /// Creates a message (direct or group).
    fn send_message(
        &self,
        message: &NewMessage,
    ) -> impl Future<Output = Result<RawMessage, ApiError>> + Send;

    /// Edits a message's text.
    fn update_message(
        &self,
        id: MessageId,
        update: &MessageUpdate,
    ) -> impl Future<Output = Result<RawMessage, ApiError>> + Send;

    /// Deletes a message.
    fn delete_message(&self, id: MessageId) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Revokes (unsends) a message; the server keeps a revoked stub.
    fn revoke_message(
        &self,
        id: MessageId,
    ) -> impl Future<Output = Result<RawMessage, ApiError>> + Send;

    /// Marks a received message as read.
    fn mark_as_read(&self, id: MessageId) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Group chats the user belongs to.
    fn list_group_chats(&self) -> impl Future<Output = Result<Vec<GroupChat>, ApiError>> + Send;

    /// One group chat.
    fn get_group_chat(&self, id: GroupId)
    -> impl Future<Output = Result<GroupChat, ApiError>> + Send;

    /// Creates a group chat.
    fn create_group_chat(
        &self,
        group: &NewGroupChat,
    ) -> impl Future<Output = Result<GroupChat, ApiError>> + Send;

    /// Adds a user to a group chat.
    fn add_group_member(
        &self,
        group: GroupId,
        user: UserId,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Removes a user from a group chat.
    fn remove_group_member(
        &self,
        group: GroupId,
        user: UserId,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// The user's notifications, newest first.
    fn list_notifications(
        &self,
    ) -> impl Future<Output = Result<Vec<Notification>, ApiError>> + Send;

    /// Marks one notification as read.
    fn mark_notification_read(&self, id: u64)
    -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Marks every notification as read.
    fn mark_all_notifications_read(&self) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// The server's global unread counter.
    fn unread_count(&self) -> impl Future<Output = Result<u64, ApiError>> + Send;
}
