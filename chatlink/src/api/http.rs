//! [`ChatApi`] over HTTP with `reqwest`.
//!
//! Every request carries `Authorization: Bearer <token>` from the shared
//! [`TokenSource`]. A 401 answer invalidates the token so the application
//! can prompt for a new sign-in.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use chatlink_proto::conversation::{ConversationList, GroupChat, MemberChange, NewGroupChat};
use chatlink_proto::message::{
    ConversationKey, GroupId, MessageId, MessageUpdate, NewMessage, RawMessage, UserId, UserRef,
};
use chatlink_proto::notification::{Notification, UnreadCount};
use chatlink_proto::page::MessagePage;

use super::{ApiError, ChatApi};
use crate::auth::TokenSource;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A list endpoint that may or may not be paginated.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Bare(Vec<T>),
    Paged { results: Vec<T> },
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Bare(items) | Self::Paged { results: items } => items,
        }
    }
}

/// REST client for the chat service.
#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    base: Url,
    tokens: Arc<dyn TokenSource>,
}

impl fmt::Debug for HttpApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpApi")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpApi {
    /// Creates a client for the API rooted at `base` (e.g. `http://host/api/`).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Http`] if the HTTP client cannot be built.
    pub fn new(
        base: Url,
        tokens: Arc<dyn TokenSource>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base, tokens))
    }

    /// Creates a client with a pre-configured `reqwest::Client`.
    #[must_use]
    pub fn with_client(client: Client, mut base: Url, tokens: Arc<dyn TokenSource>) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            client,
            base,
            tokens,
        }
    }

    /// The API root.
    #[must_use]
    pub const fn base(&self) -> &Url {
        &self.base
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let token = self.tokens.token().ok_or(ApiError::NoCredential)?;
        let url = self.base.join(path)?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate();
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), %body, "chat API request failed");
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        Ok(self.execute(request).await?.json().await?)
    }

    async fn empty(&self, request: RequestBuilder) -> Result<(), ApiError> {
        self.execute(request).await.map(drop)
    }
}

impl ChatApi for HttpApi {
    async fn current_user(&self) -> Result<UserRef, ApiError> {
        self.json(self.request(Method::GET, "auth/profile/")?).await
    }

    async fn list_conversations(&self) -> Result<ConversationList, ApiError> {
        self.json(self.request(Method::GET, "messages/conversations/")?)
            .await
    }

    async fn get_messages(
        &self,
        key: ConversationKey,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, ApiError> {
        let request = match key {
            ConversationKey::Direct(peer) => self
                .request(Method::GET, &format!("messages/conversations/{peer}/"))?
                .query(&[("page", page), ("page_size", page_size)]),
            ConversationKey::Group(group) => self
                .request(Method::GET, "messages/group-messages/")?
                .query(&[
                    ("group_id", group.get()),
                    ("page", u64::from(page)),
                    ("page_size", u64::from(page_size)),
                ]),
        };
        self.json(request).await
    }

    async fn send_message(&self, message: &NewMessage) -> Result<RawMessage, ApiError> {
        let path = if message.group_id.is_some() {
            "messages/group-messages/"
        } else {
            "messages/messages/"
        };
        self.json(self.request(Method::POST, path)?.json(message))
            .await
    }

    async fn update_message(
        &self,
        id: MessageId,
        update: &MessageUpdate,
    ) -> Result<RawMessage, ApiError> {
        self.json(
            self.request(Method::PUT, &format!("messages/messages/{id}/"))?
                .json(update),
        )
        .await
    }

    async fn delete_message(&self, id: MessageId) -> Result<(), ApiError> {
        self.empty(self.request(Method::DELETE, &format!("messages/messages/{id}/"))?)
            .await
    }

    async fn revoke_message(&self, id: MessageId) -> Result<RawMessage, ApiError> {
        self.json(self.request(Method::PATCH, &format!("messages/messages/{id}/revoke/"))?)
            .await
    }

    async fn mark_as_read(&self, id: MessageId) -> Result<(), ApiError> {
        self.empty(self.request(Method::PATCH, &format!("messages/messages/{id}/read/"))?)
            .await
    }

    async fn list_group_chats(&self) -> Result<Vec<GroupChat>, ApiError> {
        let listing: Listing<GroupChat> = self
            .json(self.request(Method::GET, "messages/group-chats/")?)
            .await?;
        Ok(listing.into_vec())
    }

    async fn get_group_chat(&self, id: GroupId) -> Result<GroupChat, ApiError> {
        self.json(self.request(Method::GET, &format!("messages/group-chats/{id}/"))?)
            .await
    }

    async fn create_group_chat(&self, group: &NewGroupChat) -> Result<GroupChat, ApiError> {
        self.json(self.request(Method::POST, "messages/group-chats/")?.json(group))
            .await
    }

    async fn add_group_member(&self, group: GroupId, user: UserId) -> Result<(), ApiError> {
        self.empty(
            self.request(
                Method::POST,
                &format!("messages/group-chats/{group}/add_member/"),
            )?
            .json(&MemberChange { user_id: user }),
        )
        .await
    }

    async fn remove_group_member(&self, group: GroupId, user: UserId) -> Result<(), ApiError> {
        self.empty(
            self.request(
                Method::POST,
                &format!("messages/group-chats/{group}/remove_member/"),
            )?
            .json(&MemberChange { user_id: user }),
        )
        .await
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>, ApiError> {
        let listing: Listing<Notification> = self
            .json(self.request(Method::GET, "interactions/notifications/")?)
            .await?;
        Ok(listing.into_vec())
    }

    async fn mark_notification_read(&self, id: u64) -> Result<(), ApiError> {
        self.empty(self.request(
            Method::POST,
            &format!("interactions/notifications/{id}/read/"),
        )?)
        .await
    }

    async fn mark_all_notifications_read(&self) -> Result<(), ApiError> {
        self.empty(self.request(Method::POST, "interactions/notifications/read-all/")?)
            .await
    }

    async fn unread_count(&self) -> Result<u64, ApiError> {
        let count: UnreadCount = self
            .json(self.request(Method::GET, "interactions/notifications/unread-count/")?)
            .await?;
        Ok(count.count)
    }
}
