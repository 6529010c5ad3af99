//! Message types shared by the socket frames and the REST API.
//!
//! The server is lenient about which fields it fills in: a socket
//! confirmation may omit the sender, an HTTP create response may omit the
//! timestamp, and recipients arrive either as a nested user object or as a
//! bare id. [`RawMessage`] mirrors that wire shape with every field
//! optional; [`RawMessage::normalize`] turns it into the canonical
//! [`Message`] the client stores.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw server-assigned id.
            #[must_use]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Returns the raw id value.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Server-assigned user identifier.
    UserId
);
numeric_id!(
    /// Server-assigned group chat identifier.
    GroupId
);
numeric_id!(
    /// Server-assigned message identifier. Absent until the server has
    /// persisted the message.
    MessageId
);

/// Client-generated reference attached to an outbound frame so that the
/// server's confirmation can be matched to the send that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientRef(Uuid);

impl ClientRef {
    /// Creates a new time-ordered reference (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ClientRef` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ClientRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user as embedded in messages and conversation lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRef {
    /// The user's id.
    pub id: UserId,
    /// Display name, when the server included it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Avatar URL, when the server included it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl UserRef {
    /// A reference carrying only the id.
    #[must_use]
    pub const fn id_only(id: UserId) -> Self {
        Self {
            id,
            username: None,
            avatar: None,
        }
    }

    /// A reference with a display name.
    #[must_use]
    pub fn named(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: Some(username.into()),
            avatar: None,
        }
    }

    /// Display label: the username if known, otherwise `#<id>`.
    #[must_use]
    pub fn label(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| format!("#{}", self.id))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UserRefRepr {
    Full {
        id: UserId,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        avatar: Option<String>,
    },
    Bare(UserId),
}

impl<'de> Deserialize<'de> for UserRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match UserRefRepr::deserialize(deserializer)? {
            UserRefRepr::Full {
                id,
                username,
                avatar,
            } => Self {
                id,
                username,
                avatar,
            },
            UserRefRepr::Bare(id) => Self::id_only(id),
        })
    }
}

/// Kind of message payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// A file attachment.
    File,
    /// An image attachment.
    Image,
}

/// Identifies one conversation: a direct thread with a peer, or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum ConversationKey {
    /// Direct conversation with a single peer.
    Direct(UserId),
    /// Group conversation.
    Group(GroupId),
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(id) => write!(f, "user:{id}"),
            Self::Group(id) => write!(f, "group:{id}"),
        }
    }
}

/// A message exactly as the server sent it. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<UserRef>,
    #[serde(default, alias = "group", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_edited: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_revoked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<ClientRef>,
}

/// Values substituted for fields the server left out.
#[derive(Debug, Clone)]
pub struct MessageDefaults {
    /// Sender to assume when absent.
    pub sender: UserRef,
    /// Recipient to assume when absent (direct conversations).
    pub recipient: Option<UserRef>,
    /// Group to assume when absent (group conversations).
    pub group_id: Option<GroupId>,
    /// Timestamp to assume when absent.
    pub timestamp: DateTime<Utc>,
}

impl RawMessage {
    /// Fills in missing fields from `defaults` and produces a canonical [`Message`].
    ///
    /// The kind falls back to `image`/`file` when the matching attachment is
    /// present, then to `text`. A missing read flag means unread.
    #[must_use]
    pub fn normalize(self, defaults: &MessageDefaults) -> Message {
        let kind = self.message_type.unwrap_or(if self.image.is_some() {
            MessageKind::Image
        } else if self.file.is_some() {
            MessageKind::File
        } else {
            MessageKind::Text
        });
        let group_id = self.group_id.or(defaults.group_id);
        let recipient = if group_id.is_some() {
            self.recipient
        } else {
            self.recipient.or_else(|| defaults.recipient.clone())
        };

        Message {
            id: self.id,
            sender: self.sender.unwrap_or_else(|| defaults.sender.clone()),
            recipient,
            group_id,
            content: self.content.unwrap_or_default(),
            kind,
            timestamp: self.timestamp.unwrap_or(defaults.timestamp),
            is_read: self.is_read.unwrap_or(false),
            is_edited: self.is_edited.unwrap_or(false),
            is_revoked: self.is_revoked.unwrap_or(false),
            file: self.file,
            image: self.image,
            client_ref: self.client_ref,
        }
    }
}

/// A message as held by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id; `None` until the server has stored it.
    pub id: Option<MessageId>,
    /// Author.
    pub sender: UserRef,
    /// Peer of a direct message; `None` for group messages.
    pub recipient: Option<UserRef>,
    /// Group of a group message.
    pub group_id: Option<GroupId>,
    /// Text body, possibly empty for attachments.
    pub content: String,
    /// Text, file or image.
    pub kind: MessageKind,
    /// When the server stored it, or when it was sent locally.
    pub timestamp: DateTime<Utc>,
    /// Whether the recipient has read it.
    pub is_read: bool,
    /// The text was changed after sending.
    pub is_edited: bool,
    /// The author withdrew it.
    pub is_revoked: bool,
    /// Attached file URL.
    pub file: Option<String>,
    /// Attached image URL.
    pub image: Option<String>,
    /// Correlation reference set by the sending client.
    pub client_ref: Option<ClientRef>,
}

impl Message {
    /// Whether `other` denotes the same message: equal ids when both are
    /// known, otherwise equal client references.
    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            _ => match (&self.client_ref, &other.client_ref) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// The conversation this message belongs to, seen from user `me`.
    ///
    /// Returns `None` for a direct message that names neither a recipient
    /// nor a group.
    #[must_use]
    pub fn conversation_key(&self, me: UserId) -> Option<ConversationKey> {
        if let Some(group) = self.group_id {
            return Some(ConversationKey::Group(group));
        }
        if self.sender.id == me {
            self.recipient
                .as_ref()
                .map(|r| ConversationKey::Direct(r.id))
        } else {
            Some(ConversationKey::Direct(self.sender.id))
        }
    }

    /// Whether this message is addressed to `me` directly.
    #[must_use]
    pub fn is_addressed_to(&self, me: UserId) -> bool {
        self.recipient.as_ref().is_some_and(|r| r.id == me)
    }
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            sender: Some(message.sender),
            recipient: message.recipient,
            group_id: message.group_id,
            content: Some(message.content),
            message_type: Some(message.kind),
            timestamp: Some(message.timestamp),
            is_read: Some(message.is_read),
            is_edited: Some(message.is_edited),
            is_revoked: Some(message.is_revoked),
            file: message.file,
            image: message.image,
            client_ref: message.client_ref,
        }
    }
}

/// Errors from validating an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// No text and no attachment.
    #[error("message has no content and no attachment")]
    Empty,
    /// Neither a recipient nor a group was given.
    #[error("message has no recipient")]
    NoRecipient,
}

/// Body of the REST create-message call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl NewMessage {
    /// A text message to a single peer.
    #[must_use]
    pub fn direct(recipient: UserId, content: impl Into<String>) -> Self {
        Self {
            recipient: Some(recipient),
            group_id: None,
            content: content.into(),
            file: None,
            image: None,
        }
    }

    /// A message to a group.
    #[must_use]
    pub fn group(group_id: GroupId, content: impl Into<String>) -> Self {
        Self {
            recipient: None,
            group_id: Some(group_id),
            content: content.into(),
            file: None,
            image: None,
        }
    }

    /// The conversation this message is addressed to.
    #[must_use]
    pub fn conversation_key(&self) -> Option<ConversationKey> {
        self.group_id
            .map(ConversationKey::Group)
            .or_else(|| self.recipient.map(ConversationKey::Direct))
    }

    /// Checks that the message has a destination and some payload.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NoRecipient`] without a recipient or group,
    /// and [`ValidationError::Empty`] when content is blank and there is no
    /// attachment.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.conversation_key().is_none() {
            return Err(ValidationError::NoRecipient);
        }
        if self.content.trim().is_empty() && self.file.is_none() && self.image.is_none() {
            return Err(ValidationError::Empty);
        }
        Ok(())
    }
}

/// Body of the REST update-message call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub content: String,
}
