//! Conversation-list and group-chat payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::message::{GroupId, Message, UserId, UserRef};

/// Summary of the newest message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    /// Text of the message.
    pub content: String,
    /// When it was stored, if the server said.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Whether the recipient has read it.
    #[serde(default)]
    pub is_read: bool,
}

impl From<&Message> for LastMessage {
    fn from(message: &Message) -> Self {
        Self {
            content: message.content.clone(),
            timestamp: Some(message.timestamp),
            is_read: message.is_read,
        }
    }
}

/// One direct conversation in the server's conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// The other participant.
    pub user: UserRef,
    /// Newest message, absent for an empty conversation.
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    /// Messages from `user` the current user has not read.
    #[serde(default)]
    pub unread_count: u32,
}

/// A group chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChat {
    /// Server-assigned id.
    pub id: GroupId,
    /// Display name.
    pub name: String,
    /// Current members.
    #[serde(default)]
    pub members: Vec<UserRef>,
    /// Newest message, if any.
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    /// Messages in the group the current user has not read.
    #[serde(default)]
    pub unread_count: u32,
}

/// Body of the create-group call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGroupChat {
    pub name: String,
    #[serde(default)]
    pub members: Vec<UserId>,
}

/// Body of the add/remove-member calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberChange {
    pub user_id: UserId,
}

/// The server's conversation list.
///
/// Newer servers answer with `{"private_chats": [...], "group_chats": [...]}`;
/// older ones with a bare array of direct conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationList {
    /// Direct conversations.
    pub private_chats: Vec<ConversationSummary>,
    /// Groups the current user belongs to.
    pub group_chats: Vec<GroupChat>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConversationListRepr {
    Bare(Vec<ConversationSummary>),
    Split {
        #[serde(default)]
        private_chats: Vec<ConversationSummary>,
        #[serde(default)]
        group_chats: Vec<GroupChat>,
    },
}

impl<'de> Deserialize<'de> for ConversationList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match ConversationListRepr::deserialize(deserializer)? {
            ConversationListRepr::Bare(private_chats) => Self {
                private_chats,
                group_chats: Vec::new(),
            },
            ConversationListRepr::Split {
                private_chats,
                group_chats,
            } => Self {
                private_chats,
                group_chats,
            },
        })
    }
}
