//! Frames carried as JSON text over the chat WebSocket.
//!
//! Every frame is an object tagged by its `"type"` field. Outbound frames
//! optionally carry a `client_ref`; a server that echoes it back in the
//! confirmation lets the client match confirmations to sends exactly.

use serde::{Deserialize, Serialize};

use crate::message::{ClientRef, GroupId, MessageId, MessageKind, RawMessage, UserId};

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A direct message to one user.
    Message {
        recipient_id: UserId,
        content: String,
        message_type: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<ClientRef>,
    },
    /// A message to a group chat.
    GroupMessage {
        group_id: GroupId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<ClientRef>,
    },
    /// Read receipt for a received message.
    Read { message_id: MessageId },
    /// Keep-alive.
    Ping,
}

impl ClientFrame {
    /// The correlation reference carried by this frame, if any.
    #[must_use]
    pub const fn client_ref(&self) -> Option<&ClientRef> {
        match self {
            Self::Message { client_ref, .. } | Self::GroupMessage { client_ref, .. } => {
                client_ref.as_ref()
            }
            Self::Read { .. } | Self::Ping => None,
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A direct message: either the confirmation of our own send or a
    /// message from a peer (which some servers tag `chat_message`).
    #[serde(alias = "chat_message")]
    Message {
        message: RawMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<ClientRef>,
    },
    /// A message posted to a group chat.
    GroupMessage {
        message: RawMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<ClientRef>,
    },
    /// A message we sent was read by its recipient.
    Read { message_id: MessageId },
    /// Heartbeat reply.
    Pong,
    /// Any frame type this client does not understand.
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    /// The message payload of a `message` or `group_message` frame.
    #[must_use]
    pub const fn message(&self) -> Option<&RawMessage> {
        match self {
            Self::Message { message, .. } | Self::GroupMessage { message, .. } => Some(message),
            Self::Read { .. } | Self::Pong | Self::Unknown => None,
        }
    }

    /// The echoed correlation reference, looked up on the frame first and
    /// then on the embedded message.
    #[must_use]
    pub fn client_ref(&self) -> Option<&ClientRef> {
        match self {
            Self::Message {
                message,
                client_ref,
            }
            | Self::GroupMessage {
                message,
                client_ref,
            } => client_ref.as_ref().or(message.client_ref.as_ref()),
            Self::Read { .. } | Self::Pong | Self::Unknown => None,
        }
    }
}
