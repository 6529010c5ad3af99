//! Message delivery and conversation state.
//!
//! - [`send::SendCoordinator`] delivers outbound messages over the socket,
//!   correlating the server's confirmation, and falls back to REST.
//! - [`store::ConversationStore`] holds paginated history per conversation,
//!   merges inbound and outbound messages by identity, and sends read
//!   receipts.

pub mod send;
pub mod store;

use std::fmt;

use chatlink_proto::message::ValidationError;

use crate::api::ApiError;

/// Errors that can occur when sending a message.
///
/// A closed socket is never an error by itself: the message goes over REST
/// instead. Only a failure of that fallback is reported.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The message has neither text nor an attachment.
    #[error("message has no content and no attachment")]
    EmptyContent,

    /// The message names neither a recipient nor a group.
    #[error("message has no recipient")]
    NoRecipient,

    /// The socket accepted the message but no confirmation arrived in time,
    /// and the REST fallback failed too.
    #[error("no confirmation within the ack timeout and fallback failed: {0}")]
    DeliveryTimeout(#[source] ApiError),

    /// The socket was unavailable and the REST fallback failed.
    #[error("socket unavailable and fallback failed: {0}")]
    Undelivered(#[source] ApiError),
}

impl From<ValidationError> for SendError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Empty => Self::EmptyContent,
            ValidationError::NoRecipient => Self::NoRecipient,
        }
    }
}

/// Which path carried a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Confirmed over the socket.
    Socket,
    /// Created through the REST API.
    Http,
}

impl fmt::Display for DeliveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket => write!(f, "socket"),
            Self::Http => write!(f, "http"),
        }
    }
}
