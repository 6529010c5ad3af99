//! JSON encoding for socket frames.
//!
//! Frames travel as WebSocket text messages. Decoding is generic so the
//! same functions serve the client ([`ServerFrame`] in, [`ClientFrame`] out)
//! and test servers (the reverse).
//!
//! [`ServerFrame`]: crate::frame::ServerFrame
//! [`ClientFrame`]: crate::frame::ClientFrame

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame could not be serialized.
    #[error("frame encode error: {0}")]
    Encode(String),
    /// The text is not valid JSON or does not match any known frame.
    #[error("frame decode error: {0}")]
    Decode(String),
}

/// Encodes a frame as a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Encode` if the frame cannot be serialized.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decodes a frame from a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Decode` if `text` is not JSON or has no
/// recognisable `type` tag.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
}
