//! Shared wire definitions for the `chatlink` messaging client.
//!
//! Covers the JSON frames exchanged over the chat WebSocket and the
//! payloads of the REST fallback API. Nothing in this crate performs I/O.

pub mod codec;
pub mod conversation;
pub mod frame;
pub mod message;
pub mod notification;
pub mod page;
