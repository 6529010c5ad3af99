//! Real-time messaging client with WebSocket delivery and
//! HTTP fallback.

pub mod api;
pub mod auth;
pub mod chat;
pub mod client;
pub mod config;
pub mod connection;
pub mod events;
pub mod notify;
