//! Activity notifications and the unread counter payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A notification about activity on the user's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    /// Username of whoever triggered it.
    #[serde(default)]
    pub actor: Option<String>,
    /// Kind of activity, e.g. `like` or `comment`.
    #[serde(default)]
    pub notification_type: String,
    #[serde(default)]
    pub post: Option<u64>,
    #[serde(default)]
    pub post_content: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Response of the unread-count endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub count: u64,
}
