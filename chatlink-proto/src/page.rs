//! Paged message-history responses and the client-side pagination cursor.

use serde::{Deserialize, Deserializer, Serialize};

use crate::message::RawMessage;

/// Default number of messages per history page.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Which page of a conversation's history is loaded and whether more
/// exist in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Total messages in the conversation on the server.
    pub count: u64,
    /// Highest page loaded so far (1 is the newest).
    pub page: u32,
    /// Messages per page.
    pub page_size: u32,
    /// Older messages remain on the server.
    pub has_next: bool,
    /// Newer pages exist than the one last fetched.
    pub has_previous: bool,
}

impl Pagination {
    /// Cursor for an empty conversation whose first page is not loaded yet.
    #[must_use]
    pub const fn empty(page_size: u32) -> Self {
        Self {
            count: 0,
            page: 1,
            page_size,
            has_next: false,
            has_previous: false,
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::empty(DEFAULT_PAGE_SIZE)
    }
}

/// One page of a conversation's history as returned by the server.
///
/// Accepts the paged envelope (messages under `results` or `data`) or a bare
/// array of messages. Missing metadata fields stay `None` and are resolved
/// against the request by [`MessagePage::cursor`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessagePage {
    #[serde(rename = "results")]
    pub messages: Vec<RawMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_next: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_previous: Option<bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MessagePageRepr {
    Bare(Vec<RawMessage>),
    Paged {
        #[serde(default)]
        results: Option<Vec<RawMessage>>,
        #[serde(default)]
        data: Option<Vec<RawMessage>>,
        #[serde(default)]
        count: Option<u64>,
        #[serde(default)]
        page: Option<u32>,
        #[serde(default)]
        page_size: Option<u32>,
        #[serde(default)]
        has_next: Option<bool>,
        #[serde(default)]
        has_previous: Option<bool>,
    },
}

impl<'de> Deserialize<'de> for MessagePage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match MessagePageRepr::deserialize(deserializer)? {
            MessagePageRepr::Paged {
                results,
                data,
                count,
                page,
                page_size,
                has_next,
                has_previous,
            } => Self {
                messages: results.or(data).unwrap_or_default(),
                count,
                page,
                page_size,
                has_next,
                has_previous,
            },
            MessagePageRepr::Bare(messages) => Self {
                messages,
                ..Self::default()
            },
        })
    }
}

impl MessagePage {
    /// Builds a full page response, as a server would send it.
    #[must_use]
    pub fn new(messages: Vec<RawMessage>, cursor: Pagination) -> Self {
        Self {
            messages,
            count: Some(cursor.count),
            page: Some(cursor.page),
            page_size: Some(cursor.page_size),
            has_next: Some(cursor.has_next),
            has_previous: Some(cursor.has_previous),
        }
    }

    /// Resolves the page metadata against the request that produced it.
    ///
    /// Missing fields default to the requested page and size, zero count,
    /// and no further pages. Any page after the first always has a
    /// previous page.
    #[must_use]
    pub fn cursor(&self, requested_page: u32, requested_size: u32) -> Pagination {
        Pagination {
            count: self.count.unwrap_or(0),
            page: self.page.unwrap_or(requested_page),
            page_size: self.page_size.unwrap_or(requested_size),
            has_next: self.has_next.unwrap_or(false),
            has_previous: self.has_previous.unwrap_or(false) || requested_page > 1,
        }
    }
}
