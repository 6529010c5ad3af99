//! Credential access.
//!
//! The client never stores credentials itself; it asks a [`TokenSource`]
//! for the current bearer token each time one is needed.

use std::fmt;

use parking_lot::RwLock;

/// Provider of the bearer token used for the socket and REST calls.
pub trait TokenSource: Send + Sync {
    /// The current token, or `None` when the user is signed out.
    fn token(&self) -> Option<String>;

    /// Called when the server rejected the token. The default ignores it.
    fn invalidate(&self) {}
}

/// A token shared between the application and the client, replaceable at runtime.
///
/// Empty strings are treated as "no token".
#[derive(Default)]
pub struct SharedToken {
    inner: RwLock<Option<String>>,
}

impl SharedToken {
    /// Creates a source holding `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(Some(token.into())),
        }
    }

    /// Creates a source with no token (signed out).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replaces the stored token.
    pub fn set(&self, token: impl Into<String>) {
        *self.inner.write() = Some(token.into());
    }

    /// Removes the stored token.
    pub fn clear(&self) {
        *self.inner.write() = None;
    }
}

impl fmt::Debug for SharedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedToken")
            .field("present", &self.inner.read().is_some())
            .finish()
    }
}

impl TokenSource for SharedToken {
    fn token(&self) -> Option<String> {
        self.inner
            .read()
            .as_ref()
            .filter(|t| !t.trim().is_empty())
            .cloned()
    }

    fn invalidate(&self) {
        tracing::warn!("server rejected the access token, clearing it");
        self.clear();
    }
}
