//! Global unread counter and notification list.
//!
//! The counter is published through a [`tokio::sync::watch`] channel so
//! front ends can redraw a badge whenever it changes. It is unsigned and
//! every decrement saturates, so it can never go below zero.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use chatlink_proto::notification::Notification;

use crate::api::{ApiError, ChatApi};

/// Unread counter plus the user's notifications.
pub struct NotificationAggregator<A> {
    api: Arc<A>,
    unread: watch::Sender<u64>,
    notifications: Mutex<Vec<Notification>>,
}

impl<A: ChatApi> NotificationAggregator<A> {
    /// Creates an aggregator with a zero counter and no notifications.
    #[must_use]
    pub fn new(api: Arc<A>) -> Self {
        Self {
            api,
            unread: watch::Sender::new(0),
            notifications: Mutex::new(Vec::new()),
        }
    }

    /// Current value of the unread counter.
    #[must_use]
    pub fn unread_count(&self) -> u64 {
        *self.unread.borrow()
    }

    /// Receiver that observes every counter change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.unread.subscribe()
    }

    /// Snapshot of the loaded notifications, newest first.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    /// Adds one to the counter.
    pub fn increment(&self) {
        self.unread.send_modify(|n| *n = n.saturating_add(1));
    }

    /// Subtracts one from the counter, stopping at zero.
    pub fn decrement(&self) {
        self.unread.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Replaces the counter with the server's value.
    ///
    /// Returns the new value, or `None` if the request failed (logged; the
    /// counter keeps its previous value).
    pub async fn fetch_unread_count(&self) -> Option<u64> {
        match self.api.unread_count().await {
            Ok(count) => {
                self.unread.send_replace(count);
                tracing::debug!(count, "unread counter refreshed");
                Some(count)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch unread count");
                None
            }
        }
    }

    /// Loads the notification list from the server.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the failed request; the local list is
    /// left unchanged.
    pub async fn fetch_notifications(&self) -> Result<Vec<Notification>, ApiError> {
        let notifications = self.api.list_notifications().await?;
        self.notifications.lock().clone_from(&notifications);
        Ok(notifications)
    }

    /// Marks one notification read: locally first, then on the server.
    ///
    /// The counter drops by one unless the notification is known locally
    /// and was already read. A server failure is logged and not rolled back.
    pub async fn mark_read(&self, id: u64) {
        let was_unread = {
            let mut notifications = self.notifications.lock();
            notifications
                .iter_mut()
                .find(|n| n.id == id)
                .map_or(true, |n| !std::mem::replace(&mut n.is_read, true))
        };
        if was_unread {
            self.decrement();
        }
        if let Err(e) = self.api.mark_notification_read(id).await {
            tracing::warn!(notification = id, error = %e, "failed to mark notification read");
        }
    }

    /// Marks every notification read and zeroes the counter, then tells the
    /// server. A server failure is logged and not rolled back.
    pub async fn mark_all_read(&self) {
        for notification in self.notifications.lock().iter_mut() {
            notification.is_read = true;
        }
        self.unread.send_replace(0);
        if let Err(e) = self.api.mark_all_notifications_read().await {
            tracing::warn!(error = %e, "failed to mark all notifications read");
        }
    }
}
