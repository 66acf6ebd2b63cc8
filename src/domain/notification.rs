//! Outbound notification channel.
//!
//! [`NotificationBus`] wraps a [`tokio::sync::broadcast`] channel. Every
//! committed transition publishes [`Notification`]s through the bus, and the
//! external chat layer subscribes to deliver them. Publishing is
//! fire-and-forget: delivery problems never fail a state transition.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::UserId;

/// A text message addressed to one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// The user to deliver to.
    pub recipient: UserId,
    /// Message text, ready for the chat layer to send as-is.
    pub text: String,
}

impl Notification {
    /// Builds a notification for the given recipient.
    #[must_use]
    pub fn new(recipient: UserId, text: impl Into<String>) -> Self {
        Self {
            recipient,
            text: text.into(),
        }
    }
}

/// Broadcast bus for [`Notification`]s.
///
/// Backed by a `tokio::broadcast` channel with a configurable capacity.
/// When the ring buffer is full, the oldest entries are dropped for lagging
/// receivers — acceptable for advisory chat notifications.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<Notification>,
}

impl NotificationBus {
    /// Creates a new bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes a notification to all subscribers.
    ///
    /// Returns the number of receivers it reached. Zero receivers means the
    /// notification is dropped; callers log that instead of failing.
    pub fn publish(&self, notification: Notification) -> usize {
        self.sender.send(notification).unwrap_or(0)
    }

    /// Creates a new receiver for all future notifications.
    ///
    /// The chat layer calls this once per delivery worker.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Returns the current number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
