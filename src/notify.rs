use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::limits::OUTBOX_CAPACITY;
use crate::model::{Notification, OutboundNotification, UserId};
use crate::store::NotificationSink;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for live notification delivery, one channel per user.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<Notification>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a user's notifications. Creates the channel if needed.
    pub fn subscribe(&self, user: &str) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(user.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, notification: &Notification) {
        if let Some(sender) = self.channels.get(&notification.user) {
            let _ = sender.send(notification.clone());
        }
    }
}

/// Bounded queue between the engine and a [`NotificationSink`].
///
/// Enqueue never waits: when the queue is full or the dispatcher is gone
/// the notification is dropped and counted.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<OutboundNotification>,
}

impl Outbox {
    /// Start the dispatcher task draining into `sink`.
    /// Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn NotificationSink>) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        tokio::spawn(dispatch_loop(sink, rx));
        Self { tx }
    }

    pub fn enqueue(&self, notification: OutboundNotification) {
        if let Err(e) = self.tx.try_send(notification) {
            let user = match &e {
                mpsc::error::TrySendError::Full(n) | mpsc::error::TrySendError::Closed(n) => {
                    n.user.clone()
                }
            };
            warn!(%user, "notification dropped: {e}");
            metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL).increment(1);
        }
    }
}

async fn dispatch_loop(sink: Arc<dyn NotificationSink>, mut rx: mpsc::Receiver<OutboundNotification>) {
    while let Some(notification) = rx.recv().await {
        let user = notification.user.clone();
        if let Err(e) = sink.emit(notification).await {
            warn!(%user, "notification delivery failed: {e}");
            metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NotificationKind;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use ulid::Ulid;

    fn notification(user: &str) -> Notification {
        Notification {
            id: Ulid::new(),
            user: user.into(),
            message: "Your reservation \"Standup\" is now approved.".into(),
            kind: NotificationKind::Success,
            is_read: false,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("alice");
        let n = notification("alice");
        hub.send(&n);
        assert_eq!(rx.recv().await.unwrap(), n);
    }

    #[tokio::test]
    async fn other_users_are_not_delivered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("alice");
        hub.send(&notification("bob"));
        assert!(rx.try_recv().is_err());
    }

    struct ChannelSink(mpsc::UnboundedSender<OutboundNotification>);

    #[async_trait]
    impl NotificationSink for ChannelSink {
        async fn emit(&self, n: OutboundNotification) -> Result<(), StoreError> {
            let _ = self.0.send(n);
            Ok(())
        }
    }

    #[tokio::test]
    async fn outbox_dispatches_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::spawn(Arc::new(ChannelSink(tx)));
        for message in ["one", "two"] {
            outbox.enqueue(OutboundNotification {
                user: "admin".into(),
                message: message.into(),
                kind: NotificationKind::Info,
            });
        }
        assert_eq!(rx.recv().await.unwrap().message, "one");
        assert_eq!(rx.recv().await.unwrap().message, "two");
    }
}
