use axum::extract::ws::Message;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::store::ConnId;

/// Fan-out bus for dashboard subscribers. Holds membership only; actual
/// socket writes happen in each connection's writer task, fed through a
/// bounded queue. Delivery here is `try_send`: a subscriber that cannot
/// keep up is evicted rather than buffered indefinitely.
pub struct Publisher {
    subscribers: HashMap<ConnId, mpsc::Sender<Message>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
        }
    }

    /// Add a subscriber. The `initial` frame is delivered before the
    /// connection joins the set, so it is always the first frame seen; if
    /// that delivery fails the subscriber is never added.
    pub fn subscribe(&mut self, conn: ConnId, sender: mpsc::Sender<Message>, initial: &str) -> bool {
        if sender.try_send(Message::Text(initial.to_string())).is_err() {
            warn!(event = "subscriber_bootstrap_failed", conn_id = conn);
            return false;
        }
        self.subscribers.insert(conn, sender);
        info!(
            event = "subscriber_connected",
            conn_id = conn,
            subscribers = self.subscribers.len()
        );
        true
    }

    pub fn remove(&mut self, conn: ConnId) -> bool {
        let removed = self.subscribers.remove(&conn).is_some();
        if removed {
            info!(
                event = "subscriber_removed",
                conn_id = conn,
                subscribers = self.subscribers.len()
            );
        }
        removed
    }

    /// Deliver one already-serialized frame to every subscriber. Returns
    /// the connections evicted for being closed or lagging.
    pub fn publish_frame(&mut self, frame: &str) -> Vec<ConnId> {
        let mut evicted = Vec::new();
        for (conn, sender) in &self.subscribers {
            match sender.try_send(Message::Text(frame.to_string())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(event = "subscriber_send_failed", reason = "closed", conn_id = conn);
                    evicted.push(*conn);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        event = "subscriber_send_failed",
                        reason = "slow_consumer",
                        conn_id = conn
                    );
                    evicted.push(*conn);
                }
            }
        }
        for conn in &evicted {
            self.subscribers.remove(conn);
        }
        evicted
    }

    pub fn count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(msg: Message) -> String {
        match msg {
            Message::Text(text) => text,
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn initial_frame_is_delivered_before_membership() {
        let mut publisher = Publisher::new();
        let (tx, mut rx) = mpsc::channel(4);
        assert!(publisher.subscribe(1, tx, r#"{"type":"initial"}"#));
        assert_eq!(publisher.count(), 1);

        publisher.publish_frame(r#"{"type":"serviceRegistered"}"#);
        assert_eq!(text(rx.recv().await.expect("initial")), r#"{"type":"initial"}"#);
        assert_eq!(
            text(rx.recv().await.expect("event")),
            r#"{"type":"serviceRegistered"}"#
        );
    }

    #[tokio::test]
    async fn lagging_subscriber_is_evicted_on_publish() {
        let mut publisher = Publisher::new();
        let (tx, _rx) = mpsc::channel(1);
        // Queue holds exactly the initial frame; the next publish overflows.
        assert!(publisher.subscribe(7, tx, "initial"));
        let evicted = publisher.publish_frame("event");
        assert_eq!(evicted, vec![7]);
        assert_eq!(publisher.count(), 0);

        // Already gone: the next publish sees no subscriber at all.
        assert!(publisher.publish_frame("event").is_empty());
    }

    #[tokio::test]
    async fn closed_subscriber_is_evicted_on_publish() {
        let mut publisher = Publisher::new();
        let (tx, rx) = mpsc::channel(4);
        assert!(publisher.subscribe(3, tx, "initial"));
        drop(rx);
        let evicted = publisher.publish_frame("event");
        assert_eq!(evicted, vec![3]);
        assert_eq!(publisher.count(), 0);
    }

    #[tokio::test]
    async fn surviving_subscribers_receive_in_publication_order() {
        let mut publisher = Publisher::new();
        let (tx, mut rx) = mpsc::channel(8);
        assert!(publisher.subscribe(1, tx, "initial"));
        publisher.publish_frame("first");
        publisher.publish_frame("second");
        assert_eq!(text(rx.recv().await.expect("frame")), "initial");
        assert_eq!(text(rx.recv().await.expect("frame")), "first");
        assert_eq!(text(rx.recv().await.expect("frame")), "second");
    }
}
