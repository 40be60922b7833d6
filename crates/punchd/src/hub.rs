//! Fan-out of stream messages to live subscribers.
//!
//! Each subscriber owns a bounded queue. Publishing never blocks: a
//! subscriber whose queue is full or closed is dropped from the set and
//! everyone else keeps receiving.

use crate::config::HubOptions;
use crate::messages::{StatusSnapshot, StreamMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct BroadcastHub {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<StreamMessage>>>,
    next_id: AtomicU64,
    options: HubOptions,
}

/// A registered viewer. Dropping it closes the queue; the hub notices on
/// the next publish.
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<StreamMessage>,
    idle_timeout: Duration,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or a synthesized heartbeat if nothing arrived within
    /// the idle timeout. `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
            Ok(msg) => msg,
            Err(_) => Some(StreamMessage::heartbeat()),
        }
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<StreamMessage> {
        self.rx.try_recv().ok()
    }
}

impl BroadcastHub {
    pub fn new(options: HubOptions) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            options,
        }
    }

    /// Register a subscriber and queue the connection greeting followed by
    /// `snapshot`.
    pub fn subscribe(&self, snapshot: StatusSnapshot) -> Subscriber {
        let capacity = self.options.queue_capacity.max(2);
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Fresh queue with room for both; these cannot fail.
        let _ = tx.try_send(StreamMessage::connection());
        let _ = tx.try_send(StreamMessage::Status(snapshot));

        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.insert(id, tx);
        tracing::info!(subscriber = id, total = subs.len(), "subscriber connected");

        Subscriber {
            id,
            rx,
            idle_timeout: self.options.idle_timeout,
        }
    }

    pub fn unsubscribe(&self, subscriber: &Subscriber) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        if subs.remove(&subscriber.id).is_some() {
            tracing::info!(subscriber = subscriber.id, total = subs.len(), "subscriber disconnected");
        }
    }

    /// Deliver `msg` to every subscriber, dropping the ones that cannot
    /// take it right now.
    pub fn publish(&self, msg: StreamMessage) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.retain(|id, tx| match tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = *id, kind = msg.kind(), "subscriber queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = *id, "subscriber gone");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Drop every subscriber.
    pub fn reset(&self) {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(capacity: usize) -> BroadcastHub {
        BroadcastHub::new(HubOptions {
            queue_capacity: capacity,
            idle_timeout: Duration::from_secs(30),
        })
    }

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot::new(vec![], true, 0)
    }

    #[tokio::test]
    async fn test_subscribe_sends_connection_then_status() {
        let hub = hub(8);
        let mut sub = hub.subscribe(snapshot());
        assert_eq!(sub.recv().await.unwrap().kind(), "connection");
        assert_eq!(sub.recv().await.unwrap().kind(), "status");
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = hub(8);
        let mut a = hub.subscribe(snapshot());
        let mut b = hub.subscribe(snapshot());
        hub.publish(StreamMessage::face_detected(vec![], 640, 360));
        for sub in [&mut a, &mut b] {
            sub.recv().await;
            sub.recv().await;
            assert_eq!(sub.recv().await.unwrap().kind(), "face_detected");
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_that_subscriber() {
        let hub = hub(4);
        let _slow = hub.subscribe(snapshot());
        let mut fast = hub.subscribe(snapshot());
        fast.recv().await;
        fast.recv().await;

        // slow holds 2 queued messages and never reads
        for _ in 0..3 {
            hub.publish(StreamMessage::heartbeat());
            assert_eq!(fast.recv().await.unwrap().kind(), "heartbeat");
        }
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let hub = hub(8);
        let sub = hub.subscribe(snapshot());
        drop(sub);
        hub.publish(StreamMessage::heartbeat());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let hub = hub(8);
        let mut sub = hub.subscribe(snapshot());
        hub.unsubscribe(&sub);
        assert_eq!(hub.subscriber_count(), 0);
        sub.recv().await;
        sub.recv().await;
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_subscriber_gets_heartbeat() {
        let hub = hub(8);
        let mut sub = hub.subscribe(snapshot());
        sub.recv().await;
        sub.recv().await;

        let started = tokio::time::Instant::now();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.kind(), "heartbeat");
        assert!(started.elapsed() >= Duration::from_secs(30));
    }
}
