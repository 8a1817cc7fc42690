//! PushFabric - Metrics/Alert Distribution
//!
//! ## Responsibilities
//!
//! - Topic-based subscriber registry (per-camera metrics, global alerts)
//! - At-most-once, in-order delivery into bounded per-subscriber buffers
//! - Drop policy: a full buffer drops the event (counted); three consecutive
//!   drops disconnect the subscriber
//!
//! Producers never block: publishing is a `try_send` into each subscriber's
//! buffer. Subscribers that vanish mid-send are cleaned up quietly.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Subscription topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Per-camera metrics stream
    Metrics(String),
    /// Global alert stream
    Alerts,
}

struct Subscriber {
    topic: Topic,
    tx: mpsc::Sender<String>,
    consecutive_drops: u32,
}

/// PushFabric configuration
#[derive(Debug, Clone)]
pub struct PushFabricConfig {
    /// Per-subscriber buffer depth; a full buffer counts as a missed send
    /// deadline
    pub buffer_capacity: usize,
    /// Consecutive drops before a subscriber is declared non-responsive
    pub max_consecutive_drops: u32,
}

impl Default for PushFabricConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
            max_consecutive_drops: 3,
        }
    }
}

/// PushFabric instance
pub struct PushFabric {
    config: PushFabricConfig,
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    dropped_total: AtomicU64,
    published_total: AtomicU64,
}

impl PushFabric {
    pub fn new(config: PushFabricConfig) -> Self {
        Self {
            config,
            subscribers: RwLock::new(HashMap::new()),
            dropped_total: AtomicU64::new(0),
            published_total: AtomicU64::new(0),
        }
    }

    /// Register a subscriber on a topic. The returned receiver yields
    /// serialized JSON events in emission order. Dropping the receiver (or
    /// calling `unsubscribe`) removes the subscription.
    pub async fn subscribe(&self, topic: Topic) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.buffer_capacity.max(1));

        let mut subs = self.subscribers.write().await;
        subs.insert(
            id,
            Subscriber {
                topic,
                tx,
                consecutive_drops: 0,
            },
        );
        tracing::debug!(subscriber_id = %id, "Push subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber.
    pub async fn unsubscribe(&self, id: &Uuid) {
        let mut subs = self.subscribers.write().await;
        if subs.remove(id).is_some() {
            tracing::debug!(subscriber_id = %id, "Push subscriber removed");
        }
    }

    /// Publish an event to every subscriber of the topic.
    pub async fn publish<T: Serialize>(&self, topic: &Topic, event: &T) {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize push event");
                return;
            }
        };
        self.published_total.fetch_add(1, Ordering::Relaxed);

        let mut disconnected = Vec::new();
        {
            let mut subs = self.subscribers.write().await;
            for (id, sub) in subs.iter_mut() {
                if sub.topic != *topic {
                    continue;
                }
                match sub.tx.try_send(json.clone()) {
                    Ok(()) => {
                        sub.consecutive_drops = 0;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        sub.consecutive_drops += 1;
                        self.dropped_total.fetch_add(1, Ordering::Relaxed);
                        if sub.consecutive_drops >= self.config.max_consecutive_drops {
                            disconnected.push(*id);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        disconnected.push(*id);
                    }
                }
            }
            for id in &disconnected {
                subs.remove(id);
            }
        }

        for id in disconnected {
            tracing::warn!(subscriber_id = %id, "Push subscriber disconnected (non-responsive)");
        }
    }

    /// Total events dropped across all subscribers.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Current subscriber count.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for PushFabric {
    fn default() -> Self {
        Self::new(PushFabricConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fabric(capacity: usize) -> PushFabric {
        PushFabric::new(PushFabricConfig {
            buffer_capacity: capacity,
            max_consecutive_drops: 3,
        })
    }

    #[tokio::test]
    async fn subscriber_receives_in_emission_order() {
        let fabric = fabric(16);
        let (_, mut rx) = fabric.subscribe(Topic::Alerts).await;

        for i in 0..5 {
            fabric.publish(&Topic::Alerts, &json!({ "n": i })).await;
        }

        for i in 0..5 {
            let msg = rx.recv().await.unwrap();
            assert!(msg.contains(&format!("\"n\":{i}")));
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let fabric = fabric(16);
        let (_, mut metrics_rx) = fabric
            .subscribe(Topic::Metrics("cam_A".to_string()))
            .await;
        let (_, mut alerts_rx) = fabric.subscribe(Topic::Alerts).await;

        fabric
            .publish(&Topic::Metrics("cam_A".to_string()), &json!({"m": 1}))
            .await;
        fabric
            .publish(&Topic::Metrics("cam_B".to_string()), &json!({"m": 2}))
            .await;
        fabric.publish(&Topic::Alerts, &json!({"a": 1})).await;

        assert!(metrics_rx.recv().await.unwrap().contains("\"m\":1"));
        assert!(alerts_rx.recv().await.unwrap().contains("\"a\":1"));
        assert!(metrics_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_buffer_drops_newest_and_counts() {
        let fabric = fabric(2);
        let (_, mut rx) = fabric.subscribe(Topic::Alerts).await;

        for i in 0..5 {
            fabric.publish(&Topic::Alerts, &json!({ "n": i })).await;
        }
        // Buffer held 0 and 1; 2..4 were dropped
        assert_eq!(fabric.dropped_total(), 3);
        assert!(rx.recv().await.unwrap().contains("\"n\":0"));
        assert!(rx.recv().await.unwrap().contains("\"n\":1"));

        // Subscriber hit 3 consecutive drops and was disconnected
        assert_eq!(fabric.subscriber_count().await, 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn draining_resets_consecutive_drops() {
        let fabric = fabric(1);
        let (_, mut rx) = fabric.subscribe(Topic::Alerts).await;

        fabric.publish(&Topic::Alerts, &json!({"n": 0})).await; // buffered
        fabric.publish(&Topic::Alerts, &json!({"n": 1})).await; // dropped
        fabric.publish(&Topic::Alerts, &json!({"n": 2})).await; // dropped
        rx.recv().await.unwrap();
        fabric.publish(&Topic::Alerts, &json!({"n": 3})).await; // buffered, resets
        fabric.publish(&Topic::Alerts, &json!({"n": 4})).await; // dropped (1st again)

        assert_eq!(fabric.subscriber_count().await, 1);
        assert_eq!(fabric.dropped_total(), 3);
    }

    #[tokio::test]
    async fn closed_receiver_is_cleaned_up_quietly() {
        let fabric = fabric(4);
        let (_, rx) = fabric.subscribe(Topic::Alerts).await;
        drop(rx);

        fabric.publish(&Topic::Alerts, &json!({"n": 0})).await;
        assert_eq!(fabric.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes() {
        let fabric = fabric(4);
        let (id, _rx) = fabric.subscribe(Topic::Alerts).await;
        fabric.unsubscribe(&id).await;
        assert_eq!(fabric.subscriber_count().await, 0);
    }
}
