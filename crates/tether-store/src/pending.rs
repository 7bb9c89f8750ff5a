//! Durable per-identity pending message queue.
//!
//! Notifications that could not be delivered to a live session land here
//! and are drained, oldest first, when the identity reconnects. Entries
//! are opaque JSON payloads; they are never edited in place. Both
//! operations are safe to retry; a retried enqueue may duplicate, which
//! is the accepted cost of at-least-once delivery.

use crate::store::{Store, StoreError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Retention window for queued messages and their counter.
const PENDING_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn queue_key(identity: &str) -> String {
    format!("identity:{identity}:pending_messages")
}

fn count_key(identity: &str) -> String {
    format!("identity:{identity}:pending_count")
}

/// Per-identity FIFO of undelivered notification payloads.
#[derive(Clone)]
pub struct PendingQueue {
    store: Arc<dyn Store>,
}

impl PendingQueue {
    /// Create a queue on top of a shared store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Append a payload to the identity's queue and refresh the retention
    /// window of both the queue and the count metric.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable.
    pub async fn enqueue(&self, identity: &str, payload: &Value) -> Result<(), StoreError> {
        let queue = queue_key(identity);
        let count = count_key(identity);

        self.store.list_push(&queue, &payload.to_string()).await?;
        self.store.expire(&queue, PENDING_TTL).await?;
        self.store.incr(&count).await?;
        self.store.expire(&count, PENDING_TTL).await?;

        debug!(identity = %identity, "Queued message for later delivery");
        Ok(())
    }

    /// Pop every queued payload, head to tail, and reset the count metric.
    /// Returns the payloads in enqueue order.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable; already-popped
    /// entries are returned by value only on success.
    pub async fn drain(&self, identity: &str) -> Result<Vec<Value>, StoreError> {
        let queue = queue_key(identity);
        let mut messages = Vec::new();

        while let Some(raw) = self.store.list_pop(&queue).await? {
            // Tolerate non-JSON entries written by older producers.
            match serde_json::from_str(&raw) {
                Ok(value) => messages.push(value),
                Err(_) => messages.push(Value::String(raw)),
            }
        }

        if !messages.is_empty() {
            self.store
                .set(&count_key(identity), "0", Some(PENDING_TTL))
                .await?;
        }

        Ok(messages)
    }

    /// Current value of the pending-count metric.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable.
    pub async fn count(&self, identity: &str) -> Result<i64, StoreError> {
        let raw = self.store.get(&count_key(identity)).await?;
        Ok(raw.and_then(|s| s.parse().ok()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn queue() -> PendingQueue {
        PendingQueue::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_enqueue_then_drain_round_trips_payload() {
        let q = queue();
        let payload = json!({"type": "ping-test"});

        q.enqueue("u1", &payload).await.unwrap();
        assert_eq!(q.count("u1").await.unwrap(), 1);

        let drained = q.drain("u1").await.unwrap();
        assert_eq!(drained, vec![payload]);
        assert!(q.drain("u1").await.unwrap().is_empty());
        assert_eq!(q.count("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_preserves_fifo_order() {
        let q = queue();
        q.enqueue("u1", &json!({"n": 1})).await.unwrap();
        q.enqueue("u1", &json!({"n": 2})).await.unwrap();
        q.enqueue("u1", &json!({"n": 3})).await.unwrap();

        let drained = q.drain("u1").await.unwrap();
        assert_eq!(drained, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    }

    #[tokio::test]
    async fn test_queues_are_per_identity() {
        let q = queue();
        q.enqueue("u1", &json!("a")).await.unwrap();
        q.enqueue("u2", &json!("b")).await.unwrap();

        assert_eq!(q.drain("u1").await.unwrap(), vec![json!("a")]);
        assert_eq!(q.count("u2").await.unwrap(), 1);
    }
}
