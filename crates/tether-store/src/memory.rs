//! In-memory store implementation.
//!
//! Backs tests and single-process deployments. Semantics mirror the Redis
//! backend: TTLs expire lazily on access, lists are head-push/tail-pop,
//! and pub/sub fanout is non-persistent.

use crate::store::{Store, StoreError, Subscription};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

const TOPIC_CAPACITY: usize = 1024;

#[derive(Debug)]
enum Entry {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Record {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// A process-local [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    data: DashMap<String, Record>,
    topics: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a key if its TTL has elapsed.
    fn evict_expired(&self, key: &str) {
        let expired = self.data.get(key).map(|r| r.is_expired()).unwrap_or(false);
        if expired {
            self.data.remove(key);
        }
    }

    fn topic(&self, channel: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.data.insert(
            key.to_string(),
            Record {
                entry: Entry::Text(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.evict_expired(key);
        Ok(self.data.get(key).and_then(|r| match &r.entry {
            Entry::Text(s) => Some(s.clone()),
            Entry::List(_) => None,
        }))
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.evict_expired(key);
        let mut record = self.data.entry(key.to_string()).or_insert_with(|| Record {
            entry: Entry::Text("0".to_string()),
            expires_at: None,
        });
        let next = match &record.entry {
            Entry::Text(s) => s.parse::<i64>().unwrap_or(0) + 1,
            Entry::List(_) => 1,
        };
        record.entry = Entry::Text(next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(mut record) = self.data.get_mut(key) {
            record.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.evict_expired(key);
        let mut record = self.data.entry(key.to_string()).or_insert_with(|| Record {
            entry: Entry::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut record.entry {
            Entry::List(list) => list.push_front(value.to_string()),
            Entry::Text(_) => {
                let mut list = VecDeque::new();
                list.push_front(value.to_string());
                record.entry = Entry::List(list);
            }
        }
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.evict_expired(key);
        let popped = self.data.get_mut(key).and_then(|mut r| match &mut r.entry {
            Entry::List(list) => list.pop_back(),
            Entry::Text(_) => None,
        });
        Ok(popped)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let Some(sender) = self.topics.get(channel).map(|s| s.clone()) else {
            return Ok(0);
        };
        let receivers = sender.receiver_count();
        if receivers > 0 {
            // Send only fails with zero receivers, which we already ruled out.
            let _ = sender.send(payload.to_string());
        }
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut source = self.topic(channel).subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });
        Ok(Subscription::new(rx, forwarder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.incr("n").await.unwrap(), 2);
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_list_fifo_order() {
        let store = MemoryStore::new();
        store.list_push("q", "first").await.unwrap();
        store.list_push("q", "second").await.unwrap();
        assert_eq!(store.list_pop("q").await.unwrap().as_deref(), Some("first"));
        assert_eq!(
            store.list_pop("q").await.unwrap().as_deref(),
            Some("second")
        );
        assert_eq!(store.list_pop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_lost() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("ch", "gone").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", "hello").await.unwrap(), 1);
        assert_eq!(sub.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_counting() {
        let store = MemoryStore::new();
        let sub = store.subscribe("ch").await.unwrap();
        drop(sub);
        // The broadcast receiver is dropped with the forwarder task.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.publish("ch", "x").await.unwrap(), 0);
    }
}
