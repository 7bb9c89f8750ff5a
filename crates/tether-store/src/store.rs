//! The shared store abstraction.
//!
//! The trait is deliberately narrow: it covers exactly the operations the
//! gateway performs against the external store, so that a lossy in-memory
//! stand-in stays honest.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Store errors.
///
/// The external store is multi-writer and may be transiently unreachable;
/// callers on the connection path log these and continue.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("store backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

/// A shared key-value / pub-sub store.
///
/// Lists are per-identity FIFO queues: `list_push` appends at the head and
/// `list_pop` removes from the tail, so popping until empty yields
/// insertion order.
#[async_trait]
pub trait Store: Send + Sync {
    /// Set a string key, optionally with a time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Get a string key.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Increment an integer key by one, creating it at zero if absent.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Refresh the time-to-live of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Push a value onto the head of a list.
    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Pop a value from the tail of a list.
    async fn list_pop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Publish a payload to a channel. Best-effort: a publish with no live
    /// subscriber is lost at the channel layer. Returns the number of
    /// subscribers that received it.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError>;

    /// Subscribe to a channel. The subscription yields payloads for as
    /// long as it is held; dropping it unsubscribes.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

/// A live channel subscription.
///
/// Payloads are forwarded from the backend by a dedicated task; dropping
/// the subscription aborts that task and unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<String>, forwarder: JoinHandle<()>) -> Self {
        Self { rx, forwarder }
    }

    /// Receive the next payload. Returns `None` when the backend side of
    /// the channel is gone.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}
