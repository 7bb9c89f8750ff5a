//! # tether-store
//!
//! Shared key-value / pub-sub store backing Tether's durable state.
//!
//! The [`Store`] trait abstracts the small slice of an external store the
//! gateway needs: string keys with TTLs, per-identity lists, counters, and
//! non-persistent pub/sub channels. Two implementations are provided:
//!
//! - [`RedisStore`]: the production backend; multiple gateway processes
//!   share state and channels through one Redis deployment.
//! - [`MemoryStore`]: a single-process backend used by tests and
//!   standalone deployments.
//!
//! On top of the trait sit the two durable services of the gateway:
//!
//! - [`PendingQueue`]: per-identity FIFO of undelivered notifications.
//! - [`PresenceStore`]: best-effort online/offline flags with TTLs.
//!
//! Every operation returns [`StoreError`] on failure; callers in the
//! connection path treat store failures as non-fatal and degrade to
//! best-effort delivery.

pub mod memory;
pub mod pending;
pub mod presence;
pub mod redis_store;
pub mod store;

pub use memory::MemoryStore;
pub use pending::PendingQueue;
pub use presence::{PresenceStore, PRESENCE_CHANNEL};
pub use redis_store::RedisStore;
pub use store::{Store, StoreError, Subscription};

/// Pub/sub channel carrying single-recipient notifications for an identity.
#[must_use]
pub fn notification_channel(identity: &str) -> String {
    format!("identity:{identity}:notifications")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_channel_layout() {
        assert_eq!(notification_channel("u1"), "identity:u1:notifications");
    }
}
