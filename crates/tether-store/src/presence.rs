//! Best-effort presence flags.
//!
//! Presence is advisory: online implies a session exists in some process,
//! but after an ungraceful crash the flag may lag true state by up to its
//! TTL. Every transition is also published on a global channel so other
//! processes (and external consumers) can react without polling.

use crate::store::{Store, StoreError};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Global channel carrying presence transitions.
pub const PRESENCE_CHANNEL: &str = "presence_updates";

/// TTL of the online/offline flag; refreshed on activity.
const STATUS_TTL: Duration = Duration::from_secs(60 * 60);

/// Retention of the connect/disconnect history keys.
const HISTORY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn status_key(identity: &str) -> String {
    format!("identity:{identity}:status")
}

fn last_disconnect_key(identity: &str) -> String {
    format!("identity:{identity}:last_disconnect")
}

fn last_session_key(identity: &str) -> String {
    format!("identity:{identity}:last_session")
}

/// Per-identity online/offline state with TTL-based staleness.
#[derive(Clone)]
pub struct PresenceStore {
    store: Arc<dyn Store>,
}

impl PresenceStore {
    /// Create a presence store on top of a shared store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Mark an identity online and publish the transition.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable.
    pub async fn set_online(&self, identity: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        self.store
            .set(&status_key(identity), "online", Some(STATUS_TTL))
            .await?;
        self.store
            .set(
                &last_session_key(identity),
                &now.to_rfc3339(),
                Some(HISTORY_TTL),
            )
            .await?;
        self.store
            .publish(
                PRESENCE_CHANNEL,
                &json!({
                    "identity": identity,
                    "status": "online",
                    "timestamp": now.timestamp_millis(),
                })
                .to_string(),
            )
            .await?;
        debug!(identity = %identity, "Presence: online");
        Ok(())
    }

    /// Mark an identity offline, record when and why, and publish the
    /// transition.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable.
    pub async fn set_offline(&self, identity: &str, reason: &str) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        self.store
            .set(&status_key(identity), "offline", Some(STATUS_TTL))
            .await?;
        self.store
            .set(
                &last_disconnect_key(identity),
                &json!({ "timestamp": now, "reason": reason }).to_string(),
                Some(HISTORY_TTL),
            )
            .await?;
        self.store
            .publish(
                PRESENCE_CHANNEL,
                &json!({
                    "identity": identity,
                    "status": "offline",
                    "reason": reason,
                    "timestamp": now,
                })
                .to_string(),
            )
            .await?;
        debug!(identity = %identity, reason = %reason, "Presence: offline");
        Ok(())
    }

    /// Refresh the TTL of the identity's status flag.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable.
    pub async fn refresh(&self, identity: &str) -> Result<(), StoreError> {
        self.store.expire(&status_key(identity), STATUS_TTL).await
    }

    /// Whether the identity is currently flagged online.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable.
    pub async fn is_online(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(&status_key(identity)).await?.as_deref() == Some("online"))
    }

    /// Millisecond timestamp of the identity's last recorded disconnect.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable.
    pub async fn last_seen(&self, identity: &str) -> Result<Option<i64>, StoreError> {
        let raw = self.store.get(&last_disconnect_key(identity)).await?;
        Ok(raw
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            .and_then(|v| v["timestamp"].as_i64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn presence() -> PresenceStore {
        PresenceStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_online_offline_transitions() {
        let p = presence();
        assert!(!p.is_online("u1").await.unwrap());

        p.set_online("u1").await.unwrap();
        assert!(p.is_online("u1").await.unwrap());

        p.set_offline("u1", "ping_timeout").await.unwrap();
        assert!(!p.is_online("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_last_seen_recorded_on_disconnect() {
        let p = presence();
        assert_eq!(p.last_seen("u1").await.unwrap(), None);

        p.set_offline("u1", "stale_connection").await.unwrap();
        let seen = p.last_seen("u1").await.unwrap();
        assert!(seen.is_some());
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let store = Arc::new(MemoryStore::new());
        let p = PresenceStore::new(store.clone());
        let mut sub = store.subscribe(PRESENCE_CHANNEL).await.unwrap();

        p.set_online("u1").await.unwrap();
        let update: serde_json::Value =
            serde_json::from_str(&sub.next().await.unwrap()).unwrap();
        assert_eq!(update["identity"], "u1");
        assert_eq!(update["status"], "online");

        p.set_offline("u1", "new_connection").await.unwrap();
        let update: serde_json::Value =
            serde_json::from_str(&sub.next().await.unwrap()).unwrap();
        assert_eq!(update["status"], "offline");
        assert_eq!(update["reason"], "new_connection");
    }
}
