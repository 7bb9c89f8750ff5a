//! Per-identity reconnection records.
//!
//! Tracks failed connection attempts so clients can be told how long to
//! wait before retrying. The computed guidance is persisted in the shared
//! store (clients poll it over HTTP while disconnected) and, when another
//! device of the same identity is still live, pushed as a
//! `system/reconnect_info` frame. Attempts reset only on a successful
//! Active transition, never merely on a new connection attempt.

use crate::backoff::{backoff, BASE_BACKOFF};
use crate::session::SessionHandle;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_store::Store;
use tracing::{info, warn};

fn reconnect_key(identity: &str) -> String {
    format!("identity:{identity}:reconnect")
}

#[derive(Debug, Clone)]
struct ReconnectRecord {
    attempts: u32,
    last_backoff: Duration,
    last_connected: Instant,
}

impl Default for ReconnectRecord {
    fn default() -> Self {
        Self {
            attempts: 0,
            last_backoff: BASE_BACKOFF,
            last_connected: Instant::now(),
        }
    }
}

/// In-process attempt counters plus persisted backoff guidance.
pub struct ReconnectTracker {
    records: DashMap<String, ReconnectRecord>,
    store: Arc<dyn Store>,
}

impl ReconnectTracker {
    /// Create a tracker persisting guidance through the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            records: DashMap::new(),
            store,
        }
    }

    /// Record a failed or ended connection attempt and compute the wait
    /// before the next one. Guidance is persisted with a TTL of twice the
    /// wait and pushed to `live_session` when one exists.
    pub async fn record_failure(
        &self,
        identity: &str,
        live_session: Option<&SessionHandle>,
    ) -> Duration {
        let (attempts, wait) = {
            let mut record = self.records.entry(identity.to_string()).or_default();
            record.attempts += 1;
            let wait = backoff(record.attempts);
            record.last_backoff = wait;
            (record.attempts, wait)
        };

        let guidance = json!({
            "attempts": attempts,
            "backoff": wait.as_secs_f64(),
            "next_attempt": (Utc::now()
                + chrono::Duration::milliseconds(wait.as_millis() as i64))
            .to_rfc3339(),
            "retry_delay": wait.as_secs_f64(),
        });

        if let Err(e) = self
            .store
            .set(&reconnect_key(identity), &guidance.to_string(), Some(wait * 2))
            .await
        {
            warn!(identity = %identity, error = %e, "Could not persist reconnect guidance");
        }

        if let Some(handle) = live_session {
            handle.send_frame(&tether_protocol::Frame::system(
                tether_protocol::SystemAction::ReconnectInfo,
                guidance,
            ));
        }

        info!(identity = %identity, attempts, wait_secs = wait.as_secs_f64(), "Reconnect attempt recorded");
        wait
    }

    /// Reset the attempt counter after a successful Active transition.
    pub fn reset(&self, identity: &str) {
        let mut record = self.records.entry(identity.to_string()).or_default();
        record.attempts = 0;
        record.last_backoff = BASE_BACKOFF;
        record.last_connected = Instant::now();
    }

    /// Current attempt count for an identity.
    #[must_use]
    pub fn attempts(&self, identity: &str) -> u32 {
        self.records.get(identity).map(|r| r.attempts).unwrap_or(0)
    }

    /// Drop records whose identity has not connected within `retention`.
    /// Returns how many were purged.
    pub fn purge_stale(&self, retention: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.last_connected.elapsed() <= retention);
        before - self.records.len()
    }
}
