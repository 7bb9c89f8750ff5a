//! Process-local connection registry.
//!
//! The registry is the single source of truth for "is this identity
//! connected in this process". At most one session per identity: a new
//! registration supersedes the old one, which is told why before its
//! transport closes. Every register/unregister transition publishes a
//! presence update through the shared store.

use crate::session::{reason, SessionHandle};
use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use tether_protocol::Frame;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct SessionEntry {
    handle: SessionHandle,
    /// Background tasks tied to this session's lifetime (heartbeat probe
    /// loop, pub/sub listener). Aborted on eviction.
    tasks: Vec<JoinHandle<()>>,
}

impl SessionEntry {
    fn abort_tasks(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Identity → live session map for one gateway process.
pub struct ConnectionRegistry {
    sessions: DashMap<String, SessionEntry>,
    presence: tether_store::PresenceStore,
}

impl ConnectionRegistry {
    /// Create an empty registry publishing presence through the given store.
    #[must_use]
    pub fn new(presence: tether_store::PresenceStore) -> Self {
        Self {
            sessions: DashMap::new(),
            presence,
        }
    }

    /// Register a session, evicting any prior session for the identity.
    ///
    /// The evicted transport receives a `system/disconnect` frame with
    /// reason `new_connection` followed by a close; its tasks are aborted.
    pub async fn register(&self, handle: SessionHandle) {
        let identity = handle.identity().to_string();
        let entry = SessionEntry {
            handle,
            tasks: Vec::new(),
        };

        if let Some(old) = self.sessions.insert(identity.clone(), entry) {
            info!(identity = %identity, "Superseding existing session");
            old.handle
                .send_frame(&Frame::disconnect_notice(reason::NEW_CONNECTION));
            old.handle.close(reason::NEW_CONNECTION);
            old.abort_tasks();
        }

        if let Err(e) = self.presence.set_online(&identity).await {
            warn!(identity = %identity, error = %e, "Presence update failed; continuing");
        }

        info!(identity = %identity, total = self.sessions.len(), "Session registered");
    }

    /// Tie a background task to a session's lifetime.
    pub fn add_task(&self, identity: &str, task: JoinHandle<()>) {
        match self.sessions.get_mut(identity) {
            Some(mut entry) => entry.tasks.push(task),
            // The session vanished between spawn and attach; don't leak.
            None => task.abort(),
        }
    }

    /// Remove a session and publish the offline transition. Idempotent;
    /// returns `false` if the identity was not registered.
    pub async fn unregister(&self, identity: &str, why: &str) -> bool {
        let Some((_, entry)) = self.sessions.remove(identity) else {
            return false;
        };

        if let Err(e) = self.presence.set_offline(identity, why).await {
            warn!(identity = %identity, error = %e, "Presence update failed; continuing");
        }

        // Abort last: a session task tearing itself down (e.g. the probe
        // loop on ping timeout) finishes the bookkeeping above first.
        entry.abort_tasks();

        info!(identity = %identity, reason = %why, total = self.sessions.len(), "Session unregistered");
        true
    }

    /// Look up the live session for an identity.
    #[must_use]
    pub fn lookup(&self, identity: &str) -> Option<SessionHandle> {
        self.sessions.get(identity).map(|e| e.handle.clone())
    }

    /// Whether the identity has a live session in this process.
    #[must_use]
    pub fn is_connected(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Identities of all live sessions.
    #[must_use]
    pub fn identities(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Identities whose sessions have been idle longer than `max_idle`.
    #[must_use]
    pub fn stale_identities(&self, max_idle: Duration) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|e| e.handle.meta().idle_for() > max_idle)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Fan a payload out to every local session, optionally excluding one
    /// identity. Sessions whose write channel is gone are evicted.
    pub async fn broadcast(&self, payload: &Value, exclude: Option<&str>) {
        let mut dead = Vec::new();

        for entry in self.sessions.iter() {
            if exclude == Some(entry.key().as_str()) {
                continue;
            }
            if entry.handle.send(payload.clone()) {
                entry.handle.meta().touch();
            } else {
                dead.push(entry.key().clone());
            }
        }

        for identity in dead {
            debug!(identity = %identity, "Evicting dead session found during broadcast");
            self.unregister(&identity, reason::BROADCAST_FAILED).await;
        }
    }
}
