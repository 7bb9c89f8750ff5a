//! The gateway service.
//!
//! One `Gateway` per process. It owns the connection registry, the durable
//! stores, the reconnect tracker, and every background task it spawns;
//! [`Gateway::shutdown`] tears all of that down deterministically instead
//! of relying on process exit.

use crate::heartbeat::{self, HeartbeatConfig};
use crate::reconnect::ReconnectTracker;
use crate::registry::ConnectionRegistry;
use crate::session::{reason, SessionHandle};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tether_protocol::Frame;
use tether_store::{notification_channel, PendingQueue, PresenceStore, Store};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a listener waits before resubscribing after losing its
/// channel.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Heartbeat monitor timings.
    pub heartbeat: HeartbeatConfig,
    /// Delay between sends while draining a pending queue, so a backlog
    /// does not saturate a freshly reconnected transport.
    pub drain_pacing: Duration,
    /// Fixed broadcast channels this process listens on and fans out to
    /// its local sessions.
    pub broadcast_channels: Vec<String>,
    /// How long an idle reconnection record is kept.
    pub reconnect_retention: Duration,
    /// How often stale reconnection records are purged.
    pub reconnect_cleanup_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            drain_pacing: Duration::from_millis(25),
            broadcast_channels: vec!["product_updates".to_string()],
            reconnect_retention: Duration::from_secs(24 * 60 * 60),
            reconnect_cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// What happened to a delivered payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Sent on a live session in this process.
    Direct,
    /// Published for other processes and durably queued; the recipient
    /// sees it on reconnect at the latest.
    Queued,
    /// Neither a live send nor durable queuing succeeded.
    Failed,
}

impl DeliveryOutcome {
    /// Whether the payload reached a live local session.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, DeliveryOutcome::Direct)
    }
}

/// Connection status reported to producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityStatus {
    pub online: bool,
    pub pending_count: i64,
    /// Millisecond timestamp of the last recorded disconnect.
    pub last_seen: Option<i64>,
}

/// The realtime gateway service for one process.
pub struct Gateway {
    registry: ConnectionRegistry,
    pending: PendingQueue,
    presence: PresenceStore,
    reconnect: ReconnectTracker,
    store: Arc<dyn Store>,
    config: GatewayConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Construct the gateway and start its process-wide background tasks
    /// (staleness sweep, reconnect-record cleanup, broadcast listeners).
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: GatewayConfig) -> Arc<Self> {
        let presence = PresenceStore::new(store.clone());
        let gateway = Arc::new(Self {
            registry: ConnectionRegistry::new(presence.clone()),
            pending: PendingQueue::new(store.clone()),
            presence,
            reconnect: ReconnectTracker::new(store.clone()),
            store,
            config,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(heartbeat::sweep_loop(gateway.clone())));
        tasks.push(tokio::spawn(reconnect_cleanup_loop(gateway.clone())));
        for channel in gateway.config.broadcast_channels.clone() {
            tasks.push(tokio::spawn(broadcast_listener(gateway.clone(), channel)));
        }
        *gateway.tasks.lock().unwrap_or_else(|e| e.into_inner()) = tasks;

        info!("Gateway started");
        gateway
    }

    /// The gateway's configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The process-local registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Bring an authenticated session to Active: register it (superseding
    /// any prior session), reset its reconnection record, wire its pub/sub
    /// listener and heartbeat probe, announce `connection_status`, drain
    /// the pending queue in FIFO order, and confirm with the drained
    /// count. Returns how many pending messages were delivered.
    pub async fn attach_session(self: &Arc<Self>, handle: SessionHandle) -> usize {
        let identity = handle.identity().to_string();

        self.registry.register(handle.clone()).await;
        self.reconnect.reset(&identity);

        match self.store.subscribe(&notification_channel(&identity)).await {
            Ok(mut subscription) => {
                let listener_handle = handle.clone();
                let listener_identity = identity.clone();
                let task = tokio::spawn(async move {
                    while let Some(payload) = subscription.next().await {
                        match serde_json::from_str::<Value>(&payload) {
                            Ok(value) => {
                                if !listener_handle.send(value) {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(identity = %listener_identity, error = %e, "Dropping undecodable relayed payload");
                            }
                        }
                    }
                });
                self.registry.add_task(&identity, task);
            }
            Err(e) => {
                // Degraded: cross-process relays for this identity will
                // land in the pending queue instead.
                warn!(identity = %identity, error = %e, "Notification channel unavailable");
            }
        }

        let probe = tokio::spawn(heartbeat::probe_loop(self.clone(), handle.clone()));
        self.registry.add_task(&identity, probe);

        let keepalive = tokio::spawn(heartbeat::keepalive_loop(
            handle.clone(),
            self.config.heartbeat.interval,
        ));
        self.registry.add_task(&identity, keepalive);

        handle.send_frame(&Frame::connection_status(
            handle.meta().session_id,
            Utc::now().to_rfc3339(),
            self.config.heartbeat.interval.as_secs(),
        ));

        let drained = self.drain_into(&identity, &handle).await;
        handle.send_frame(&Frame::connected_notice(drained));

        drained
    }

    async fn drain_into(&self, identity: &str, handle: &SessionHandle) -> usize {
        let messages = match self.pending.drain(identity).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Pending drain unavailable; continuing without it");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut messages = messages.into_iter();
        while let Some(message) = messages.next() {
            if handle.send(message.clone()) {
                delivered += 1;
                tokio::time::sleep(self.config.drain_pacing).await;
                continue;
            }

            // The writer vanished mid-drain: requeue this payload and the
            // rest so the next session still gets them.
            let mut requeued = 0;
            for unsent in std::iter::once(message).chain(messages) {
                match self.pending.enqueue(identity, &unsent).await {
                    Ok(()) => requeued += 1,
                    Err(e) => {
                        error!(identity = %identity, error = %e, "Dropped undeliverable pending payload");
                    }
                }
            }
            warn!(identity = %identity, delivered, requeued, "Drain interrupted; backlog requeued");
            break;
        }

        if delivered > 0 {
            info!(identity = %identity, delivered, "Delivered pending backlog");
        }
        delivered
    }

    /// Tear a session down after a voluntary close or transport error.
    /// Idempotent.
    pub async fn detach_session(&self, identity: &str, why: &str) -> bool {
        self.registry.unregister(identity, why).await
    }

    /// Force-disconnect a session: best-effort explanatory frame, close,
    /// then normal teardown.
    pub async fn force_disconnect(&self, identity: &str, why: &str) -> bool {
        if let Some(handle) = self.registry.lookup(identity) {
            handle.send_frame(&Frame::disconnect_notice(why));
            handle.close(why);
        }
        self.registry.unregister(identity, why).await
    }

    /// Deliver a payload to an identity, wherever it is connected.
    ///
    /// Local session: direct send. Otherwise the payload is published on
    /// the identity's notification channel (reaching a session held by
    /// another process) and also durably queued; publish gives no
    /// delivery receipt, so the queue is the only guarantee.
    pub async fn deliver(&self, identity: &str, payload: Value) -> DeliveryOutcome {
        if let Some(handle) = self.registry.lookup(identity) {
            if handle.send(payload.clone()) {
                handle.meta().touch();
                debug!(identity = %identity, "Delivered directly");
                return DeliveryOutcome::Direct;
            }
            // Dead local session; tear it down and fall through to queuing.
            self.registry.unregister(identity, reason::SEND_FAILED).await;
        }

        let published = match self
            .store
            .publish(&notification_channel(identity), &payload.to_string())
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Publish failed; relying on pending queue");
                0
            }
        };

        match self.pending.enqueue(identity, &payload).await {
            Ok(()) => DeliveryOutcome::Queued,
            Err(e) => {
                error!(identity = %identity, error = %e, published, "Could not queue payload");
                DeliveryOutcome::Failed
            }
        }
    }

    /// Fan a payload out to every session in this process.
    pub async fn broadcast_local(&self, payload: &Value, exclude: Option<&str>) {
        self.registry.broadcast(payload, exclude).await;
    }

    /// Publish on a broadcast channel. Lossy by design: used for
    /// high-frequency catalog updates where the next read supersedes a
    /// missed one. Returns whether the publish reached the store.
    pub async fn broadcast_to_channel(&self, channel: &str, payload: &Value) -> bool {
        match self.store.publish(channel, &payload.to_string()).await {
            Ok(receivers) => {
                debug!(channel = %channel, receivers, "Broadcast published");
                true
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Broadcast publish failed");
                false
            }
        }
    }

    /// Drain and return an identity's pending messages (producer API).
    pub async fn get_pending(&self, identity: &str) -> Vec<Value> {
        match self.pending.drain(identity).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Pending drain unavailable");
                Vec::new()
            }
        }
    }

    /// Report an identity's connection status (producer API). Degrades to
    /// offline/empty when the store is unreachable.
    pub async fn get_status(&self, identity: &str) -> IdentityStatus {
        let online = self.presence.is_online(identity).await.unwrap_or_else(|e| {
            warn!(identity = %identity, error = %e, "Presence read failed");
            false
        });
        let pending_count = self.pending.count(identity).await.unwrap_or(0);
        let last_seen = self.presence.last_seen(identity).await.unwrap_or(None);
        IdentityStatus {
            online,
            pending_count,
            last_seen,
        }
    }

    /// Record a failed connection attempt and return the wait before the
    /// next one.
    pub async fn record_connect_failure(&self, identity: &str) -> Duration {
        let live = self.registry.lookup(identity);
        self.reconnect.record_failure(identity, live.as_ref()).await
    }

    /// Current reconnect attempt count for an identity.
    #[must_use]
    pub fn reconnect_attempts(&self, identity: &str) -> u32 {
        self.reconnect.attempts(identity)
    }

    /// Refresh the presence TTL for an identity; best-effort.
    pub async fn refresh_presence(&self, identity: &str) {
        if let Err(e) = self.presence.refresh(identity).await {
            warn!(identity = %identity, error = %e, "Presence refresh failed");
        }
    }

    /// Run one staleness sweep pass; returns the identities disconnected.
    pub async fn sweep_stale_once(&self) -> Vec<String> {
        let stale = self
            .registry
            .stale_identities(self.config.heartbeat.max_idle);
        for identity in &stale {
            warn!(identity = %identity, "Stale session detected by sweep");
            self.force_disconnect(identity, reason::STALE_CONNECTION)
                .await;
        }
        stale
    }

    /// Purge reconnection records idle past the retention window.
    pub fn purge_reconnect_records(&self) -> usize {
        self.reconnect.purge_stale(self.config.reconnect_retention)
    }

    /// Close every session and cancel every owned background task.
    pub async fn shutdown(&self) {
        info!("Gateway shutting down");
        for identity in self.registry.identities() {
            self.force_disconnect(&identity, reason::SERVER_SHUTDOWN)
                .await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
    }
}

/// Hourly purge of reconnection records for identities gone for good.
async fn reconnect_cleanup_loop(gateway: Arc<Gateway>) {
    let interval = gateway.config.reconnect_cleanup_interval;
    loop {
        tokio::time::sleep(interval).await;
        let purged = gateway.purge_reconnect_records();
        if purged > 0 {
            debug!(purged, "Purged stale reconnection records");
        }
    }
}

/// Listen on one fixed broadcast channel and fan payloads out to every
/// local session. Resubscribes after transient store failures.
async fn broadcast_listener(gateway: Arc<Gateway>, channel: String) {
    loop {
        match gateway.store.subscribe(&channel).await {
            Ok(mut subscription) => {
                debug!(channel = %channel, "Broadcast listener subscribed");
                while let Some(payload) = subscription.next().await {
                    match serde_json::from_str::<Value>(&payload) {
                        Ok(value) => gateway.registry.broadcast(&value, None).await,
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "Dropping undecodable broadcast");
                        }
                    }
                }
                warn!(channel = %channel, "Broadcast subscription ended");
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Broadcast subscribe failed");
            }
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}
