//! Connection liveness monitoring.
//!
//! Two complementary mechanisms:
//!
//! - a per-session probe loop sends a `ping` frame at a fixed interval and
//!   waits a bounded time for the client's `heartbeat_response`; three
//!   consecutive misses force-disconnect the session;
//! - a process-wide sweep force-disconnects sessions with no inbound
//!   activity past an idle limit, catching half-open transports whose
//!   probe loop cannot observe the failure (the send still "succeeds").

use crate::gateway::Gateway;
use crate::session::{now_millis, reason, SessionHandle};
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::Frame;
use tracing::{debug, warn};

/// Timing knobs for the heartbeat monitor.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often to probe each session.
    pub interval: Duration,
    /// How long to wait for an acknowledgment after a probe.
    pub timeout: Duration,
    /// Consecutive misses that force a disconnect.
    pub max_missed: u32,
    /// How often the staleness sweep runs.
    pub sweep_interval: Duration,
    /// Inbound-activity gap past which a session counts as stale.
    pub max_idle: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            max_missed: 3,
            sweep_interval: Duration::from_secs(60),
            max_idle: Duration::from_secs(120),
        }
    }
}

/// Probe one session until it closes or stops answering.
///
/// Runs as a background task owned by the session's registry entry; it is
/// aborted on unregister, so it never outlives the session.
pub(crate) async fn probe_loop(gateway: Arc<Gateway>, handle: SessionHandle) {
    let config = gateway.config().heartbeat.clone();
    let identity = handle.identity().to_string();
    let meta = handle.meta().clone();

    loop {
        tokio::time::sleep(config.interval).await;

        let sent_at = now_millis();
        if !handle.send_frame(&Frame::ping(sent_at)) {
            debug!(identity = %identity, "Probe target gone; stopping probe loop");
            gateway
                .detach_session(&identity, reason::CLIENT_DISCONNECT)
                .await;
            break;
        }

        tokio::time::sleep(config.timeout).await;

        if meta.acked_since(sent_at) {
            meta.clear_missed_probes();
            gateway.refresh_presence(&identity).await;
            continue;
        }

        let missed = meta.record_missed_probe();
        warn!(identity = %identity, missed, "Liveness probe unacknowledged");

        if missed >= config.max_missed {
            warn!(identity = %identity, "Probe limit reached; forcing disconnect");
            gateway
                .force_disconnect(&identity, reason::PING_TIMEOUT)
                .await;
            break;
        }
    }
}

/// Emit a bare `heartbeat` keepalive at the probe interval. No reply is
/// expected; it holds idle intermediaries open between probes.
pub(crate) async fn keepalive_loop(handle: SessionHandle, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if !handle.send_frame(&Frame::heartbeat()) {
            break;
        }
    }
}

/// Periodically force-disconnect sessions idle past the limit.
pub(crate) async fn sweep_loop(gateway: Arc<Gateway>) {
    let config = gateway.config().heartbeat.clone();
    loop {
        tokio::time::sleep(config.sweep_interval).await;
        let swept = gateway.sweep_stale_once().await;
        if !swept.is_empty() {
            warn!(count = swept.len(), "Staleness sweep disconnected sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Gateway, GatewayConfig};
    use crate::session::{SessionCommand, SessionMeta};
    use serde_json::json;
    use tether_store::MemoryStore;
    use tokio::time::timeout;

    const LONG: Duration = Duration::from_secs(3600);
    const TICK: Duration = Duration::from_millis(10);

    fn gateway_with(heartbeat: HeartbeatConfig) -> Arc<Gateway> {
        Gateway::new(
            Arc::new(MemoryStore::new()),
            GatewayConfig {
                heartbeat,
                drain_pacing: Duration::from_millis(1),
                ..GatewayConfig::default()
            },
        )
    }

    /// Drive a fake client: answer every ping until `acks` run out, then
    /// go silent and report the close reason.
    async fn run_client(
        handle: crate::session::SessionHandle,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<SessionCommand>,
        mut acks: u32,
    ) -> Option<String> {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                SessionCommand::Send(v) if v["type"] == "ping" => {
                    if acks > 0 {
                        acks -= 1;
                        handle.meta().record_ack();
                    }
                }
                SessionCommand::Send(_) => {}
                SessionCommand::Close { reason } => return Some(reason),
            }
        }
        None
    }

    #[tokio::test]
    async fn test_unanswered_probes_force_ping_timeout() {
        let gw = gateway_with(HeartbeatConfig {
            interval: TICK,
            timeout: TICK,
            max_missed: 3,
            sweep_interval: LONG,
            max_idle: LONG,
        });

        let (handle, rx) = crate::session::SessionHandle::channel(SessionMeta::new("u1"));
        gw.attach_session(handle.clone()).await;

        // Two answered probes keep the session alive; then silence.
        let client = tokio::spawn(run_client(handle, rx, 2));
        let closed = timeout(Duration::from_secs(5), client)
            .await
            .expect("client never closed")
            .unwrap();

        assert_eq!(closed.as_deref(), Some(reason::PING_TIMEOUT));
        assert!(!gw.registry().is_connected("u1"));
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_answered_probes_keep_session_alive() {
        let gw = gateway_with(HeartbeatConfig {
            interval: TICK,
            timeout: TICK,
            max_missed: 3,
            sweep_interval: LONG,
            max_idle: LONG,
        });

        let (handle, rx) = crate::session::SessionHandle::channel(SessionMeta::new("u1"));
        gw.attach_session(handle.clone()).await;
        let client = tokio::spawn(run_client(handle, rx, u32::MAX));

        tokio::time::sleep(TICK * 20).await;
        assert!(gw.registry().is_connected("u1"));

        gw.shutdown().await;
        let closed = timeout(Duration::from_secs(5), client).await.unwrap().unwrap();
        assert_eq!(closed.as_deref(), Some(reason::SERVER_SHUTDOWN));
    }

    #[tokio::test]
    async fn test_keepalive_frames_are_emitted() {
        let gw = gateway_with(HeartbeatConfig {
            interval: TICK,
            timeout: LONG,
            max_missed: 3,
            sweep_interval: LONG,
            max_idle: LONG,
        });

        let (handle, mut rx) = crate::session::SessionHandle::channel(SessionMeta::new("u1"));
        gw.attach_session(handle).await;

        let saw_keepalive = timeout(Duration::from_secs(5), async {
            while let Some(cmd) = rx.recv().await {
                if let SessionCommand::Send(v) = cmd {
                    if v["type"] == "heartbeat" {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .expect("no keepalive within the window");

        assert!(saw_keepalive);
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_disconnects_idle_sessions() {
        let gw = gateway_with(HeartbeatConfig {
            interval: LONG,
            timeout: LONG,
            max_missed: 3,
            sweep_interval: TICK,
            max_idle: Duration::ZERO,
        });

        let (handle, rx) = crate::session::SessionHandle::channel(SessionMeta::new("u1"));
        gw.attach_session(handle.clone()).await;
        let client = tokio::spawn(run_client(handle, rx, 0));

        let closed = timeout(Duration::from_secs(5), client)
            .await
            .expect("sweep never fired")
            .unwrap();
        assert_eq!(closed.as_deref(), Some(reason::STALE_CONNECTION));
        assert!(!gw.registry().is_connected("u1"));
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_after_timeout_drains_missed_messages() {
        let gw = gateway_with(HeartbeatConfig {
            interval: TICK,
            timeout: TICK,
            max_missed: 3,
            sweep_interval: LONG,
            max_idle: LONG,
        });

        // First life: connects, answers nothing, gets timed out.
        let (h1, rx1) = crate::session::SessionHandle::channel(SessionMeta::new("u1"));
        gw.attach_session(h1.clone()).await;
        let closed = timeout(Duration::from_secs(5), tokio::spawn(run_client(h1, rx1, 0)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.as_deref(), Some(reason::PING_TIMEOUT));

        // A failed retry grows the backoff; delivery while offline queues.
        gw.record_connect_failure("u1").await;
        assert_eq!(gw.reconnect_attempts("u1"), 1);
        assert_eq!(
            gw.deliver("u1", json!({"missed": true})).await,
            crate::gateway::DeliveryOutcome::Queued
        );

        // Second life: the backlog arrives before the connected notice and
        // the attempt counter is reset.
        let (h2, mut rx2) = crate::session::SessionHandle::channel(SessionMeta::new("u1"));
        let drained = gw.attach_session(h2).await;
        assert_eq!(drained, 1);
        assert_eq!(gw.reconnect_attempts("u1"), 0);

        let mut seen = Vec::new();
        while let Ok(SessionCommand::Send(v)) = rx2.try_recv() {
            seen.push(v);
        }
        assert_eq!(seen[0]["type"], "connection_status");
        assert_eq!(seen[1], json!({"missed": true}));
        assert_eq!(seen[2]["data"]["pending_delivered"], 1);

        gw.shutdown().await;
    }
}
