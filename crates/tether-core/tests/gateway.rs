//! Full-gateway lifecycle tests.
//!
//! These drive the public [`Gateway`] API end to end over the in-memory
//! store: queue-while-offline, drain-on-reconnect, supersede, heartbeat
//! timeout, and backoff reset.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    reason, DeliveryOutcome, Gateway, GatewayConfig, HeartbeatConfig, SessionCommand,
    SessionHandle, SessionMeta,
};
use tether_store::MemoryStore;
use tokio::time::timeout;

fn gateway(heartbeat: HeartbeatConfig) -> Arc<Gateway> {
    Gateway::new(
        Arc::new(MemoryStore::new()),
        GatewayConfig {
            heartbeat,
            drain_pacing: Duration::from_millis(1),
            ..GatewayConfig::default()
        },
    )
}

/// Receive payloads until the `system/connected` confirmation arrives,
/// returning everything seen up to and including it.
async fn recv_until_connected(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<SessionCommand>,
) -> Vec<Value> {
    let mut seen = Vec::new();
    loop {
        let cmd = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no frame within the window")
            .expect("writer channel closed early");
        match cmd {
            SessionCommand::Send(v) => {
                let done = v["type"] == "system" && v["action"] == "connected";
                seen.push(v);
                if done {
                    return seen;
                }
            }
            SessionCommand::Close { reason } => panic!("unexpected close: {reason}"),
        }
    }
}

#[tokio::test]
async fn test_offline_delivery_is_drained_on_reconnect() {
    let gw = gateway(HeartbeatConfig::default());

    assert_eq!(
        gw.deliver("u1", json!({"n": 1})).await,
        DeliveryOutcome::Queued
    );
    assert_eq!(
        gw.deliver("u1", json!({"n": 2})).await,
        DeliveryOutcome::Queued
    );
    assert_eq!(gw.get_status("u1").await.pending_count, 2);

    let (handle, mut rx) = SessionHandle::channel(SessionMeta::new("u1"));
    let drained = gw.attach_session(handle.clone()).await;
    assert_eq!(drained, 2);

    // Handshake first, then the backlog oldest-first, then confirmation.
    let seen = recv_until_connected(&mut rx).await;
    assert_eq!(seen[0]["type"], "connection_status");
    assert_eq!(seen[1], json!({"n": 1}));
    assert_eq!(seen[2], json!({"n": 2}));
    assert_eq!(seen[3]["data"]["pending_delivered"], 2);

    // Live now: delivery goes straight to the session.
    assert_eq!(
        gw.deliver("u1", json!({"n": 3})).await,
        DeliveryOutcome::Direct
    );
    match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
        Some(SessionCommand::Send(v)) => assert_eq!(v, json!({"n": 3})),
        other => panic!("expected direct delivery, got {other:?}"),
    }

    gw.shutdown().await;
}

#[tokio::test]
async fn test_second_connection_supersedes_first() {
    let gw = gateway(HeartbeatConfig::default());

    let (h1, mut rx1) = SessionHandle::channel(SessionMeta::new("u1"));
    gw.attach_session(h1).await;
    recv_until_connected(&mut rx1).await;

    let (h2, mut rx2) = SessionHandle::channel(SessionMeta::new("u1"));
    gw.attach_session(h2.clone()).await;
    recv_until_connected(&mut rx2).await;

    // The first transport is told why, then closed.
    let notice = loop {
        match timeout(Duration::from_secs(5), rx1.recv()).await.unwrap() {
            Some(SessionCommand::Send(v)) if v["type"] == "system" => break v,
            Some(SessionCommand::Send(_)) => continue,
            other => panic!("expected disconnect notice, got {other:?}"),
        }
    };
    assert_eq!(notice["action"], "disconnect");
    assert_eq!(notice["data"]["reason"], reason::NEW_CONNECTION);
    match timeout(Duration::from_secs(5), rx1.recv()).await.unwrap() {
        Some(SessionCommand::Close { reason: r }) => assert_eq!(r, reason::NEW_CONNECTION),
        other => panic!("expected close, got {other:?}"),
    }

    assert_eq!(gw.registry().len(), 1);
    let current = gw.registry().lookup("u1").expect("u1 should be registered");
    assert_eq!(current.meta().session_id, h2.meta().session_id);

    gw.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_client_is_timed_out() {
    // Production timings; paused time auto-advances through them.
    let gw = gateway(HeartbeatConfig::default());

    let (handle, mut rx) = SessionHandle::channel(SessionMeta::new("u1"));
    gw.attach_session(handle).await;

    // The client answers nothing; probes go unacknowledged until the
    // miss limit forces a disconnect.
    let closed = loop {
        match rx.recv().await.expect("writer channel closed early") {
            SessionCommand::Close { reason } => break reason,
            SessionCommand::Send(_) => continue,
        }
    };
    assert_eq!(closed, reason::PING_TIMEOUT);

    timeout(Duration::from_secs(5), async {
        while gw.registry().is_connected("u1") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("session not unregistered after timeout");

    let status = gw.get_status("u1").await;
    assert!(!status.online);
    assert!(status.last_seen.is_some());

    gw.shutdown().await;
}

#[tokio::test]
async fn test_failed_attempts_back_off_until_successful_attach() {
    let gw = gateway(HeartbeatConfig::default());

    let first = gw.record_connect_failure("u1").await;
    let second = gw.record_connect_failure("u1").await;
    assert_eq!(gw.reconnect_attempts("u1"), 2);
    assert!(second > first);

    // A successful attach resets the counter.
    let (handle, _rx) = SessionHandle::channel(SessionMeta::new("u1"));
    gw.attach_session(handle).await;
    assert_eq!(gw.reconnect_attempts("u1"), 0);

    gw.shutdown().await;
}
