//! Live session handles.
//!
//! A session binds one identity to one transport in this process. The
//! transport itself stays in the server layer; core code only sees the
//! [`SessionHandle`], whose command channel serializes every write to the
//! connection: probes, drained messages, and relayed messages share this
//! one write path, so concurrent tasks can never interleave on the socket.

use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tether_protocol::Frame;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Disconnect reasons used across the gateway.
pub mod reason {
    /// A newer connection for the same identity superseded this one.
    pub const NEW_CONNECTION: &str = "new_connection";
    /// Three consecutive liveness probes went unacknowledged.
    pub const PING_TIMEOUT: &str = "ping_timeout";
    /// The staleness sweep found the session idle past the limit.
    pub const STALE_CONNECTION: &str = "stale_connection";
    /// The client closed or the transport failed.
    pub const CLIENT_DISCONNECT: &str = "client_disconnect";
    /// A direct send failed mid-delivery.
    pub const SEND_FAILED: &str = "exception_on_send";
    /// A broadcast fanout send failed.
    pub const BROADCAST_FAILED: &str = "exception_on_broadcast";
    /// The gateway is shutting down.
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Metadata for a live session.
#[derive(Debug)]
pub struct SessionMeta {
    /// Unique id for this session, reported in `connection_status`.
    pub session_id: Uuid,
    /// The authenticated identity bound to this session.
    pub identity: String,
    /// When the session was registered, millis since epoch.
    pub connected_at: u64,
    /// Last inbound activity, millis since epoch.
    last_activity: AtomicU64,
    /// Last liveness acknowledgment, millis since epoch.
    last_ack: AtomicU64,
    /// Consecutive unacknowledged probes.
    missed_probes: AtomicU32,
}

impl SessionMeta {
    /// Create metadata for a freshly authenticated session.
    #[must_use]
    pub fn new(identity: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            session_id: Uuid::new_v4(),
            identity: identity.into(),
            connected_at: now,
            last_activity: AtomicU64::new(now),
            last_ack: AtomicU64::new(now),
            missed_probes: AtomicU32::new(0),
        }
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Record a liveness acknowledgment; clears the missed-probe counter.
    pub fn record_ack(&self) {
        self.last_ack.store(now_millis(), Ordering::Relaxed);
        self.missed_probes.store(0, Ordering::Relaxed);
        self.touch();
    }

    /// Whether an acknowledgment arrived at or after the given probe time.
    #[must_use]
    pub fn acked_since(&self, probe_sent_at: u64) -> bool {
        self.last_ack.load(Ordering::Relaxed) >= probe_sent_at
    }

    /// Count a missed probe; returns the new consecutive-miss total.
    pub fn record_missed_probe(&self) -> u32 {
        self.missed_probes.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Clear the missed-probe counter.
    pub fn clear_missed_probes(&self) {
        self.missed_probes.store(0, Ordering::Relaxed);
    }

    /// How long the session has been without inbound activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }
}

/// Commands consumed by a session's single writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Serialize this value and write it to the transport.
    Send(Value),
    /// Close the transport with the given reason.
    Close { reason: String },
}

/// Cloneable handle to a live session's write path.
#[derive(Clone)]
pub struct SessionHandle {
    meta: Arc<SessionMeta>,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Create a handle and the command receiver its writer task consumes.
    #[must_use]
    pub fn channel(meta: SessionMeta) -> (Self, mpsc::UnboundedReceiver<SessionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                meta: Arc::new(meta),
                tx,
            },
            rx,
        )
    }

    /// The session's metadata.
    #[must_use]
    pub fn meta(&self) -> &Arc<SessionMeta> {
        &self.meta
    }

    /// The identity bound to this session.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.meta.identity
    }

    /// Queue a JSON payload for the writer task. Returns `false` if the
    /// writer is gone (the session is closed or closing).
    pub fn send(&self, payload: Value) -> bool {
        self.tx.send(SessionCommand::Send(payload)).is_ok()
    }

    /// Queue a protocol frame for the writer task.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        match frame.to_value() {
            Ok(value) => self.send(value),
            Err(e) => {
                warn!(identity = %self.meta.identity, error = %e, "Unencodable frame dropped");
                false
            }
        }
    }

    /// Ask the writer task to close the transport.
    pub fn close(&self, reason: &str) -> bool {
        self.tx
            .send(SessionCommand::Close {
                reason: reason.to_string(),
            })
            .is_ok()
    }

    /// Whether the writer task is still consuming commands.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
