//! Frame types for the Tether protocol.
//!
//! Every frame is a JSON object tagged by its `type` field. Inbound frames
//! arrive from clients; server frames are emitted by the gateway. A frame
//! whose `type` is unrecognized (or whose body does not match the schema)
//! is a [`ProtocolError::Malformed`]; the connection handler logs and
//! ignores it without closing the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// WebSocket close code sent when authentication fails (policy violation).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// WebSocket close code for a normal, server-initiated close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON or does not match the schema.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Actions carried by `system` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemAction {
    /// Post-drain confirmation that the session is live.
    Connected,
    /// The server is about to close this connection.
    Disconnect,
    /// Backoff guidance for the client's next reconnect attempt.
    ReconnectInfo,
}

/// Body of an inbound `chat_message` frame, relayed to another identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// Identity the message is addressed to.
    pub recipient_id: String,
    /// Filled in by the server before relaying; clients cannot spoof it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Any additional fields the client attached.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Body of an inbound `offer` frame, relayed to the product's seller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferBid {
    /// Identity of the seller the offer is addressed to.
    pub seller_id: String,
    /// Filled in by the server before relaying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Body of the `connection_status` frame sent right after a successful
/// handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub status: String,
    pub session_id: Uuid,
    /// RFC 3339 server timestamp.
    pub server_time: String,
    /// Probe interval the client should expect, in seconds.
    pub ping_interval: u64,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client-to-client chat relay.
    ChatMessage { data: DirectMessage },

    /// Catalog update fanned out on the `product_updates` broadcast channel.
    ProductUpdate { data: Value },

    /// Offer relayed to a seller.
    Offer { data: OfferBid },

    /// Liveness acknowledgment for a server probe. No payload effect.
    HeartbeatResponse {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },

    /// Server liveness probe; clients answer with `heartbeat_response`.
    Ping { data: PingData },

    /// Plain server keepalive carrying no payload and expecting no reply.
    Heartbeat,

    /// Connection lifecycle notice (connected, disconnect, reconnect_info).
    System { action: SystemAction, data: Value },

    /// Post-handshake session info.
    ConnectionStatus { data: SessionInfo },

    /// Terminal error notice, sent once before an error close.
    Error { data: Value },
}

/// Body of a `ping` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingData {
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: u64,
}

impl Frame {
    /// Create a `ping` probe frame.
    #[must_use]
    pub fn ping(timestamp: u64) -> Self {
        Frame::Ping {
            data: PingData { timestamp },
        }
    }

    /// Create a `heartbeat` keepalive frame.
    #[must_use]
    pub fn heartbeat() -> Self {
        Frame::Heartbeat
    }

    /// Create a `system` frame.
    #[must_use]
    pub fn system(action: SystemAction, data: Value) -> Self {
        Frame::System { action, data }
    }

    /// Create the `system/disconnect` notice sent before a forced close.
    #[must_use]
    pub fn disconnect_notice(reason: &str) -> Self {
        Frame::system(
            SystemAction::Disconnect,
            serde_json::json!({ "reason": reason }),
        )
    }

    /// Create the `system/connected` confirmation emitted once the pending
    /// queue has been drained.
    #[must_use]
    pub fn connected_notice(drained: usize) -> Self {
        Frame::system(
            SystemAction::Connected,
            serde_json::json!({ "message": "connected", "pending_delivered": drained }),
        )
    }

    /// Create a `connection_status` frame.
    #[must_use]
    pub fn connection_status(session_id: Uuid, server_time: String, ping_interval: u64) -> Self {
        Frame::ConnectionStatus {
            data: SessionInfo {
                status: "connected".to_string(),
                session_id,
                server_time,
                ping_interval,
            },
        }
    }

    /// Create an `error` frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            data: serde_json::json!({ "message": message.into() }),
        }
    }

    /// Serialize the frame to a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (should not happen for
    /// well-formed frames).
    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Parse an inbound text frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] for invalid JSON or an
/// unrecognized frame shape.
pub fn parse(text: &str) -> Result<Frame, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Render a frame to its wire representation.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn render(frame: &Frame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}
