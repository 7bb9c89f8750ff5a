//! # tether-protocol
//!
//! Wire frame schema for the Tether realtime gateway.
//!
//! Frames are JSON objects exchanged over a full-duplex transport:
//!
//! ```json
//! {"type": "chat_message", "data": {"recipient_id": "u2", "content": "hi"}}
//! ```
//!
//! Two families of payloads exist:
//!
//! - [`Frame`]: connection-control and relay frames understood by the
//!   session protocol handler (`ping`, `system`, `chat_message`, ...).
//! - [`Notification`]: domain events produced by business workflows
//!   (`offer` accepted, `product` sold, ...). The gateway treats these as
//!   opaque JSON and never interprets them.
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{frames, Frame};
//!
//! let frame = frames::parse(r#"{"type":"heartbeat_response"}"#).unwrap();
//! assert!(matches!(frame, Frame::HeartbeatResponse { .. }));
//! ```

pub mod event;
pub mod frames;

pub use event::{EventAction, EventKind, Notification};
pub use frames::{Frame, ProtocolError, SystemAction, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
