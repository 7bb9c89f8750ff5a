//! # tether-core
//!
//! Connection registry, session lifecycle, and notification delivery for
//! the Tether realtime gateway.
//!
//! The central type is the [`Gateway`]: an explicitly constructed service
//! that owns the process-local [`ConnectionRegistry`], the durable pending
//! queue and presence stores, the reconnection tracker, and every
//! background task it spawns (staleness sweep, reconnect-record cleanup,
//! broadcast-channel listeners). Producers hand it
//! `deliver(identity, payload)` and it guarantees delivery-or-queue:
//!
//! ```text
//! deliver ──▶ locally connected? ──▶ send on the session's write channel
//!                   │
//!                   └─ no ──▶ publish to identity:{id}:notifications
//!                             AND enqueue durably (pub/sub gives no
//!                             receipt, so the queue is the guarantee)
//! ```
//!
//! Each live session is represented by a [`SessionHandle`]: all writers
//! (the receive loop, the heartbeat probe loop, the pub/sub listener, the
//! pending-queue drain) funnel through its command channel, and exactly
//! one writer task per connection owns the socket sink.

pub mod backoff;
pub mod gateway;
pub mod heartbeat;
pub mod reconnect;
pub mod registry;
pub mod session;

pub use backoff::{backoff, backoff_with_jitter};
pub use gateway::{DeliveryOutcome, Gateway, GatewayConfig, IdentityStatus};
pub use heartbeat::HeartbeatConfig;
pub use reconnect::ReconnectTracker;
pub use registry::ConnectionRegistry;
pub use session::{reason, SessionCommand, SessionHandle, SessionMeta};
