//! Domain event notifications.
//!
//! Business workflows (order, offer and messaging pipelines, scheduled
//! sweeps) produce these and hand them to the gateway's `deliver` API.
//! From the gateway's point of view a notification is an opaque JSON
//! value; this module only exists so producers build well-formed ones.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The domain entity a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Offer,
    Transaction,
    Product,
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Created,
    Updated,
    Accepted,
    Rejected,
    Cancelled,
    Expired,
    Sold,
}

/// A domain event notification: `{"type": kind, "action": action, "data": …}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub action: EventAction,
    pub data: Value,
}

impl Notification {
    /// Build a notification.
    #[must_use]
    pub fn new(kind: EventKind, action: EventAction, data: Value) -> Self {
        Self { kind, action, data }
    }

    /// Serialize to the JSON value handed to `deliver`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
