//! Event records routed over the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of event categories carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A turn request or reply between agents.
    Message,
    /// A subscriber joined (or rejoined).
    Join,
    /// A subscriber left.
    Leave,
    /// Liveness refresh.
    Heartbeat,
    /// Bus-internal notifications (restart exhausted, fallback, ...).
    System,
}

/// One routed event. Immutable once appended to the log; `seq` is globally
/// monotonic and assigned at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub event_name: String,
    pub publisher_id: String,
    pub target: String,
    pub payload: Value,
}

impl Event {
    /// Build an unsequenced event; the log assigns `seq` on append.
    pub fn new(
        kind: EventKind,
        event_name: impl Into<String>,
        publisher_id: impl Into<String>,
        target: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            kind,
            event_name: event_name.into(),
            publisher_id: publisher_id.into(),
            target: target.into(),
            payload,
        }
    }

    /// A plain text message event.
    pub fn message(
        publisher_id: impl Into<String>,
        target: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            EventKind::Message,
            "agent.message",
            publisher_id,
            target,
            serde_json::json!({ "message": text.into() }),
        )
    }
}
