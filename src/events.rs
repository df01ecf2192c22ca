//! Best-effort lifecycle notifications.
//!
//! Publishing never blocks and never fails: with no subscribers, or with
//! events disabled, notifications are simply dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::trace;

use crate::infection::InfectionId;

pub const EVENT_VERSION: &str = "1.0";
pub const EVENT_SOURCE: &str = "core";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Installing,
    Installed,
    Started,
    Stopped,
    Restarted,
    Failed,
    Removed,
    Updated,
    SystemStarted,
    SystemStopping,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "infection.installing",
            Self::Installed => "infection.installed",
            Self::Started => "infection.started",
            Self::Stopped => "infection.stopped",
            Self::Restarted => "infection.restarted",
            Self::Failed => "infection.failed",
            Self::Removed => "infection.removed",
            Self::Updated => "infection.updated",
            Self::SystemStarted => "system.started",
            Self::SystemStopping => "system.stopping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub version: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Event {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            version: EVENT_VERSION.to_string(),
            source: EVENT_SOURCE.to_string(),
            event_type: kind.as_str().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Event about one infection; `extra` object fields are merged into the
    /// payload next to `infectionId`.
    pub fn infection(kind: EventKind, id: &InfectionId, extra: Value) -> Self {
        let mut payload = json!({ "infectionId": id.as_str() });
        if let (Some(target), Value::Object(fields)) = (payload.as_object_mut(), extra) {
            target.extend(fields);
        }
        Self::new(kind, payload)
    }

    pub fn infection_id(&self) -> Option<&str> {
        self.payload.get("infectionId").and_then(Value::as_str)
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);

    /// A receiver for subsequent events, or `None` when streaming is off.
    fn subscribe(&self) -> Option<broadcast::Receiver<Event>>;

    fn enabled(&self) -> bool;
}

/// Sink used when events are disabled.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, event: Event) {
        trace!(event_type = %event.event_type, "Events disabled, dropping");
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Event>> {
        None
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// In-process fan-out to `subscribeEvents` connections. Slow subscribers
/// lag and lose events rather than slowing publishers.
pub struct BroadcastSink {
    sender: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: Event) {
        trace!(event_type = %event.event_type, "Publishing event");
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Event>> {
        Some(self.sender.subscribe())
    }

    fn enabled(&self) -> bool {
        true
    }
}
