use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized change kind, independent of the sender's wire vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

impl EventType {
    /// Map a sender verb onto the canonical kind. Case-insensitive.
    pub fn from_wire(verb: &str) -> Option<Self> {
        match verb.trim().to_ascii_lowercase().as_str() {
            "created" | "create" | "insert" | "inserted" | "added" => Some(EventType::Created),
            "updated" | "update" | "edit" | "edited" | "modified" => Some(EventType::Updated),
            "deleted" | "delete" | "remove" | "removed" => Some(EventType::Deleted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Updated => "updated",
            EventType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Queued,
    Processing,
    Succeeded,
    DeadLettered,
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Succeeded | EventStatus::DeadLettered)
    }
}

/// Canonical event record. This is the JSON form that lives in the work
/// queue, the delayed-retry set and the dead-letter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub module: String,
    pub record_id: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub signature_verified: bool,
    pub retry_count: u32,
    pub status: EventStatus,
}

impl WebhookEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Dequeued events are processing until they reach a terminal state.
    /// A retried event stays in processing; it never returns to queued.
    pub fn begin_processing(&mut self) {
        if !self.status.is_terminal() {
            self.status = EventStatus::Processing;
        }
    }
}

/// An event that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event: WebhookEvent,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Per-subscription bookkeeping persisted by the registration manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub module: String,
    pub event_types: Vec<EventType>,
    pub remote_webhook_id: String,
    pub secret: String,
    pub callback_url: String,
    pub status: String, // "active" | "paused"
    pub created_at: String,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}
