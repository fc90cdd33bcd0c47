//! Wire payload normalization.
//!
//! The CRM has emitted three payload layouts over time. Each one is a
//! [`WirePayload`] variant; shape detection happens once, up front, and
//! everything after it works on the canonical [`NormalizedEvent`].

use crate::types::{EventStatus, EventType, WebhookEvent};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::str::FromStr;
use thiserror::Error;

const MAX_EVENT_ID_LEN: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload does not match any known webhook shape")]
    UnrecognizedShape,

    #[error("payload does not match the {0} shape: {1}")]
    ShapeMismatch(&'static str, String),

    #[error("payload is missing the module")]
    MissingModule,

    #[error("payload is missing the record identity")]
    MissingRecordId,

    #[error("unknown event type: {0:?}")]
    UnknownEventType(String),

    #[error("module {0:?} has no active subscription")]
    ModuleNotSubscribed(String),

    #[error("notification carries {0} record ids; expected exactly one")]
    MultipleRecords(usize),

    #[error("event id is empty or longer than {MAX_EVENT_ID_LEN} characters")]
    InvalidEventId,
}

/// Caller's hint about which layout to expect (`X-Webhook-Format`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatHint {
    #[default]
    Auto,
    Flat,
    Nested,
    Notification,
}

impl FromStr for FormatHint {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(FormatHint::Auto),
            "flat" => Ok(FormatHint::Flat),
            "nested" => Ok(FormatHint::Nested),
            "notification" => Ok(FormatHint::Notification),
            _ => Err(()),
        }
    }
}

// ─── Wire shapes ────────────────────────────────────────────────────────────

/// `{ "module", "event_type" | "operation", "record_id" | "id", "data"? }`
#[derive(Debug, Deserialize)]
pub struct FlatPayload {
    event_id: Option<String>,
    module: Option<String>,
    #[serde(alias = "operation")]
    event_type: Option<String>,
    #[serde(alias = "id")]
    record_id: Option<Value>,
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct NestedEventHeader {
    module: Option<String>,
    #[serde(rename = "type", alias = "event_type", alias = "operation")]
    kind: Option<String>,
}

/// `{ "event": { "module", "type" }, "record": { "id", ... } }`
#[derive(Debug, Deserialize)]
pub struct NestedPayload {
    event_id: Option<String>,
    event: NestedEventHeader,
    record: Option<Value>,
}

/// `{ "module", "operation", "ids": [..], "token"?, "channel_id"? }`
#[derive(Debug, Deserialize)]
pub struct NotificationPayload {
    module: Option<String>,
    operation: Option<String>,
    #[serde(default)]
    ids: Vec<Value>,
    channel_id: Option<Value>,
}

#[derive(Debug)]
pub enum WirePayload {
    Flat(FlatPayload, Value),
    Nested(NestedPayload),
    Notification(NotificationPayload),
}

impl WirePayload {
    /// Pick the layout for `body`, honouring an explicit hint.
    pub fn detect(body: Value, hint: FormatHint) -> Result<Self, NormalizationError> {
        let hint = match hint {
            FormatHint::Auto => auto_detect(&body)?,
            other => other,
        };

        match hint {
            FormatHint::Flat => {
                let flat = serde_json::from_value::<FlatPayload>(body.clone())
                    .map_err(|e| NormalizationError::ShapeMismatch("flat", e.to_string()))?;
                Ok(WirePayload::Flat(flat, body))
            }
            FormatHint::Nested => serde_json::from_value::<NestedPayload>(body)
                .map(WirePayload::Nested)
                .map_err(|e| NormalizationError::ShapeMismatch("nested", e.to_string())),
            FormatHint::Notification => serde_json::from_value::<NotificationPayload>(body)
                .map(WirePayload::Notification)
                .map_err(|e| NormalizationError::ShapeMismatch("notification", e.to_string())),
            FormatHint::Auto => Err(NormalizationError::UnrecognizedShape),
        }
    }
}

fn auto_detect(body: &Value) -> Result<FormatHint, NormalizationError> {
    let obj = body.as_object().ok_or(NormalizationError::UnrecognizedShape)?;
    if obj.get("ids").is_some_and(Value::is_array) {
        Ok(FormatHint::Notification)
    } else if obj.get("event").is_some_and(Value::is_object) {
        Ok(FormatHint::Nested)
    } else if obj.contains_key("module") {
        Ok(FormatHint::Flat)
    } else {
        Err(NormalizationError::UnrecognizedShape)
    }
}

// ─── Canonical form ─────────────────────────────────────────────────────────

/// The canonical event, before the receiver stamps acceptance metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub module: String,
    pub record_id: String,
    pub event_type: EventType,
    pub payload: Value,
}

impl NormalizedEvent {
    /// Stamp acceptance. Only called once the signature has been verified.
    pub fn into_webhook_event(self, received_at: DateTime<Utc>) -> WebhookEvent {
        WebhookEvent {
            event_id: self.event_id,
            module: self.module,
            record_id: self.record_id,
            event_type: self.event_type,
            payload: self.payload,
            received_at,
            signature_verified: true,
            retry_count: 0,
            status: EventStatus::Queued,
        }
    }
}

struct Extracted {
    body_event_id: Option<String>,
    module: Option<String>,
    verb: Option<String>,
    record_id: Option<String>,
    payload: Value,
}

fn extract(wire: WirePayload) -> Result<Extracted, NormalizationError> {
    match wire {
        WirePayload::Flat(flat, whole) => Ok(Extracted {
            body_event_id: flat.event_id,
            module: flat.module,
            verb: flat.event_type,
            record_id: flat.record_id.as_ref().and_then(scalar_string),
            payload: flat.data.unwrap_or(whole),
        }),
        WirePayload::Nested(nested) => {
            let record = nested.record.unwrap_or(Value::Null);
            Ok(Extracted {
                body_event_id: nested.event_id,
                module: nested.event.module,
                verb: nested.event.kind,
                record_id: record.get("id").and_then(scalar_string),
                payload: record,
            })
        }
        WirePayload::Notification(note) => {
            if note.ids.len() > 1 {
                return Err(NormalizationError::MultipleRecords(note.ids.len()));
            }
            let record_id = note.ids.first().and_then(scalar_string);
            // The verification token is deliberately not carried forward.
            let payload = serde_json::json!({
                "ids": note.ids,
                "channel_id": note.channel_id,
            });
            Ok(Extracted {
                body_event_id: None,
                module: note.module,
                verb: note.operation,
                record_id,
                payload,
            })
        }
    }
}

fn scalar_string(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

/// Deterministic event id for payloads that do not carry one.
///
/// Built from the record's identity alone. Time never takes part: senders
/// restamp retried deliveries, and those must map onto the same dedup key.
pub fn derive_event_id(module: &str, record_id: &str, event_type: EventType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(module.as_bytes());
    hasher.update([0x1f]);
    hasher.update(record_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(event_type.as_str().as_bytes());
    format!("evt_{}", hex::encode(hasher.finalize()))
}

fn clean_event_id(raw: &str) -> Result<String, NormalizationError> {
    let id = raw.trim();
    if id.is_empty() || id.len() > MAX_EVENT_ID_LEN {
        return Err(NormalizationError::InvalidEventId);
    }
    Ok(id.to_string())
}

// ─── Normalizer ─────────────────────────────────────────────────────────────

/// Normalizer with an optional module allowlist. An empty allowlist accepts
/// every module.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    allowed_modules: HashSet<String>,
}

impl Normalizer {
    pub fn new<I, S>(allowed_modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_modules: allowed_modules
                .into_iter()
                .map(|m| m.as_ref().trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn normalize(
        &self,
        raw: &[u8],
        hint: FormatHint,
        explicit_event_id: Option<&str>,
    ) -> Result<NormalizedEvent, NormalizationError> {
        let body: Value = serde_json::from_slice(raw)
            .map_err(|e| NormalizationError::InvalidJson(e.to_string()))?;
        let parts = extract(WirePayload::detect(body, hint)?)?;

        let module = parts
            .module
            .map(|m| m.trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty())
            .ok_or(NormalizationError::MissingModule)?;

        if !self.allowed_modules.is_empty() && !self.allowed_modules.contains(&module) {
            return Err(NormalizationError::ModuleNotSubscribed(module));
        }

        let record_id = parts.record_id.ok_or(NormalizationError::MissingRecordId)?;

        let verb = parts.verb.unwrap_or_default();
        let event_type =
            EventType::from_wire(&verb).ok_or(NormalizationError::UnknownEventType(verb))?;

        let event_id = match explicit_event_id.or(parts.body_event_id.as_deref()) {
            Some(id) => clean_event_id(id)?,
            None => derive_event_id(&module, &record_id, event_type),
        };

        Ok(NormalizedEvent {
            event_id,
            module,
            record_id,
            event_type,
            payload: parts.payload,
        })
    }
}

/// Normalize without a module allowlist.
pub fn normalize(raw: &[u8], hint: FormatHint) -> Result<NormalizedEvent, NormalizationError> {
    Normalizer::default().normalize(raw, hint, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn bytes(v: Value) -> Vec<u8> {
        serde_json::to_vec(&v).unwrap()
    }

    #[test]
    fn flat_shape_with_explicit_id() {
        let raw = bytes(json!({
            "event_id": "ev-1",
            "module": "Contact",
            "event_type": "updated",
            "record_id": "42",
            "data": {"id": "42", "email": "a@example.com"}
        }));
        let ev = normalize(&raw, FormatHint::Auto).unwrap();
        assert_eq!(ev.event_id, "ev-1");
        assert_eq!(ev.module, "contact");
        assert_eq!(ev.record_id, "42");
        assert_eq!(ev.event_type, EventType::Updated);
        assert_eq!(ev.payload["email"], "a@example.com");
    }

    #[test]
    fn flat_shape_accepts_operation_and_numeric_id() {
        let raw = bytes(json!({"module": "account", "operation": "insert", "id": 7}));
        let ev = normalize(&raw, FormatHint::Flat).unwrap();
        assert_eq!(ev.record_id, "7");
        assert_eq!(ev.event_type, EventType::Created);
        // Without a data field the whole body is the payload.
        assert_eq!(ev.payload["module"], "account");
        assert!(ev.event_id.starts_with("evt_"));
    }

    #[test]
    fn nested_shape() {
        let raw = bytes(json!({
            "event": {"module": "deal", "type": "deleted"},
            "record": {"id": "d-9", "stage": "lost"}
        }));
        let ev = normalize(&raw, FormatHint::Auto).unwrap();
        assert_eq!(ev.module, "deal");
        assert_eq!(ev.record_id, "d-9");
        assert_eq!(ev.event_type, EventType::Deleted);
        assert_eq!(ev.payload["stage"], "lost");
    }

    #[test]
    fn notification_shape_drops_token() {
        let raw = bytes(json!({
            "module": "Leads",
            "operation": "update",
            "ids": ["1001"],
            "token": "verification-token",
            "channel_id": 55
        }));
        let ev = normalize(&raw, FormatHint::Auto).unwrap();
        assert_eq!(ev.module, "leads");
        assert_eq!(ev.record_id, "1001");
        assert!(ev.payload.get("token").is_none());
        assert_eq!(ev.payload["channel_id"], 55);
    }

    #[test]
    fn notification_with_many_ids_is_rejected() {
        let raw = bytes(json!({"module": "leads", "operation": "update", "ids": ["1", "2"]}));
        assert_eq!(
            normalize(&raw, FormatHint::Auto),
            Err(NormalizationError::MultipleRecords(2))
        );
    }

    #[test]
    fn header_id_wins_over_body_id() {
        let raw = bytes(json!({"event_id": "body", "module": "contact", "event_type": "created", "id": "1"}));
        let ev = Normalizer::default()
            .normalize(&raw, FormatHint::Auto, Some(" header "))
            .unwrap();
        assert_eq!(ev.event_id, "header");
    }

    #[test]
    fn fails_closed_on_bad_input() {
        assert!(matches!(
            normalize(b"{not json", FormatHint::Auto),
            Err(NormalizationError::InvalidJson(_))
        ));
        assert_eq!(
            normalize(&bytes(json!({"foo": 1})), FormatHint::Auto),
            Err(NormalizationError::UnrecognizedShape)
        );
        assert_eq!(
            normalize(&bytes(json!({"module": " ", "event_type": "created", "id": "1"})), FormatHint::Auto),
            Err(NormalizationError::MissingModule)
        );
        assert_eq!(
            normalize(&bytes(json!({"module": "contact", "event_type": "created"})), FormatHint::Auto),
            Err(NormalizationError::MissingRecordId)
        );
        assert_eq!(
            normalize(&bytes(json!({"module": "contact", "event_type": "merged", "id": "1"})), FormatHint::Auto),
            Err(NormalizationError::UnknownEventType("merged".into()))
        );
        assert!(matches!(
            normalize(&bytes(json!({"module": "contact"})), FormatHint::Nested),
            Err(NormalizationError::ShapeMismatch("nested", _))
        ));
    }

    #[test]
    fn allowlist_rejects_unsubscribed_modules() {
        let normalizer = Normalizer::new(["Contact", "account"]);
        let ok = bytes(json!({"module": "contact", "event_type": "created", "id": "1"}));
        let denied = bytes(json!({"module": "invoice", "event_type": "created", "id": "1"}));
        assert!(normalizer.normalize(&ok, FormatHint::Auto, None).is_ok());
        assert_eq!(
            normalizer.normalize(&denied, FormatHint::Auto, None),
            Err(NormalizationError::ModuleNotSubscribed("invoice".into()))
        );
    }

    #[test]
    fn derived_id_is_stable_across_restamped_redeliveries() {
        let a = bytes(json!({"module": "contact", "event_type": "updated", "id": "1", "timestamp": "2024-01-01T00:00:00Z"}));
        let b = bytes(json!({"module": "contact", "event_type": "updated", "id": "1", "timestamp": "2024-01-01T00:00:05Z", "data": {"x": 1}}));
        let c = bytes(json!({"module": "contact", "event_type": "updated", "id": "1"}));
        let d = bytes(json!({"module": "contact", "event_type": "deleted", "id": "1", "timestamp": "2024-01-01T00:00:00Z"}));
        let id_a = normalize(&a, FormatHint::Auto).unwrap().event_id;
        let id_b = normalize(&b, FormatHint::Auto).unwrap().event_id;
        let id_c = normalize(&c, FormatHint::Auto).unwrap().event_id;
        let id_d = normalize(&d, FormatHint::Auto).unwrap().event_id;
        assert_eq!(id_a, id_b);
        assert_eq!(id_a, id_c);
        assert_ne!(id_a, id_d);
    }

    #[test]
    fn nested_and_notification_ids_ignore_timestamps() {
        let n1 = bytes(json!({"event": {"module": "deal", "type": "edited"}, "record": {"id": "d-1"}, "timestamp": 1700000000}));
        let n2 = bytes(json!({"event": {"module": "deal", "type": "edited"}, "record": {"id": "d-1"}, "timestamp": 1700000300}));
        assert_eq!(
            normalize(&n1, FormatHint::Auto).unwrap().event_id,
            normalize(&n2, FormatHint::Auto).unwrap().event_id
        );

        let m1 = bytes(json!({"module": "lead", "operation": "insert", "ids": ["l-1"], "timestamp": "a"}));
        let m2 = bytes(json!({"module": "lead", "operation": "insert", "ids": ["l-1"], "timestamp": "b"}));
        assert_eq!(
            normalize(&m1, FormatHint::Auto).unwrap().event_id,
            normalize(&m2, FormatHint::Auto).unwrap().event_id
        );
    }

    #[test]
    fn oversized_event_id_is_rejected() {
        let long = "x".repeat(MAX_EVENT_ID_LEN + 1);
        let raw = bytes(json!({"event_id": long, "module": "contact", "event_type": "created", "id": "1"}));
        assert_eq!(
            normalize(&raw, FormatHint::Auto),
            Err(NormalizationError::InvalidEventId)
        );
    }

    #[test]
    fn hint_parses_from_header() {
        assert_eq!("Nested".parse::<FormatHint>(), Ok(FormatHint::Nested));
        assert_eq!("".parse::<FormatHint>(), Ok(FormatHint::Auto));
        assert!("xml".parse::<FormatHint>().is_err());
    }

    proptest! {
        #[test]
        fn prop_derived_id_is_deterministic(module in "[a-z]{1,12}", record in "[A-Za-z0-9-]{1,20}") {
            let a = derive_event_id(&module, &record, EventType::Updated);
            let b = derive_event_id(&module, &record, EventType::Updated);
            prop_assert_eq!(&a, &b);
            prop_assert_ne!(a, derive_event_id(&module, &record, EventType::Deleted));
        }
    }
}
