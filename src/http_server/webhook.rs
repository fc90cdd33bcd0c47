//! `POST /webhook`.
//!
//! Order matters: size, signature, shape, dedup claim, bounded enqueue. Each
//! step short-circuits, and nothing before the signature check touches the
//! store. The handler never waits on downstream processing.

use super::error::IngressError;
use super::{AppState, HEADER_EVENT_ID, HEADER_FORMAT, HEADER_SIGNATURE};
use crate::config::PipelineConfig;
use crate::coordination::with_timeout;
use crate::metrics::IngressOutcome;
use crate::normalize::FormatHint;
use crate::verification::verify_any;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct IngressResponse {
    pub event_id: String,
    /// `accepted` or `duplicate`.
    pub status: &'static str,
}

pub async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<IngressResponse>, IngressError> {
    let result = ingest(&state, &headers, body).await;
    if let Err(e) = &result {
        let outcome = match e {
            IngressError::PayloadTooLarge(_) => Some(IngressOutcome::RejectedOversize),
            IngressError::InvalidSignature => Some(IngressOutcome::RejectedAuth),
            IngressError::UnreadableBody(_)
            | IngressError::UnknownFormat(_)
            | IngressError::Malformed(_) => Some(IngressOutcome::RejectedMalformed),
            IngressError::OverCapacity => Some(IngressOutcome::RejectedCapacity),
            IngressError::StoreUnavailable(_) => {
                state.metrics().record_store_error();
                None
            }
            IngressError::Unauthorized | IngressError::NotFound => None,
        };
        if let Some(outcome) = outcome {
            state.metrics().record_ingress(outcome);
        }
    }
    result.map(Json)
}

async fn ingest(
    state: &AppState,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<IngressResponse, IngressError> {
    let config = state.config();

    // 1. Size
    let body = match body {
        Ok(body) => body,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            warn!(limit = config.max_body_bytes, "webhook body too large");
            return Err(IngressError::PayloadTooLarge(config.max_body_bytes));
        }
        Err(rejection) => return Err(IngressError::UnreadableBody(rejection.body_text())),
    };
    if body.len() > config.max_body_bytes {
        warn!(size = body.len(), limit = config.max_body_bytes, "webhook body too large");
        return Err(IngressError::PayloadTooLarge(config.max_body_bytes));
    }

    // 2. Signature, against the raw bytes and before any parsing
    let signature = header_str(headers, HEADER_SIGNATURE).unwrap_or("");
    if !verify_any(&body, signature, state.secrets()) {
        warn!(size = body.len(), "webhook signature rejected");
        return Err(IngressError::InvalidSignature);
    }

    // 3. Shape
    let hint = match header_str(headers, HEADER_FORMAT) {
        Some(raw) => raw
            .parse::<FormatHint>()
            .map_err(|()| IngressError::UnknownFormat(raw.to_string()))?,
        None => FormatHint::Auto,
    };
    let explicit_id = header_str(headers, HEADER_EVENT_ID);
    let normalized = state
        .normalizer()
        .normalize(&body, hint, explicit_id)
        .inspect_err(|e| warn!(error = %e, ?hint, size = body.len(), "malformed webhook payload"))?;

    let received_at = Utc::now();
    let event = normalized.into_webhook_event(received_at);
    let event_id = event.event_id.clone();
    let json = event
        .to_json()
        .map_err(|e| IngressError::UnreadableBody(e.to_string()))?;

    // 4. Dedup claim. It starts short-lived and only gets the full dedup
    // window once the event is on the queue, so a claim nobody managed to
    // release cannot swallow redeliveries for long.
    let store = state.store();
    let dedup_key = state.keys().dedup(&event_id);
    let claim = with_timeout(
        config.store_timeout,
        store.set_if_absent(&dedup_key, &received_at.to_rfc3339(), pending_claim_ttl(config)),
    )
    .await;
    let claimed = match claim {
        Ok(claimed) => claimed,
        Err(e) => {
            // The claim may have landed even though the reply did not.
            warn!(event_id = %event_id, error = %e, "dedup claim failed");
            release_claim(state, &dedup_key, &event_id).await;
            return Err(IngressError::StoreUnavailable(e));
        }
    };

    if !claimed {
        state.metrics().record_ingress(IngressOutcome::RejectedDuplicate);
        debug!(event_id = %event_id, "duplicate webhook delivery (idempotent)");
        return Ok(IngressResponse {
            event_id,
            status: "duplicate",
        });
    }

    // 5 + 6. Capacity check and enqueue in one atomic step
    let pushed = with_timeout(
        config.store_timeout,
        store.push_bounded(&state.keys().queue(), &json, config.max_queue_len),
    )
    .await;

    match pushed {
        Ok(Some(depth)) => {
            confirm_claim(state, &dedup_key, &event_id).await;
            state.metrics().record_ingress(IngressOutcome::Accepted);
            info!(
                event_id = %event_id,
                module = %event.module,
                record_id = %event.record_id,
                event_type = %event.event_type,
                queue_depth = depth,
                "webhook accepted"
            );
            Ok(IngressResponse {
                event_id,
                status: "accepted",
            })
        }
        Ok(None) => {
            warn!(event_id = %event_id, max_queue_len = config.max_queue_len, "work queue full; rejecting");
            release_claim(state, &dedup_key, &event_id).await;
            Err(IngressError::OverCapacity)
        }
        Err(e) => {
            warn!(event_id = %event_id, error = %e, "enqueue failed");
            release_claim(state, &dedup_key, &event_id).await;
            Err(IngressError::StoreUnavailable(e))
        }
    }
}

/// Lifetime of a claim whose event is not on the queue yet. Every store call
/// on the way there is bounded by `store_timeout`.
fn pending_claim_ttl(config: &PipelineConfig) -> Duration {
    (config.store_timeout * 5).min(config.dedup_ttl)
}

/// Stretch the claim of an enqueued event to the full dedup window.
async fn confirm_claim(state: &AppState, dedup_key: &str, event_id: &str) {
    let config = state.config();
    match with_timeout(config.store_timeout, state.store().expire(dedup_key, config.dedup_ttl)).await {
        Ok(true) => {}
        Ok(false) => warn!(event_id, "dedup claim expired before the event was enqueued"),
        Err(e) => {
            state.metrics().record_store_error();
            warn!(event_id, error = %e, "failed to extend dedup claim; redeliveries may be enqueued again");
        }
    }
}

/// Drop the dedup claim so the sender's redelivery is not mistaken for a
/// duplicate of an event that was never enqueued.
async fn release_claim(state: &AppState, dedup_key: &str, event_id: &str) {
    let config = state.config();
    let released = with_timeout(config.store_timeout, state.store().delete(dedup_key)).await;
    if let Err(e) = released {
        state.metrics().record_store_error();
        warn!(
            event_id,
            error = %e,
            expires_in_ms = pending_claim_ttl(config).as_millis() as u64,
            "failed to release dedup claim; redeliveries count as duplicates until it expires"
        );
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::coordination::{CoordinationStore, FaultyStore, InMemoryStore};
    use crate::types::{EventStatus, EventType, WebhookEvent};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use std::sync::Arc;

    const CONTACT_UPDATED: &str =
        r#"{"event_id":"ev-1","module":"Contact","event_type":"updated","record_id":"c-42","data":{"email":"a@example.com"}}"#;

    async fn queue_len(store: &InMemoryStore) -> usize {
        store.len("t:queue").await.unwrap()
    }

    #[tokio::test]
    async fn accepts_signed_event_and_enqueues_once() {
        let store = Arc::new(InMemoryStore::new());
        let state = state_with(store.clone(), config());

        let (status, body) = send(&state, signed(CONTACT_UPDATED)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"event_id": "ev-1", "status": "accepted"}));
        assert_eq!(queue_len(&store).await, 1);

        let raw = store.pop("t:queue").await.unwrap().unwrap();
        let event = WebhookEvent::from_json(&raw).unwrap();
        assert_eq!(event.module, "contact");
        assert_eq!(event.event_type, EventType::Updated);
        assert_eq!(event.status, EventStatus::Queued);
        assert_eq!(event.retry_count, 0);
        assert!(event.signature_verified);
        assert_eq!(state.metrics().snapshot().accepted, 1);
    }

    #[tokio::test]
    async fn duplicate_within_ttl_is_acknowledged_without_enqueue() {
        let store = Arc::new(InMemoryStore::new());
        let state = state_with(store.clone(), config());

        send(&state, signed(CONTACT_UPDATED)).await;
        let (status, body) = send(&state, signed(CONTACT_UPDATED)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "duplicate");
        assert_eq!(queue_len(&store).await, 1);
        assert_eq!(state.metrics().snapshot().rejected_duplicate, 1);
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected_before_the_store() {
        let store = Arc::new(InMemoryStore::new());
        let state = state_with(store.clone(), config());
        send(&state, signed(CONTACT_UPDATED)).await;

        let mut sig = compute(CONTACT_UPDATED);
        sig[0] ^= 0x01;
        let req = Request::post("/webhook")
            .header(HEADER_SIGNATURE, hex::encode(sig))
            .body(Body::from(CONTACT_UPDATED))
            .unwrap();
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_signature");
        assert_eq!(queue_len(&store).await, 1);
        assert_eq!(state.metrics().snapshot().rejected_auth, 1);
    }

    #[tokio::test]
    async fn missing_signature_is_unauthorized_even_with_store_down() {
        let store = Arc::new(InMemoryStore::new());
        store.set_available(false);
        let state = state_with(store, config());

        let req = Request::post("/webhook").body(Body::from(CONTACT_UPDATED)).unwrap();
        let (status, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(state.metrics().snapshot().store_errors, 0);
    }

    #[tokio::test]
    async fn malformed_payloads_are_400_and_never_enqueued() {
        let store = Arc::new(InMemoryStore::new());
        let state = state_with(store.clone(), config());

        for body in [
            "not json",
            r#"{"event_type":"updated","record_id":"1"}"#,
            r#"{"module":"contact","event_type":"archived","record_id":"1"}"#,
            r#"{"module":"contact","event_type":"updated"}"#,
        ] {
            let (status, json) = send(&state, signed(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(json["error"], "malformed_payload");
        }
        assert_eq!(queue_len(&store).await, 0);
        assert_eq!(state.metrics().snapshot().rejected_malformed, 4);
    }

    #[tokio::test]
    async fn unknown_format_hint_is_a_bad_request() {
        let state = state_with(Arc::new(InMemoryStore::new()), config());
        let mut req = signed(CONTACT_UPDATED);
        req.headers_mut()
            .insert(HEADER_FORMAT, "xml".parse().unwrap());
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unknown_format");
    }

    #[tokio::test]
    async fn header_event_id_overrides_body() {
        let store = Arc::new(InMemoryStore::new());
        let state = state_with(store.clone(), config());
        let mut req = signed(CONTACT_UPDATED);
        req.headers_mut()
            .insert(HEADER_EVENT_ID, "from-header".parse().unwrap());
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["event_id"], "from-header");
    }

    #[tokio::test]
    async fn oversize_body_is_413() {
        let store = Arc::new(InMemoryStore::new());
        let state = state_with(store.clone(), config());
        let padding = "x".repeat(5000);
        let body = format!(
            r#"{{"module":"contact","event_type":"updated","record_id":"1","data":{{"pad":"{padding}"}}}}"#
        );
        let (status, json) = send(&state, signed(&body)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json["error"], "payload_too_large");
        assert_eq!(queue_len(&store).await, 0);
        assert_eq!(state.metrics().snapshot().rejected_oversize, 1);
    }

    #[tokio::test]
    async fn full_queue_rejects_and_releases_the_claim() {
        let store = Arc::new(InMemoryStore::new());
        let state = state_with(store.clone(), config());
        for id in ["a", "b", "c"] {
            let body = format!(r#"{{"event_id":"{id}","module":"contact","event_type":"updated","record_id":"1"}}"#);
            assert_eq!(send(&state, signed(&body)).await.0, StatusCode::OK);
        }
        assert_eq!(queue_len(&store).await, 3);

        let (status, body) = send(&state, signed(CONTACT_UPDATED)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "over_capacity");
        assert_eq!(queue_len(&store).await, 3);
        assert_eq!(state.metrics().snapshot().rejected_capacity, 1);

        // Once there is room, the redelivery is accepted rather than deduped.
        store.pop("t:queue").await.unwrap();
        let (status, body) = send(&state, signed(CONTACT_UPDATED)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");
    }

    #[tokio::test]
    async fn store_outage_is_503() {
        let store = Arc::new(InMemoryStore::new());
        store.set_available(false);
        let state = state_with(store, config());
        let (status, body) = send(&state, signed(CONTACT_UPDATED)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "store_unavailable");
        // The failed claim and the failed attempt to release it.
        assert_eq!(state.metrics().snapshot().store_errors, 2);
    }

    #[tokio::test]
    async fn derived_ids_dedup_identical_notifications() {
        let store = Arc::new(InMemoryStore::new());
        let state = state_with(store.clone(), config());
        let body = r#"{"module":"deal","event_type":"created","record_id":"d-9","timestamp":"2024-05-01T10:00:00Z"}"#;

        let (_, first) = send(&state, signed(body)).await;
        let (_, second) = send(&state, signed(body)).await;
        assert_eq!(first["event_id"], second["event_id"]);
        assert_eq!(second["status"], "duplicate");
        assert_eq!(queue_len(&store).await, 1);
    }

    #[tokio::test]
    async fn restamped_redelivery_without_id_is_a_duplicate() {
        let store = Arc::new(InMemoryStore::new());
        let state = state_with(store.clone(), config());
        let first = r#"{"module":"deal","event_type":"updated","record_id":"d-9","timestamp":"2024-05-01T10:00:00Z"}"#;
        let retry = r#"{"module":"deal","event_type":"updated","record_id":"d-9","timestamp":"2024-05-01T10:00:05Z"}"#;

        let (_, a) = send(&state, signed(first)).await;
        let (status, b) = send(&state, signed(retry)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(a["status"], "accepted");
        assert_eq!(b["status"], "duplicate");
        assert_eq!(a["event_id"], b["event_id"]);
        assert_eq!(queue_len(&store).await, 1);
    }

    fn quick_store_config() -> PipelineConfig {
        PipelineConfig {
            store_timeout: Duration::from_millis(50),
            ..config()
        }
    }

    #[tokio::test]
    async fn claim_that_lands_after_the_timeout_is_released() {
        let inner = Arc::new(InMemoryStore::new());
        let store = Arc::new(FaultyStore::new(inner.clone()));
        store.delay_claim_replies(Duration::from_millis(200));
        let state = state_with(store.clone(), quick_store_config());

        let (status, body) = send(&state, signed(CONTACT_UPDATED)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "store_unavailable");

        store.delay_claim_replies(Duration::ZERO);
        let (status, body) = send(&state, signed(CONTACT_UPDATED)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");
        assert_eq!(queue_len(&inner).await, 1);
    }

    #[tokio::test]
    async fn unreleasable_claim_only_blocks_redelivery_briefly() {
        let inner = Arc::new(InMemoryStore::new());
        let store = Arc::new(FaultyStore::new(inner.clone()));
        store.delay_claim_replies(Duration::from_millis(200));
        store.fail_deletes(true);
        let state = state_with(store.clone(), quick_store_config());

        let (status, _) = send(&state, signed(CONTACT_UPDATED)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        store.delay_claim_replies(Duration::ZERO);

        // The stuck claim is short-lived: 5 x store_timeout.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (status, body) = send(&state, signed(CONTACT_UPDATED)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");
        assert_eq!(queue_len(&inner).await, 1);
    }

    #[tokio::test]
    async fn accepted_claim_outlives_the_pending_window() {
        let store = Arc::new(InMemoryStore::new());
        let state = state_with(store.clone(), quick_store_config());

        send(&state, signed(CONTACT_UPDATED)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (_, body) = send(&state, signed(CONTACT_UPDATED)).await;
        assert_eq!(body["status"], "duplicate");
        assert_eq!(queue_len(&store).await, 1);
    }

    fn compute(body: &str) -> Vec<u8> {
        crate::verification::compute_signature(body.as_bytes(), SECRET)
    }
}
