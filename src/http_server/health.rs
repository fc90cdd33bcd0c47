use super::AppState;
use crate::coordination::with_timeout;
use crate::metrics::MetricsSnapshot;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_depth: Option<usize>,
}

/// 200 while the coordination store answers, 503 otherwise.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let timeout = state.config().store_timeout;
    let store = state.store();

    if let Err(e) = with_timeout(timeout, store.ping()).await {
        warn!(error = %e, "health check: store unreachable");
        state.metrics().record_store_error();
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unavailable",
                store_connected: false,
                queue_depth: None,
                dead_letter_depth: None,
            }),
        );
    }

    let keys = state.keys();
    let queue_depth = with_timeout(timeout, store.len(&keys.queue())).await.ok();
    let dead_letter_depth = with_timeout(timeout, store.len(&keys.dead_letter())).await.ok();

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            store_connected: true,
            queue_depth,
            dead_letter_depth,
        }),
    )
}

/// Counters plus live depths. Depths are omitted when the store is down.
pub async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let timeout = state.config().store_timeout;
    let store = state.store();
    let keys = state.keys();

    let mut snapshot = state.metrics().snapshot();
    snapshot.queue_depth = with_timeout(timeout, store.len(&keys.queue())).await.ok();
    snapshot.delayed_depth = with_timeout(timeout, store.scheduled_len(&keys.delayed())).await.ok();
    snapshot.dead_letter_depth = with_timeout(timeout, store.len(&keys.dead_letter())).await.ok();
    Json(snapshot)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::coordination::{CoordinationStore, InMemoryStore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_depths_when_store_is_up() {
        let store = Arc::new(InMemoryStore::new());
        store.push("t:queue", "x").await.unwrap();
        let state = state_with(store, config());

        let (status, body) = send(&state, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store_connected"], true);
        assert_eq!(body["queue_depth"], 1);
        assert_eq!(body["dead_letter_depth"], 0);
    }

    #[tokio::test]
    async fn health_is_503_when_store_is_down() {
        let store = Arc::new(InMemoryStore::new());
        store.set_available(false);
        let state = state_with(store, config());

        let (status, body) = send(&state, get("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["store_connected"], false);
        assert!(body.get("queue_depth").is_none());
    }

    #[tokio::test]
    async fn metrics_include_counters_and_depths() {
        let store = Arc::new(InMemoryStore::new());
        store.schedule("t:delayed", "x", 0).await.unwrap();
        let state = state_with(store, config());
        let body = r#"{"module":"lead","event_type":"created","record_id":"l-1"}"#;
        send(&state, signed(body)).await;

        let (status, json) = send(&state, get("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["accepted"], 1);
        assert_eq!(json["rejected_auth"], 0);
        assert_eq!(json["queue_depth"], 1);
        assert_eq!(json["delayed_depth"], 1);
        assert_eq!(json["dead_letter_depth"], 0);
    }
}
