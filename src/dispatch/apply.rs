//! The downstream "apply event" capability.
//!
//! Implementations must be idempotent per record and change: the pipeline
//! delivers at least once and does not order retries against newer events.

use crate::types::WebhookEvent;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("apply timed out after {0:?}")]
    Timeout(Duration),

    #[error("downstream rejected the event: {0}")]
    Rejected(String),

    #[error("downstream transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait EventApplier: Send + Sync {
    async fn apply(&self, event: &WebhookEvent) -> Result<(), ApplyError>;
}

/// Logs each event and reports success. Default when no downstream is set.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogApplier;

#[async_trait]
impl EventApplier for LogApplier {
    async fn apply(&self, event: &WebhookEvent) -> Result<(), ApplyError> {
        info!(
            event_id = %event.event_id,
            module = %event.module,
            record_id = %event.record_id,
            event_type = %event.event_type,
            retry_count = event.retry_count,
            "applied event (log only)"
        );
        Ok(())
    }
}

/// POSTs the event as JSON to a downstream endpoint. Any non-2xx status is a
/// failure. The event id travels as `Idempotency-Key`.
pub struct HttpApplier {
    client: reqwest::Client,
    url: String,
}

impl HttpApplier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ApplyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApplyError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EventApplier for HttpApplier {
    async fn apply(&self, event: &WebhookEvent) -> Result<(), ApplyError> {
        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", &event.event_id)
            .json(event)
            .send()
            .await
            .map_err(|e| ApplyError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ApplyError::Rejected(format!("HTTP {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventStatus, EventType};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use chrono::Utc;

    fn event() -> WebhookEvent {
        WebhookEvent {
            event_id: "ev-7".into(),
            module: "account".into(),
            record_id: "a-1".into(),
            event_type: EventType::Created,
            payload: serde_json::json!({"id": "a-1"}),
            received_at: Utc::now(),
            signature_verified: true,
            retry_count: 0,
            status: EventStatus::Processing,
        }
    }

    async fn serve(status: StatusCode) -> String {
        let app = Router::new().route("/apply", post(move || async move { status }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/apply")
    }

    #[tokio::test]
    async fn log_applier_always_succeeds() {
        assert_eq!(LogApplier.apply(&event()).await, Ok(()));
    }

    #[tokio::test]
    async fn http_applier_maps_status_codes() {
        let ok = HttpApplier::new(serve(StatusCode::NO_CONTENT).await, Duration::from_secs(2)).unwrap();
        assert_eq!(ok.apply(&event()).await, Ok(()));

        let failing =
            HttpApplier::new(serve(StatusCode::BAD_GATEWAY).await, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            failing.apply(&event()).await,
            Err(ApplyError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn http_applier_reports_unreachable_downstream() {
        let applier =
            HttpApplier::new("http://127.0.0.1:9/apply", Duration::from_millis(500)).unwrap();
        assert!(matches!(
            applier.apply(&event()).await,
            Err(ApplyError::Transport(_))
        ));
    }
}
