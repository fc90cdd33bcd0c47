//! HTTP surface of the pipeline.
//!
//! - `POST /webhook` verifies, normalizes, deduplicates and enqueues
//! - `GET /health` reports store reachability and depths
//! - `GET /metrics` returns the counters as JSON
//! - `GET /admin/dead-letters`, `POST /admin/dead-letters/replay` (bearer token)

use crate::config::PipelineConfig;
use crate::coordination::{CoordinationStore, Keys};
use crate::metrics::PipelineMetrics;
use crate::normalize::Normalizer;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

mod admin;
mod error;
mod health;
mod webhook;

pub use error::{ErrorResponse, IngressError};
pub use webhook::IngressResponse;

/// Header carrying the HMAC of the raw body.
pub const HEADER_SIGNATURE: &str = "x-webhook-signature";
/// Optional sender-supplied event id; overrides any id in the body.
pub const HEADER_EVENT_ID: &str = "x-webhook-event-id";
/// Optional layout hint: `flat`, `nested`, `notification` or `auto`.
pub const HEADER_FORMAT: &str = "x-webhook-format";

// ─── State ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn CoordinationStore>,
    normalizer: Normalizer,
    secrets: Vec<Vec<u8>>,
    metrics: Arc<PipelineMetrics>,
    config: PipelineConfig,
    keys: Keys,
    admin_token: Option<String>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        normalizer: Normalizer,
        secrets: Vec<Vec<u8>>,
        metrics: Arc<PipelineMetrics>,
        config: PipelineConfig,
    ) -> Self {
        let keys = Keys::new(config.key_prefix.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                normalizer,
                secrets,
                metrics,
                config,
                keys,
                admin_token: None,
            }),
        }
    }

    /// Enable the admin routes. Must be called before the state is shared.
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.admin_token = token.filter(|t| !t.is_empty());
        }
        self
    }

    pub fn store(&self) -> &dyn CoordinationStore {
        self.inner.store.as_ref()
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.inner.normalizer
    }

    pub fn secrets(&self) -> &[Vec<u8>] {
        &self.inner.secrets
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.inner.metrics
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn keys(&self) -> &Keys {
        &self.inner.keys
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.inner.admin_token.as_deref()
    }
}

// ─── Router ─────────────────────────────────────────────────────────────────

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config().max_body_bytes;
    Router::new()
        .route(
            "/webhook",
            post(webhook::webhook_handler).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/health", get(health::health_handler))
        .route("/metrics", get(health::metrics_handler))
        .route("/admin/dead-letters", get(admin::list_dead_letters))
        .route("/admin/dead-letters/replay", post(admin::replay_dead_letters))
        .with_state(state)
}

/// Serve until `shutdown` resolves. In-flight requests are allowed to finish.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "ingress listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
