//! Pipeline tunables.
//!
//! Every option has a documented default and can come from a flag or a
//! `WEBHOOK_*` environment variable. [`PipelineConfig::validate`] runs once at
//! start-up; a contradictory configuration is refused before anything binds.

use crate::dispatch::BackoffPolicy;
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("max_retries is 0 but backoff_cap is {0:?}; retries are disabled so a backoff cap is contradictory")]
    RetriesDisabledWithBackoff(Duration),

    #[error("backoff_base ({base:?}) exceeds backoff_cap ({cap:?})")]
    BackoffBaseAboveCap { base: Duration, cap: Duration },

    #[error("apply_timeout ({apply:?}) must be shorter than shutdown_grace ({grace:?})")]
    ApplyTimeoutTooLong { apply: Duration, grace: Duration },

    #[error("consumer_id must not be empty")]
    EmptyConsumerId,

    #[error("no webhook secret configured and no active subscriptions found")]
    NoSecrets,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub dedup_ttl: Duration,
    pub max_queue_len: usize,
    pub max_body_bytes: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub worker_count: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub apply_timeout: Duration,
    pub store_timeout: Duration,
    pub shutdown_grace: Duration,
    /// How often due retries are moved back onto the work queue.
    pub promote_interval: Duration,
    /// Pause between polls while the store is unreachable.
    pub store_retry_interval: Duration,
    pub key_prefix: String,
    /// Names this process's in-flight lists. Must differ between processes
    /// sharing a store, and stay the same across restarts of one process so
    /// it picks up what it left behind.
    pub consumer_id: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_ttl: Duration::from_secs(3600),
            max_queue_len: 10_000,
            max_body_bytes: 1024 * 1024,
            batch_size: 10,
            batch_timeout: Duration::from_millis(2_000),
            worker_count: 4,
            max_retries: 5,
            backoff_base: Duration::from_millis(1_000),
            backoff_cap: Duration::from_millis(60_000),
            apply_timeout: Duration::from_millis(10_000),
            store_timeout: Duration::from_millis(2_000),
            shutdown_grace: Duration::from_millis(15_000),
            promote_interval: Duration::from_millis(250),
            store_retry_interval: Duration::from_millis(1_000),
            key_prefix: "crm-webhooks".to_string(),
            consumer_id: "local".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("worker_count", self.worker_count),
            ("batch_size", self.batch_size),
            ("max_queue_len", self.max_queue_len),
            ("max_body_bytes", self.max_body_bytes),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(ConfigError::NotPositive { field });
            }
        }

        let durations = [
            ("dedup_ttl", self.dedup_ttl),
            ("batch_timeout", self.batch_timeout),
            ("apply_timeout", self.apply_timeout),
            ("store_timeout", self.store_timeout),
            ("shutdown_grace", self.shutdown_grace),
            ("promote_interval", self.promote_interval),
            ("store_retry_interval", self.store_retry_interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::NotPositive { field });
            }
        }

        if self.consumer_id.trim().is_empty() {
            return Err(ConfigError::EmptyConsumerId);
        }
        if self.max_retries == 0 && !self.backoff_cap.is_zero() {
            return Err(ConfigError::RetriesDisabledWithBackoff(self.backoff_cap));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(ConfigError::BackoffBaseAboveCap {
                base: self.backoff_base,
                cap: self.backoff_cap,
            });
        }
        if self.apply_timeout >= self.shutdown_grace {
            return Err(ConfigError::ApplyTimeoutTooLong {
                apply: self.apply_timeout,
                grace: self.shutdown_grace,
            });
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_cap)
    }
}

// ─── Command-line / environment surface ─────────────────────────────────────

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address the webhook receiver binds to.
    #[arg(long, env = "WEBHOOK_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Shared HMAC secret, checked alongside per-subscription secrets.
    #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// Bearer token for the dead-letter admin routes. Routes are off without it.
    #[arg(long, env = "WEBHOOK_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// Downstream endpoint events are POSTed to. Events are only logged without it.
    #[arg(long, env = "WEBHOOK_APPLY_URL")]
    pub apply_url: Option<String>,

    /// Shared coordination store. In-process store when unset.
    #[arg(long, env = "WEBHOOK_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Directory holding subscriptions.json.
    #[arg(long, env = "WEBHOOK_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    /// Run only the receiver; another process runs the workers.
    #[arg(long, default_value_t = false)]
    pub no_workers: bool,

    /// Run only the workers; another process runs the receiver.
    #[arg(long, default_value_t = false, conflicts_with = "no_workers")]
    pub no_ingress: bool,

    #[arg(long, env = "WEBHOOK_DEDUP_TTL_SECS", default_value_t = 3600)]
    pub dedup_ttl_secs: u64,

    #[arg(long, env = "WEBHOOK_MAX_QUEUE_LEN", default_value_t = 10_000)]
    pub max_queue_len: usize,

    #[arg(long, env = "WEBHOOK_MAX_BODY_BYTES", default_value_t = 1024 * 1024)]
    pub max_body_bytes: usize,

    #[arg(long, env = "WEBHOOK_BATCH_SIZE", default_value_t = 10)]
    pub batch_size: usize,

    #[arg(long, env = "WEBHOOK_BATCH_TIMEOUT_MS", default_value_t = 2_000)]
    pub batch_timeout_ms: u64,

    #[arg(long, env = "WEBHOOK_WORKERS", default_value_t = 4)]
    pub worker_count: usize,

    #[arg(long, env = "WEBHOOK_MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    #[arg(long, env = "WEBHOOK_BACKOFF_BASE_MS", default_value_t = 1_000)]
    pub backoff_base_ms: u64,

    #[arg(long, env = "WEBHOOK_BACKOFF_CAP_MS", default_value_t = 60_000)]
    pub backoff_cap_ms: u64,

    #[arg(long, env = "WEBHOOK_APPLY_TIMEOUT_MS", default_value_t = 10_000)]
    pub apply_timeout_ms: u64,

    #[arg(long, env = "WEBHOOK_STORE_TIMEOUT_MS", default_value_t = 2_000)]
    pub store_timeout_ms: u64,

    #[arg(long, env = "WEBHOOK_SHUTDOWN_GRACE_MS", default_value_t = 15_000)]
    pub shutdown_grace_ms: u64,

    #[arg(long, env = "WEBHOOK_KEY_PREFIX", default_value = "crm-webhooks")]
    pub key_prefix: String,

    /// Stable per-process name for in-flight bookkeeping in the shared store.
    #[arg(long, env = "WEBHOOK_CONSUMER_ID", default_value = "local")]
    pub consumer_id: String,
}

/// Connection to the CRM's subscription API, shared by the registration commands.
#[derive(Debug, Clone, Args)]
pub struct RegistrationArgs {
    /// Base URL of the CRM API, e.g. `https://crm.example.com/api/v2`.
    #[arg(long, env = "WEBHOOK_CRM_API_BASE")]
    pub api_base: String,

    #[arg(long, env = "WEBHOOK_CRM_API_TOKEN", hide_env_values = true)]
    pub api_token: String,

    /// Public URL the CRM should deliver to (this service's `/webhook`).
    #[arg(long, env = "WEBHOOK_CALLBACK_URL")]
    pub callback_url: String,

    #[arg(long, env = "WEBHOOK_CRM_TIMEOUT_MS", default_value_t = 10_000)]
    pub request_timeout_ms: u64,

    #[arg(long, env = "WEBHOOK_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,
}

impl RegistrationArgs {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ServeArgs {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            dedup_ttl: Duration::from_secs(self.dedup_ttl_secs),
            max_queue_len: self.max_queue_len,
            max_body_bytes: self.max_body_bytes,
            batch_size: self.batch_size,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            worker_count: self.worker_count,
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            apply_timeout: Duration::from_millis(self.apply_timeout_ms),
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            key_prefix: self.key_prefix.clone(),
            consumer_id: self.consumer_id.clone(),
            ..PipelineConfig::default()
        }
    }
}
