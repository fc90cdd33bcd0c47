//! Registration with the CRM: subscribe a module's events to our callback,
//! keep the issued webhook id and signing secret on disk, and hand the
//! active secrets and module allowlist to `serve`.

mod store;

pub use store::SubscriptionStore;

use crate::types::{EventType, Subscription};
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("subscription file is corrupt: {0}")]
    Corrupt(String),

    #[error("remote API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote API returned {status}: {body}")]
    Remote { status: StatusCode, body: String },

    #[error("no subscription with id {0}")]
    UnknownSubscription(String),
}

impl RegistrationError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        RegistrationError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

// ─── Remote client ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    module: &'a str,
    events: Vec<&'static str>,
    callback_url: &'a str,
    secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubscribeResponse {
    #[serde(alias = "webhook_id")]
    id: String,
}

/// Thin client for the CRM's webhook subscription API.
pub struct RegistrationClient {
    client: reqwest::Client,
    api_base: String,
    api_token: String,
}

impl RegistrationClient {
    pub fn new(
        api_base: impl Into<String>,
        api_token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, RegistrationError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
        })
    }

    /// Returns the remote webhook id.
    pub async fn subscribe(
        &self,
        module: &str,
        event_types: &[EventType],
        callback_url: &str,
        secret: &str,
    ) -> Result<String, RegistrationError> {
        let request = SubscribeRequest {
            module,
            events: event_types.iter().map(EventType::as_str).collect(),
            callback_url,
            secret,
        };
        let response = self
            .client
            .post(format!("{}/webhooks", self.api_base))
            .bearer_auth(&self.api_token)
            .json(&request)
            .send()
            .await?;

        let response = check(response).await?;
        let created: SubscribeResponse = response.json().await?;
        Ok(created.id)
    }

    /// A webhook the remote no longer knows about counts as removed.
    pub async fn unsubscribe(&self, remote_webhook_id: &str) -> Result<(), RegistrationError> {
        let response = self
            .client
            .delete(format!("{}/webhooks/{remote_webhook_id}", self.api_base))
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            warn!(remote_webhook_id, "remote webhook already gone");
            return Ok(());
        }
        check(response).await.map(|_| ())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, RegistrationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RegistrationError::Remote { status, body })
}

// ─── Manager ────────────────────────────────────────────────────────────────

/// 256 bits of randomness, hex encoded.
pub fn generate_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

pub struct RegistrationManager {
    client: RegistrationClient,
    store: SubscriptionStore,
    callback_url: String,
}

impl RegistrationManager {
    pub fn new(
        client: RegistrationClient,
        store: SubscriptionStore,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            callback_url: callback_url.into(),
        }
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    /// Subscribe `module` with a fresh secret and persist the result. An empty
    /// `event_types` subscribes to every kind.
    pub async fn register(
        &mut self,
        module: &str,
        event_types: &[EventType],
    ) -> Result<Subscription, RegistrationError> {
        let module = module.trim().to_ascii_lowercase();
        let event_types = if event_types.is_empty() {
            vec![EventType::Created, EventType::Updated, EventType::Deleted]
        } else {
            event_types.to_vec()
        };
        let secret = generate_secret();

        let remote_webhook_id = self
            .client
            .subscribe(&module, &event_types, &self.callback_url, &secret)
            .await?;

        let subscription = Subscription {
            id: Uuid::new_v4().to_string(),
            module,
            event_types,
            remote_webhook_id,
            secret,
            callback_url: self.callback_url.clone(),
            status: "active".to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        self.store.insert(subscription.clone());

        if let Err(e) = self.store.save() {
            // Do not leave a remote webhook whose secret nobody knows.
            self.store.remove(&subscription.id);
            if let Err(rollback) = self.client.unsubscribe(&subscription.remote_webhook_id).await {
                warn!(
                    remote_webhook_id = %subscription.remote_webhook_id,
                    error = %rollback,
                    "failed to roll back remote subscription"
                );
            }
            return Err(e);
        }

        info!(
            subscription_id = %subscription.id,
            module = %subscription.module,
            remote_webhook_id = %subscription.remote_webhook_id,
            "subscription registered"
        );
        Ok(subscription)
    }

    pub async fn deregister(&mut self, id: &str) -> Result<Subscription, RegistrationError> {
        let remote_id = self
            .store
            .get(id)
            .map(|s| s.remote_webhook_id.clone())
            .ok_or_else(|| RegistrationError::UnknownSubscription(id.to_string()))?;

        self.client.unsubscribe(&remote_id).await?;

        let removed = self
            .store
            .remove(id)
            .ok_or_else(|| RegistrationError::UnknownSubscription(id.to_string()))?;
        self.store.save()?;

        info!(subscription_id = %id, module = %removed.module, "subscription removed");
        Ok(removed)
    }
}
