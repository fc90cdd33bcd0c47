//! Coordination store: the single source of truth for dedup records, the
//! work queue, the delayed-retry set and the dead-letter list.
//!
//! Every invariant the pipeline relies on maps to exactly one atomic store
//! primitive (`SET NX PX`, bounded push, reliable pop, head move, delayed
//! promotion). Callers never compose a check and an act across two
//! round-trips.

#[cfg(test)]
mod faults;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

#[cfg(test)]
pub(crate) use faults::FaultyStore;
pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("coordination store call timed out")]
    Timeout,

    #[error("stored value could not be decoded: {0}")]
    Corrupt(String),
}

/// Key layout under a common prefix.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn dedup(&self, event_id: &str) -> String {
        format!("{}:dedup:{event_id}", self.prefix)
    }

    pub fn queue(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    pub fn dead_letter(&self) -> String {
        format!("{}:dead-letter", self.prefix)
    }

    /// Queue entries that could not be decoded at all.
    pub fn poison(&self) -> String {
        format!("{}:poison", self.prefix)
    }

    /// Events one consumer has popped but not yet finished with.
    pub fn inflight(&self, consumer: &str) -> String {
        format!("{}:inflight:{consumer}", self.prefix)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("crm-webhooks")
    }
}

/// Lists are popped from the head. `push` appends at the tail, `push_front`
/// returns an item to the head so it is the next one handed out.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Atomic set-if-absent with expiry. `Ok(true)` when the key was created.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Reset the expiry of a live key. `Ok(false)` when the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Append unless the list already holds `max_len` items. Returns the new
    /// length, or `None` when the list is full.
    async fn push_bounded(
        &self,
        list: &str,
        value: &str,
        max_len: usize,
    ) -> Result<Option<usize>, StoreError>;

    async fn push(&self, list: &str, value: &str) -> Result<usize, StoreError>;

    async fn push_front(&self, list: &str, value: &str) -> Result<usize, StoreError>;

    /// Move the head of `list` onto the tail of `inflight`, waiting at most
    /// `timeout` for an item to arrive. The item stays in `inflight` until
    /// [`ack`](Self::ack), so a reply lost in transit loses nothing.
    async fn pop_blocking(
        &self,
        list: &str,
        inflight: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Remove one occurrence of `value` from `inflight`.
    async fn ack(&self, inflight: &str, value: &str) -> Result<(), StoreError>;

    /// Return everything in `inflight` to the head of `list`, keeping its
    /// order. Returns how many items moved.
    async fn recover(&self, inflight: &str, list: &str) -> Result<usize, StoreError>;

    /// If the head of `from` is still `expected`, remove it and append `value`
    /// to `to`, all in one step. `Ok(false)` when the head has changed.
    async fn replace_head(
        &self,
        from: &str,
        expected: &str,
        to: &str,
        value: &str,
    ) -> Result<bool, StoreError>;

    async fn len(&self, list: &str) -> Result<usize, StoreError>;

    /// Read up to `count` items from the head without removing them.
    async fn range(&self, list: &str, count: usize) -> Result<Vec<String>, StoreError>;

    /// Park `value` in a delayed set until `ready_at_ms` (unix millis).
    async fn schedule(&self, set: &str, value: &str, ready_at_ms: i64) -> Result<(), StoreError>;

    /// Atomically move up to `limit` entries due at `now_ms` from `set` onto
    /// the tail of `list`. Returns how many moved.
    async fn promote_due(
        &self,
        set: &str,
        list: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<usize, StoreError>;

    async fn scheduled_len(&self, set: &str) -> Result<usize, StoreError>;
}

/// Bound a store round-trip. An elapsed timer becomes [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, op: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}
