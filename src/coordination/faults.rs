//! A store wrapper that misbehaves on request, for exercising the paths where
//! a round-trip fails or its reply never arrives.

use super::{CoordinationStore, InMemoryStore, StoreError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub(crate) struct FaultyStore {
    inner: Arc<InMemoryStore>,
    /// Claims land, then the reply is held back this long (millis, 0 = off).
    claim_reply_delay_ms: AtomicU64,
    fail_delete: AtomicBool,
    /// `replace_head` fails before touching anything.
    fail_head_moves: AtomicBool,
    /// `replace_head` applies, then reports a timeout.
    lose_head_move_replies: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn delay_claim_replies(&self, delay: Duration) {
        self.claim_reply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, on: bool) {
        self.fail_delete.store(on, Ordering::SeqCst);
    }

    pub fn fail_head_moves(&self, on: bool) {
        self.fail_head_moves.store(on, Ordering::SeqCst);
    }

    pub fn lose_head_move_replies(&self, on: bool) {
        self.lose_head_move_replies.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinationStore for FaultyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let created = self.inner.set_if_absent(key, value, ttl).await?;
        let delay = self.claim_reply_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(created)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("delete refused".into()));
        }
        self.inner.delete(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.inner.expire(key, ttl).await
    }

    async fn push_bounded(
        &self,
        list: &str,
        value: &str,
        max_len: usize,
    ) -> Result<Option<usize>, StoreError> {
        self.inner.push_bounded(list, value, max_len).await
    }

    async fn push(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        self.inner.push(list, value).await
    }

    async fn push_front(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        self.inner.push_front(list, value).await
    }

    async fn pop_blocking(
        &self,
        list: &str,
        inflight: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        self.inner.pop_blocking(list, inflight, timeout).await
    }

    async fn ack(&self, inflight: &str, value: &str) -> Result<(), StoreError> {
        self.inner.ack(inflight, value).await
    }

    async fn recover(&self, inflight: &str, list: &str) -> Result<usize, StoreError> {
        self.inner.recover(inflight, list).await
    }

    async fn replace_head(
        &self,
        from: &str,
        expected: &str,
        to: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        if self.fail_head_moves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("move refused".into()));
        }
        let moved = self.inner.replace_head(from, expected, to, value).await?;
        if self.lose_head_move_replies.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout);
        }
        Ok(moved)
    }

    async fn len(&self, list: &str) -> Result<usize, StoreError> {
        self.inner.len(list).await
    }

    async fn range(&self, list: &str, count: usize) -> Result<Vec<String>, StoreError> {
        self.inner.range(list, count).await
    }

    async fn schedule(&self, set: &str, value: &str, ready_at_ms: i64) -> Result<(), StoreError> {
        self.inner.schedule(set, value, ready_at_ms).await
    }

    async fn promote_due(
        &self,
        set: &str,
        list: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<usize, StoreError> {
        self.inner.promote_due(set, list, now_ms, limit).await
    }

    async fn scheduled_len(&self, set: &str) -> Result<usize, StoreError> {
        self.inner.scheduled_len(set).await
    }
}
