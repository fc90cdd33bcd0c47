use super::{CoordinationStore, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Expired keys are swept once per this many claims.
const PURGE_EVERY: usize = 256;

#[derive(Default)]
struct Inner {
    keys: HashMap<String, (String, Instant)>,
    claims_since_purge: usize,
    lists: HashMap<String, VecDeque<String>>,
    /// Delayed sets keyed by `(ready_at_ms, insertion seq)`.
    delayed: HashMap<String, BTreeMap<(i64, u64), String>>,
}

/// Process-local store. Each method holds one lock for its whole body, which
/// gives the same atomicity the shared store gets from single commands and
/// scripts. Used by tests and single-process deployments.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    pushed: Notify,
    seq: AtomicU64,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            pushed: Notify::new(),
            seq: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Plain head pop, for inspecting lists in tests.
    #[cfg(test)]
    pub(crate) async fn pop(&self, list: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock()?;
        Ok(inner.lists.get_mut(list).and_then(VecDeque::pop_front))
    }

    fn try_move(&self, list: &str, inflight: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock()?;
        let Some(item) = inner.lists.get_mut(list).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        inner
            .lists
            .entry(inflight.to_string())
            .or_default()
            .push_back(item.clone());
        Ok(Some(item))
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys
            .len()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        inner.claims_since_purge += 1;
        if inner.claims_since_purge >= PURGE_EVERY {
            inner.claims_since_purge = 0;
            inner.keys.retain(|_, (_, expires_at)| *expires_at > now);
        }
        if let Some((_, expires_at)) = inner.keys.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        inner
            .keys
            .insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.keys.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        match inner.keys.get_mut(key) {
            Some((_, expires_at)) if *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn push_bounded(
        &self,
        list: &str,
        value: &str,
        max_len: usize,
    ) -> Result<Option<usize>, StoreError> {
        let len = {
            let mut inner = self.lock()?;
            let items = inner.lists.entry(list.to_string()).or_default();
            if items.len() >= max_len {
                return Ok(None);
            }
            items.push_back(value.to_string());
            items.len()
        };
        self.pushed.notify_waiters();
        Ok(Some(len))
    }

    async fn push(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        let len = {
            let mut inner = self.lock()?;
            let items = inner.lists.entry(list.to_string()).or_default();
            items.push_back(value.to_string());
            items.len()
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn push_front(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        let len = {
            let mut inner = self.lock()?;
            let items = inner.lists.entry(list.to_string()).or_default();
            items.push_front(value.to_string());
            items.len()
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn pop_blocking(
        &self,
        list: &str,
        inflight: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_move(list, inflight)? {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, inflight: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if let Some(items) = inner.lists.get_mut(inflight) {
            if let Some(pos) = items.iter().position(|v| v == value) {
                items.remove(pos);
            }
        }
        Ok(())
    }

    async fn recover(&self, inflight: &str, list: &str) -> Result<usize, StoreError> {
        let moved = {
            let mut inner = self.lock()?;
            let Some(pending) = inner.lists.remove(inflight) else {
                return Ok(0);
            };
            let moved = pending.len();
            let items = inner.lists.entry(list.to_string()).or_default();
            for item in pending.into_iter().rev() {
                items.push_front(item);
            }
            moved
        };
        if moved > 0 {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn replace_head(
        &self,
        from: &str,
        expected: &str,
        to: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        {
            let mut inner = self.lock()?;
            let Some(items) = inner.lists.get_mut(from) else {
                return Ok(false);
            };
            if items.front().map(String::as_str) != Some(expected) {
                return Ok(false);
            }
            items.pop_front();
            inner
                .lists
                .entry(to.to_string())
                .or_default()
                .push_back(value.to_string());
        }
        self.pushed.notify_waiters();
        Ok(true)
    }

    async fn len(&self, list: &str) -> Result<usize, StoreError> {
        Ok(self.lock()?.lists.get(list).map_or(0, VecDeque::len))
    }

    async fn range(&self, list: &str, count: usize) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()?
            .lists
            .get(list)
            .map(|items| items.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn schedule(&self, set: &str, value: &str, ready_at_ms: i64) -> Result<(), StoreError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.lock()?
            .delayed
            .entry(set.to_string())
            .or_default()
            .insert((ready_at_ms, seq), value.to_string());
        Ok(())
    }

    async fn promote_due(
        &self,
        set: &str,
        list: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let moved = {
            let mut inner = self.lock()?;
            let due: Vec<String> = match inner.delayed.get_mut(set) {
                Some(entries) => {
                    let keys: Vec<(i64, u64)> = entries
                        .range(..=(now_ms, u64::MAX))
                        .take(limit)
                        .map(|(k, _)| *k)
                        .collect();
                    keys.iter().filter_map(|k| entries.remove(k)).collect()
                }
                None => Vec::new(),
            };
            let moved = due.len();
            inner
                .lists
                .entry(list.to_string())
                .or_default()
                .extend(due);
            moved
        };
        if moved > 0 {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn scheduled_len(&self, set: &str) -> Result<usize, StoreError> {
        Ok(self.lock()?.delayed.get(set).map_or(0, BTreeMap::len))
    }
}
