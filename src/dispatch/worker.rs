use super::apply::{ApplyError, EventApplier};
use crate::config::PipelineConfig;
use crate::coordination::{with_timeout, CoordinationStore, Keys, StoreError};
use crate::metrics::{PipelineMetrics, ProcessOutcome};
use crate::types::{DeadLetterEntry, EventStatus, WebhookEvent};
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to one dequeued event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Succeeded,
    /// Parked in the delayed set until `delay` has elapsed.
    Retrying { retry_count: u32, delay: Duration },
    DeadLettered { retry_count: u32 },
    /// Shut down mid-apply; pushed back unchanged.
    Requeued,
    /// Could not be written back to the store before a hard stop.
    Unpersisted,
}

/// A dequeued event together with the exact entry that sits in the
/// worker's in-flight list.
struct Claimed {
    raw: String,
    event: WebhookEvent,
}

/// One member of the dispatch pool. Workers share nothing but the store,
/// the applier and the atomic counters.
///
/// Every pop moves the entry into this worker's own in-flight list, and the
/// entry only leaves it once its outcome is safely stored. Whatever is left
/// there after a crash or a lost reply is put back on the queue before the
/// worker dequeues again.
pub struct Worker {
    id: usize,
    store: Arc<dyn CoordinationStore>,
    applier: Arc<dyn EventApplier>,
    metrics: Arc<PipelineMetrics>,
    config: PipelineConfig,
    keys: Keys,
    inflight: String,
    /// Set when the in-flight list may hold entries nobody is working on.
    needs_recovery: AtomicBool,
    /// Stop dequeuing; finish what is in hand.
    stop: CancellationToken,
    /// Abandon in-flight applies and hand their events back.
    abort: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        store: Arc<dyn CoordinationStore>,
        applier: Arc<dyn EventApplier>,
        metrics: Arc<PipelineMetrics>,
        config: PipelineConfig,
        stop: CancellationToken,
        abort: CancellationToken,
    ) -> Self {
        let keys = Keys::new(config.key_prefix.clone());
        let inflight = keys.inflight(&format!("{}-{id}", config.consumer_id));
        Self {
            id,
            store,
            applier,
            metrics,
            config,
            keys,
            inflight,
            needs_recovery: AtomicBool::new(true),
            stop,
            abort,
        }
    }

    pub async fn run(&self) {
        info!(worker_id = self.id, "dispatch worker starting");

        while !self.stop.is_cancelled() {
            let step = match self.recover_if_needed().await {
                Ok(()) => self.run_once().await,
                Err(e) => Err(e),
            };
            match step {
                Ok(_) => {}
                Err(e) => {
                    self.metrics.record_store_error();
                    warn!(
                        worker_id = self.id,
                        error = %e,
                        "coordination store unavailable; pausing dequeue"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.store_retry_interval) => {}
                        _ = self.stop.cancelled() => break,
                    }
                }
            }
        }

        info!(worker_id = self.id, "dispatch worker stopped");
    }

    /// Put entries left in this worker's in-flight list back at the head of
    /// the queue. Only called between batches, when nothing is in hand.
    async fn recover_if_needed(&self) -> Result<(), StoreError> {
        if !self.needs_recovery.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let queue = self.keys.queue();
        match with_timeout(self.config.store_timeout, self.store.recover(&self.inflight, &queue)).await {
            Ok(0) => Ok(()),
            Ok(moved) => {
                warn!(worker_id = self.id, moved, "returned unacknowledged events to the queue");
                Ok(())
            }
            Err(e) => {
                self.needs_recovery.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Dequeue one batch and process it. Returns how many events were taken.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let batch = self.dequeue_batch().await?;
        let taken = batch.len();
        if taken > 0 {
            debug!(worker_id = self.id, batch_size = taken, "processing batch");
        }

        let mut pending = batch.into_iter();
        while let Some(claimed) = pending.next() {
            if self.stop.is_cancelled() {
                let rest: Vec<Claimed> = std::iter::once(claimed).chain(pending).collect();
                let raws: Vec<String> = rest.iter().map(|c| c.raw.clone()).collect();
                if self.hand_back(rest.into_iter().map(|c| c.event).collect()).await {
                    for raw in &raws {
                        self.ack(raw).await;
                    }
                }
                break;
            }
            let Claimed { raw, event } = claimed;
            if self.process_event(event).await != EventOutcome::Unpersisted {
                self.ack(&raw).await;
            }
        }
        Ok(taken)
    }

    /// Take up to `batch_size` events, waiting no longer than
    /// `batch_timeout` in total.
    async fn dequeue_batch(&self) -> Result<Vec<Claimed>, StoreError> {
        let queue = self.keys.queue();
        let deadline = Instant::now() + self.config.batch_timeout;
        let mut batch = Vec::with_capacity(self.config.batch_size);

        while batch.len() < self.config.batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            // The pop bounds itself; the outer timer only guards a hung store.
            // A reply lost to it leaves the entry in the in-flight list.
            let popped = with_timeout(
                remaining + self.config.store_timeout,
                self.store.pop_blocking(&queue, &self.inflight, remaining),
            )
            .await;

            let raw = match popped {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    self.needs_recovery.store(true, Ordering::SeqCst);
                    if batch.is_empty() {
                        return Err(e);
                    }
                    warn!(worker_id = self.id, error = %e, "store failed mid-batch; processing partial batch");
                    break;
                }
            };

            match WebhookEvent::from_json(&raw) {
                Ok(event) => batch.push(Claimed { raw, event }),
                Err(e) => self.quarantine(raw, e.to_string()).await,
            }

            if self.stop.is_cancelled() {
                break;
            }
        }
        Ok(batch)
    }

    pub async fn process_event(&self, mut event: WebhookEvent) -> EventOutcome {
        event.begin_processing();

        let applied = tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            r = tokio::time::timeout(self.config.apply_timeout, self.applier.apply(&event)) => Some(r),
        };

        match applied {
            None => {
                warn!(worker_id = self.id, event_id = %event.event_id, "apply interrupted by shutdown; requeueing");
                if self.hand_back(vec![event]).await {
                    EventOutcome::Requeued
                } else {
                    EventOutcome::Unpersisted
                }
            }
            Some(Ok(Ok(()))) => {
                event.status = EventStatus::Succeeded;
                self.metrics.record_processed(ProcessOutcome::Succeeded);
                info!(
                    worker_id = self.id,
                    event_id = %event.event_id,
                    module = %event.module,
                    retry_count = event.retry_count,
                    "event applied"
                );
                EventOutcome::Succeeded
            }
            Some(Ok(Err(e))) => self.handle_failure(event, e).await,
            Some(Err(_)) => {
                let e = ApplyError::Timeout(self.config.apply_timeout);
                self.handle_failure(event, e).await
            }
        }
    }

    async fn handle_failure(&self, mut event: WebhookEvent, cause: ApplyError) -> EventOutcome {
        event.retry_count = event.retry_count.saturating_add(1);
        let retry_count = event.retry_count;

        if retry_count < self.config.max_retries {
            let delay = self.config.backoff().delay_for_retry(retry_count);
            let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            let delayed = self.keys.delayed();
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => return self.unencodable(&event, e),
            };

            warn!(
                worker_id = self.id,
                event_id = %event.event_id,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %cause,
                "apply failed; scheduling retry"
            );

            let (store, set, value) = (&self.store, delayed.as_str(), json.as_str());
            let stored = self
                .persist("schedule retry", &event.event_id, || async move {
                    store.schedule(set, value, ready_at).await
                })
                .await;
            if !stored {
                return self.lost(&json);
            }
            self.metrics.record_processed(ProcessOutcome::Retried);
            EventOutcome::Retrying { retry_count, delay }
        } else {
            event.status = EventStatus::DeadLettered;
            let entry = DeadLetterEntry {
                event,
                last_error: cause.to_string(),
                dead_lettered_at: Utc::now(),
            };
            let dead_letter = self.keys.dead_letter();
            let json = match serde_json::to_string(&entry) {
                Ok(json) => json,
                Err(e) => return self.unencodable(&entry.event, e),
            };

            error!(
                worker_id = self.id,
                event_id = %entry.event.event_id,
                module = %entry.event.module,
                retry_count,
                error = %cause,
                "retries exhausted; moving event to dead-letter list"
            );

            let (store, list, value) = (&self.store, dead_letter.as_str(), json.as_str());
            let stored = self
                .persist("dead-letter event", &entry.event.event_id, || async move {
                    store.push(list, value).await.map(|_| ())
                })
                .await;
            if !stored {
                return self.lost(&json);
            }
            self.metrics.record_processed(ProcessOutcome::DeadLettered);
            EventOutcome::DeadLettered { retry_count }
        }
    }

    /// Return events to the head of the queue, preserving their order.
    /// `false` when any of them could not be written back.
    async fn hand_back(&self, events: Vec<WebhookEvent>) -> bool {
        let queue = self.keys.queue();
        let mut all_stored = true;
        for event in events.into_iter().rev() {
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    self.unencodable(&event, e);
                    all_stored = false;
                    continue;
                }
            };
            let (store, list, value) = (&self.store, queue.as_str(), json.as_str());
            let stored = self
                .persist("requeue event", &event.event_id, || async move {
                    store.push_front(list, value).await.map(|_| ())
                })
                .await;
            if !stored {
                self.lost(&json);
                all_stored = false;
            }
        }
        all_stored
    }

    async fn quarantine(&self, raw: String, reason: String) {
        error!(worker_id = self.id, error = %reason, "undecodable queue entry; quarantining");
        let poison = self.keys.poison();
        let (store, list, value) = (&self.store, poison.as_str(), raw.as_str());
        let stored = self
            .persist("quarantine entry", "<undecodable>", || async move {
                store.push(list, value).await.map(|_| ())
            })
            .await;
        if stored {
            self.ack(&raw).await;
        } else {
            self.lost(&raw);
        }
    }

    /// Drop a finished entry from the in-flight list. If that fails the
    /// entry is recovered later and applied again, never lost.
    async fn ack(&self, raw: &str) {
        let (store, inflight) = (&self.store, self.inflight.as_str());
        let acked = self
            .persist("acknowledge event", "<in-flight>", || async move {
                store.ack(inflight, raw).await
            })
            .await;
        if !acked {
            warn!(worker_id = self.id, "entry left in the in-flight list; it will be redelivered");
        }
    }

    /// Keep trying a store write until it lands or a hard stop arrives.
    async fn persist<F, Fut>(&self, what: &'static str, event_id: &str, mut op: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        loop {
            match with_timeout(self.config.store_timeout, op()).await {
                Ok(()) => return true,
                Err(e) => {
                    self.metrics.record_store_error();
                    warn!(worker_id = self.id, event_id, error = %e, "failed to {what}; will retry");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.store_retry_interval) => {}
                        _ = self.abort.cancelled() => return false,
                    }
                }
            }
        }
    }

    /// Last resort: the full record goes to the log so an operator can replay it.
    fn lost(&self, json: &str) -> EventOutcome {
        error!(worker_id = self.id, record = %json, "could not persist event before shutdown");
        EventOutcome::Unpersisted
    }

    fn unencodable(&self, event: &WebhookEvent, e: serde_json::Error) -> EventOutcome {
        error!(worker_id = self.id, event_id = %event.event_id, error = %e, "event could not be encoded");
        EventOutcome::Unpersisted
    }
}
