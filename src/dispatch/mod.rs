//! Dispatch processor: a fixed pool of workers draining the shared queue.
//!
//! ```text
//!   queue ──pop──► worker ──apply──► ok ────────► done
//!     ▲                        │
//!     │                        └─ fail ─► retry_count += 1
//!     │                                     │ < max ──► delayed set
//!   promoter ◄──── due entries ─────────────┘ = max ──► dead-letter list
//! ```

mod apply;
mod backoff;
mod worker;

pub use apply::{ApplyError, EventApplier, HttpApplier, LogApplier};
pub use backoff::BackoffPolicy;
pub use worker::{EventOutcome, Worker};

use crate::config::PipelineConfig;
use crate::coordination::{with_timeout, CoordinationStore, Keys};
use crate::metrics::PipelineMetrics;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How many due retries one promotion pass moves.
const PROMOTE_BATCH: usize = 256;

pub struct Processor {
    store: Arc<dyn CoordinationStore>,
    applier: Arc<dyn EventApplier>,
    metrics: Arc<PipelineMetrics>,
    config: PipelineConfig,
}

impl Processor {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        applier: Arc<dyn EventApplier>,
        metrics: Arc<PipelineMetrics>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            applier,
            metrics,
            config,
        }
    }

    /// Spawn `worker_count` workers plus the retry promoter.
    pub fn start(self) -> ProcessorHandle {
        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let mut tasks = JoinSet::new();

        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "starting dispatch processor"
        );

        for id in 0..self.config.worker_count {
            let worker = Worker::new(
                id,
                self.store.clone(),
                self.applier.clone(),
                self.metrics.clone(),
                self.config.clone(),
                stop.clone(),
                abort.clone(),
            );
            tasks.spawn(async move { worker.run().await });
        }

        tasks.spawn(promote_loop(
            self.store.clone(),
            self.metrics.clone(),
            self.config.clone(),
            stop.clone(),
        ));

        ProcessorHandle {
            stop,
            abort,
            tasks,
            config: self.config,
        }
    }
}

/// Move due retries from the delayed set back onto the queue. Safe to run in
/// every process at once: each pass is one atomic store operation.
async fn promote_loop(
    store: Arc<dyn CoordinationStore>,
    metrics: Arc<PipelineMetrics>,
    config: PipelineConfig,
    stop: CancellationToken,
) {
    let keys = Keys::new(config.key_prefix.clone());
    let (delayed, queue) = (keys.delayed(), keys.queue());

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.promote_interval) => {}
            _ = stop.cancelled() => break,
        }

        let now_ms = Utc::now().timestamp_millis();
        match with_timeout(
            config.store_timeout,
            store.promote_due(&delayed, &queue, now_ms, PROMOTE_BATCH),
        )
        .await
        {
            Ok(0) => {}
            Ok(moved) => debug!(moved, "promoted due retries"),
            Err(e) => {
                metrics.record_store_error();
                warn!(error = %e, "failed to promote due retries");
            }
        }
    }
}

pub struct ProcessorHandle {
    stop: CancellationToken,
    abort: CancellationToken,
    tasks: JoinSet<()>,
    config: PipelineConfig,
}

impl ProcessorHandle {
    /// Stop dequeuing, give in-flight applies `shutdown_grace` to finish, then
    /// abandon whatever is left and hand those events back to the queue.
    pub async fn shutdown(mut self) {
        info!("stopping dispatch processor");
        self.stop.cancel();

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "shutdown grace elapsed; requeueing in-flight events"
            );
            self.abort.cancel();
            while self.tasks.join_next().await.is_some() {}
        }
        info!("dispatch processor stopped");
    }
}
