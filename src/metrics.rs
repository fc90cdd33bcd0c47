//! Process-wide pipeline counters.
//!
//! Created once at start-up and shared by `Arc`; they only reset when the
//! process restarts. Increments are relaxed atomics so no business logic is
//! ever serialized behind them.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    accepted: AtomicU64,
    rejected_auth: AtomicU64,
    rejected_duplicate: AtomicU64,
    rejected_malformed: AtomicU64,
    rejected_capacity: AtomicU64,
    rejected_oversize: AtomicU64,
    store_errors: AtomicU64,
    processed_succeeded: AtomicU64,
    processed_retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Ingress outcome, one counter each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    Accepted,
    RejectedAuth,
    RejectedDuplicate,
    RejectedMalformed,
    RejectedCapacity,
    RejectedOversize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Succeeded,
    Retried,
    DeadLettered,
}

/// Point-in-time counter values plus live store depths.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub accepted: u64,
    pub rejected_auth: u64,
    pub rejected_duplicate: u64,
    pub rejected_malformed: u64,
    pub rejected_capacity: u64,
    pub rejected_oversize: u64,
    pub store_errors: u64,
    pub processed_succeeded: u64,
    pub processed_retried: u64,
    pub dead_lettered: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delayed_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_depth: Option<usize>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ingress(&self, outcome: IngressOutcome) {
        let counter = match outcome {
            IngressOutcome::Accepted => &self.accepted,
            IngressOutcome::RejectedAuth => &self.rejected_auth,
            IngressOutcome::RejectedDuplicate => &self.rejected_duplicate,
            IngressOutcome::RejectedMalformed => &self.rejected_malformed,
            IngressOutcome::RejectedCapacity => &self.rejected_capacity,
            IngressOutcome::RejectedOversize => &self.rejected_oversize,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, outcome: ProcessOutcome) {
        let counter = match outcome {
            ProcessOutcome::Succeeded => &self.processed_succeeded,
            ProcessOutcome::Retried => &self.processed_retried,
            ProcessOutcome::DeadLettered => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            accepted: load(&self.accepted),
            rejected_auth: load(&self.rejected_auth),
            rejected_duplicate: load(&self.rejected_duplicate),
            rejected_malformed: load(&self.rejected_malformed),
            rejected_capacity: load(&self.rejected_capacity),
            rejected_oversize: load(&self.rejected_oversize),
            store_errors: load(&self.store_errors),
            processed_succeeded: load(&self.processed_succeeded),
            processed_retried: load(&self.processed_retried),
            dead_lettered: load(&self.dead_lettered),
            queue_depth: None,
            delayed_depth: None,
            dead_letter_depth: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn each_rejection_class_has_its_own_counter() {
        let m = PipelineMetrics::new();
        m.record_ingress(IngressOutcome::Accepted);
        m.record_ingress(IngressOutcome::RejectedAuth);
        m.record_ingress(IngressOutcome::RejectedAuth);
        m.record_ingress(IngressOutcome::RejectedDuplicate);
        m.record_ingress(IngressOutcome::RejectedCapacity);
        let snap = m.snapshot();
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.rejected_auth, 2);
        assert_eq!(snap.rejected_duplicate, 1);
        assert_eq!(snap.rejected_malformed, 0);
        assert_eq!(snap.rejected_capacity, 1);
    }

    #[test]
    fn depths_are_omitted_until_filled() {
        let json = serde_json::to_value(PipelineMetrics::new().snapshot()).unwrap();
        assert!(json.get("queue_depth").is_none());
        assert_eq!(json["accepted"], 0);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let m = Arc::new(PipelineMetrics::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_processed(ProcessOutcome::Succeeded);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(m.snapshot().processed_succeeded, 4000);
    }
}
