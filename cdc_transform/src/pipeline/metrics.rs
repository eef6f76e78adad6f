use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters surfaced to operators. Shared across all partition workers; every
/// field is monotonic.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub duplicates: AtomicU64,
    pub out_of_order: AtomicU64,
    pub control_skipped: AtomicU64,
    pub decode_rejects: AtomicU64,
    pub sink_retries: AtomicU64,
    pub dead_lettered_records: AtomicU64,
    pub dead_lettered_batches: AtomicU64,
    pub batches_committed: AtomicU64,
    pub events_committed: AtomicU64,
}

impl PipelineMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            duplicates: self.duplicates.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            control_skipped: self.control_skipped.load(Ordering::Relaxed),
            decode_rejects: self.decode_rejects.load(Ordering::Relaxed),
            sink_retries: self.sink_retries.load(Ordering::Relaxed),
            dead_lettered_records: self.dead_lettered_records.load(Ordering::Relaxed),
            dead_lettered_batches: self.dead_lettered_batches.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            events_committed: self.events_committed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub duplicates: u64,
    pub out_of_order: u64,
    pub control_skipped: u64,
    pub decode_rejects: u64,
    pub sink_retries: u64,
    pub dead_lettered_records: u64,
    pub dead_lettered_batches: u64,
    pub batches_committed: u64,
    pub events_committed: u64,
}

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}
