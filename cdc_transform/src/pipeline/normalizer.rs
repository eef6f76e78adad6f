use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::conversions::change_event::ChangeEvent;
use crate::pipeline::metrics::{incr, PipelineMetrics};

/// Per-partition dedup and anomaly tracking. Owned exclusively by one
/// partition worker; never shared.
///
/// The dedup window is the mechanism that makes at-least-once transport
/// redelivery idempotent: a `(source_partition, sequence)` pair seen within
/// the window is dropped. The window is bounded; entries older than
/// `capacity` events are evicted FIFO, so it must be sized to cover the
/// transport's worst-case redelivery span.
pub struct Normalizer {
    source_partition: String,
    capacity: usize,
    seen: HashSet<u64>,
    order: VecDeque<u64>,
    highest_sequence: Option<u64>,
    metrics: Arc<PipelineMetrics>,
}

impl Normalizer {
    pub fn new(source_partition: &str, capacity: usize, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            source_partition: source_partition.to_string(),
            capacity: capacity.max(1),
            seen: HashSet::with_capacity(capacity.max(1)),
            order: VecDeque::with_capacity(capacity.max(1)),
            highest_sequence: None,
            metrics,
        }
    }

    /// Returns `None` for duplicates. Out-of-order arrivals are counted and
    /// passed through; the transport keeps partitions monotonic in practice,
    /// so a regression is an anomaly worth surfacing but never fatal.
    pub fn normalize(&mut self, event: ChangeEvent) -> Option<ChangeEvent> {
        debug_assert_eq!(event.source_partition, self.source_partition);

        if self.seen.contains(&event.sequence) {
            debug!(
                partition = %self.source_partition,
                sequence = event.sequence,
                "dropping redelivered event"
            );
            incr(&self.metrics.duplicates);
            return None;
        }

        if let Some(highest) = self.highest_sequence {
            if event.sequence < highest {
                warn!(
                    partition = %self.source_partition,
                    sequence = event.sequence,
                    highest,
                    "out-of-order arrival, processing anyway"
                );
                incr(&self.metrics.out_of_order);
            }
        }

        self.remember(event.sequence);
        Some(event)
    }

    pub fn highest_sequence(&self) -> Option<u64> {
        self.highest_sequence
    }

    fn remember(&mut self, sequence: u64) {
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(sequence);
        self.seen.insert(sequence);
        self.highest_sequence = Some(self.highest_sequence.map_or(sequence, |h| h.max(sequence)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversions::change_event::{Operation, RowImage};
    use chrono::{TimeZone, Utc};

    fn event(seq: u64) -> ChangeEvent {
        let ts = Utc.with_ymd_and_hms(2026, 2, 7, 12, 0, 0).unwrap();
        ChangeEvent {
            source_partition: "shard-0".to_string(),
            sequence: seq,
            operation: Operation::Insert,
            key: RowImage::from([("id".to_string(), seq.into())]),
            before_image: None,
            after_image: Some(RowImage::new()),
            schema_name: "hr".to_string(),
            table_name: "employees".to_string(),
            transaction_id: None,
            source_timestamp: ts,
            ingest_timestamp: ts,
        }
    }

    fn normalizer(capacity: usize) -> (Normalizer, Arc<PipelineMetrics>) {
        let metrics = PipelineMetrics::shared();
        (Normalizer::new("shard-0", capacity, metrics.clone()), metrics)
    }

    #[test]
    fn duplicate_sequence_is_dropped() {
        let (mut n, metrics) = normalizer(16);

        assert!(n.normalize(event(1)).is_some());
        assert!(n.normalize(event(2)).is_some());
        assert!(n.normalize(event(1)).is_none());
        assert_eq!(metrics.snapshot().duplicates, 1);
    }

    #[test]
    fn out_of_order_is_counted_but_processed() {
        let (mut n, metrics) = normalizer(16);

        n.normalize(event(5));
        let out = n.normalize(event(3));

        assert!(out.is_some());
        assert_eq!(metrics.snapshot().out_of_order, 1);
        assert_eq!(n.highest_sequence(), Some(5));
    }

    #[test]
    fn window_eviction_forgets_oldest_entries() {
        let (mut n, metrics) = normalizer(2);

        n.normalize(event(1));
        n.normalize(event(2));
        n.normalize(event(3)); // evicts seq 1

        // Outside the window: reprocessed, not treated as duplicate. The
        // idempotent sink key makes the re-commit harmless.
        assert!(n.normalize(event(1)).is_some());
        assert_eq!(metrics.snapshot().duplicates, 0);

        // Still inside the window: dropped.
        assert!(n.normalize(event(3)).is_none());
        assert_eq!(metrics.snapshot().duplicates, 1);
    }
}
