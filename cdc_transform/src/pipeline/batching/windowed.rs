use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{Batch, BatchConfig};
use crate::conversions::change_event::ChangeEvent;

/// Accumulating state for one output partition key.
struct OpenBatch {
    events: Vec<ChangeEvent>,
    open_since: DateTime<Utc>,
    bytes: usize,
}

/// Groups normalized events into time- or size-bounded batches, one open
/// batch per `partition_key`. Owned exclusively by a partition worker.
///
/// Per partition key the state machine is EMPTY -> OPEN -> (closed) -> EMPTY:
/// the first accepted event opens a batch, later events append, and the batch
/// closes when a size threshold is hit on `accept`, its age limit is hit on
/// `flush_due`, or `flush_all` forces everything out on shutdown. Closing is
/// idempotent; when age and size trip at once there is still exactly one
/// close.
pub struct WindowedBatcher {
    config: BatchConfig,
    open: HashMap<String, OpenBatch>,
}

impl WindowedBatcher {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            open: HashMap::new(),
        }
    }

    /// Append one event, returning the closed batch if this event tripped a
    /// size threshold. The tripping event is included in the closed batch.
    pub fn accept(&mut self, event: ChangeEvent, now: DateTime<Utc>) -> Option<Batch> {
        let key = event.partition_key();
        let encoded_len = event.encoded_len();

        let open = self.open.entry(key.clone()).or_insert_with(|| {
            debug!(partition_key = %key, "opening batch");
            OpenBatch {
                events: Vec::new(),
                open_since: now,
                bytes: 0,
            }
        });

        open.events.push(event);
        open.bytes += encoded_len;

        if open.events.len() >= self.config.max_event_count
            || open.bytes >= self.config.max_size_bytes
        {
            return self.close(&key, now);
        }

        None
    }

    /// Close every batch whose age has reached the window limit. Driven by
    /// the worker's flush tick so a lone event cannot sit open forever.
    pub fn flush_due(&mut self, now: DateTime<Utc>) -> Vec<Batch> {
        let due: Vec<String> = self
            .open
            .iter()
            .filter(|(_, open)| now - open.open_since >= self.config.max_window)
            .map(|(key, _)| key.clone())
            .collect();

        due.iter().filter_map(|key| self.close(key, now)).collect()
    }

    /// Force-close everything regardless of thresholds. Shutdown path: no
    /// event is held across a controlled stop.
    pub fn flush_all(&mut self, now: DateTime<Utc>) -> Vec<Batch> {
        let keys: Vec<String> = self.open.keys().cloned().collect();
        keys.iter().filter_map(|key| self.close(key, now)).collect()
    }

    /// Lowest source sequence still buffered in any open batch. The
    /// checkpoint must never advance to or past a sequence that is still
    /// sitting here uncommitted.
    pub fn lowest_buffered_sequence(&self) -> Option<u64> {
        self.open
            .values()
            .flat_map(|open| open.events.iter().map(|e| e.sequence))
            .min()
    }

    /// Earliest instant at which an open batch becomes due.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.open
            .values()
            .map(|open| open.open_since + self.config.max_window)
            .min()
    }

    pub fn buffered_events(&self) -> usize {
        self.open.values().map(|open| open.events.len()).sum()
    }

    fn close(&mut self, key: &str, now: DateTime<Utc>) -> Option<Batch> {
        let open = self.open.remove(key)?;
        debug!(
            partition_key = %key,
            events = open.events.len(),
            bytes = open.bytes,
            "closing batch"
        );
        Some(Batch::close(
            key.to_string(),
            open.events,
            open.open_since,
            now,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversions::change_event::{Operation, RowImage};
    use chrono::TimeZone;

    fn event(seq: u64, ingest: DateTime<Utc>) -> ChangeEvent {
        ChangeEvent {
            source_partition: "shard-0".to_string(),
            sequence: seq,
            operation: Operation::Insert,
            key: RowImage::from([("id".to_string(), seq.into())]),
            before_image: None,
            after_image: Some(RowImage::from([("city".to_string(), "Pune".into())])),
            schema_name: "hr".to_string(),
            table_name: "employees".to_string(),
            transaction_id: None,
            source_timestamp: ingest,
            ingest_timestamp: ingest,
        }
    }

    fn config(window_secs: i64, max_bytes: usize, max_count: usize) -> BatchConfig {
        BatchConfig::new(chrono::Duration::seconds(window_secs), max_bytes, max_count)
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 7, 12, 0, 0).unwrap()
    }

    #[test]
    fn closes_on_event_count() {
        let mut batcher = WindowedBatcher::new(config(60, usize::MAX, 3));
        let now = base();

        assert!(batcher.accept(event(1, now), now).is_none());
        assert!(batcher.accept(event(2, now), now).is_none());
        let closed = batcher.accept(event(3, now), now).expect("third event closes");

        assert_eq!(closed.len(), 3);
        assert_eq!(closed.max_sequence(), Some(3));
        assert_eq!(batcher.buffered_events(), 0);
    }

    #[test]
    fn closes_on_byte_size() {
        let mut batcher = WindowedBatcher::new(config(60, 1, 1000));
        let now = base();

        let closed = batcher.accept(event(1, now), now);
        assert_eq!(closed.expect("one event exceeds 1 byte").len(), 1);
    }

    #[test]
    fn time_trigger_closes_an_idle_batch() {
        let mut batcher = WindowedBatcher::new(config(60, usize::MAX, 1000));
        let opened = base();

        batcher.accept(event(1, opened), opened);
        assert!(batcher.flush_due(opened + chrono::Duration::seconds(59)).is_empty());

        let closed = batcher.flush_due(opened + chrono::Duration::seconds(60));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].len(), 1);
        assert_eq!(closed[0].open_since, opened);
    }

    #[test]
    fn forced_flush_drops_nothing() {
        let mut batcher = WindowedBatcher::new(config(60, usize::MAX, 1000));
        let now = base();

        for seq in 1..=5 {
            batcher.accept(event(seq, now), now);
        }
        let closed = batcher.flush_all(now + chrono::Duration::seconds(1));

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].len(), 5);
        assert!(batcher.lowest_buffered_sequence().is_none());
    }

    #[test]
    fn events_split_by_ingest_date() {
        let mut batcher = WindowedBatcher::new(config(60, usize::MAX, 1000));
        let day_one = base();
        let day_two = Utc.with_ymd_and_hms(2026, 2, 8, 0, 0, 1).unwrap();

        batcher.accept(event(1, day_one), day_one);
        batcher.accept(event(2, day_two), day_two);

        assert_eq!(batcher.lowest_buffered_sequence(), Some(1));

        let mut closed = batcher.flush_all(day_two);
        closed.sort_by(|a, b| a.partition_key.cmp(&b.partition_key));

        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].partition_key, "ingest_date=2026-02-07");
        assert_eq!(closed[1].partition_key, "ingest_date=2026-02-08");
    }

    #[test]
    fn next_deadline_tracks_oldest_open_batch() {
        let mut batcher = WindowedBatcher::new(config(60, usize::MAX, 1000));
        let now = base();

        assert!(batcher.next_deadline().is_none());
        batcher.accept(event(1, now), now);
        assert_eq!(batcher.next_deadline(), Some(now + chrono::Duration::seconds(60)));
    }
}
