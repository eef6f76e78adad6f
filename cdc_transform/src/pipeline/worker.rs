use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::batching::{windowed::WindowedBatcher, Batch, BatchConfig};
use super::checkpoints::tracker::CheckpointHandle;
use super::dead_letter::{DeadLetterEntry, DeadLetterSink};
use super::decoder::RecordDecoder;
use super::metrics::{add, incr, PipelineMetrics};
use super::normalizer::Normalizer;
use super::sinks::{commit_batch, RetryPolicy, SinkWriter};
use super::sources::{RawBatch, Transport};
use super::PipelineError;
use crate::config::{PipelineConfig, StartPosition};

/// One logical worker per source partition. Owns that partition's normalizer
/// and batcher exclusively; stages run in strict sequence because checkpoint
/// correctness depends on write-then-checkpoint ordering within a partition.
pub(crate) struct PartitionWorker<T, S, D> {
    partition: String,
    transport: Arc<T>,
    sink: Arc<S>,
    dead_letter: Arc<D>,
    checkpoints: CheckpointHandle,
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
}

impl<T, S, D> PartitionWorker<T, S, D>
where
    T: Transport + 'static,
    S: SinkWriter + 'static,
    D: DeadLetterSink + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        partition: String,
        transport: Arc<T>,
        sink: Arc<S>,
        dead_letter: Arc<D>,
        checkpoints: CheckpointHandle,
        config: PipelineConfig,
        metrics: Arc<PipelineMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            partition,
            transport,
            sink,
            dead_letter,
            checkpoints,
            config,
            metrics,
            cancel,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_retry_attempts,
            base_delay: self.config.retry_backoff_base(),
        }
    }

    pub(crate) async fn run(self) {
        let mut cursor = loop {
            match self.resume_position().await {
                Ok(cursor) => break cursor,
                Err(e) => {
                    warn!(partition = %self.partition, "unable to resolve resume position, retrying: {e}");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.config.retry_backoff_base()) => {}
                    }
                }
            }
        };

        let mut normalizer = Normalizer::new(
            &self.partition,
            self.config.dedup_window_size,
            self.metrics.clone(),
        );
        let mut batcher = WindowedBatcher::new(BatchConfig::new(
            self.config.max_batch_window(),
            self.config.max_batch_size_bytes,
            self.config.max_batch_event_count,
        ));

        let mut tick = tokio::time::interval(self.config.flush_tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(partition = %self.partition, ?cursor, "partition worker started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    let due = batcher.flush_due(Utc::now());
                    self.commit_closed(due, batcher.lowest_buffered_sequence()).await;
                },
                polled = self.transport.poll(&self.partition, cursor, self.config.poll_timeout()) => {
                    match polled {
                        Ok(Some(raw)) => {
                            cursor = Some(cursor.map_or(raw.last_sequence, |c| c.max(raw.last_sequence)));
                            self.process(raw, &mut normalizer, &mut batcher).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(partition = %self.partition, "transport poll failed: {e}");
                            tokio::time::sleep(self.config.retry_backoff_base()).await;
                        }
                    }
                },
            }
        }

        self.final_flush(&mut batcher).await;
        info!(partition = %self.partition, "partition worker stopped");
    }

    async fn resume_position(&self) -> Result<Option<u64>, PipelineError> {
        if let Some(committed) = self.checkpoints.committed(&self.partition).await {
            return Ok(Some(committed));
        }
        match self.config.start_position {
            StartPosition::Earliest => Ok(None),
            StartPosition::Latest => Ok(self.transport.latest_sequence(&self.partition).await?),
        }
    }

    /// Decode -> dead-letter rejects -> normalize -> batch, committing any
    /// batch a size threshold closed along the way.
    async fn process(
        &self,
        raw: RawBatch,
        normalizer: &mut Normalizer,
        batcher: &mut WindowedBatcher,
    ) {
        let outcome = RecordDecoder::decode_batch(&self.partition, &raw.data, Utc::now());
        add(&self.metrics.control_skipped, outcome.control_skipped as u64);

        for reject in &outcome.rejected {
            incr(&self.metrics.decode_rejects);
            incr(&self.metrics.dead_lettered_records);
            warn!(partition = %self.partition, "skipping poison record: {}", reject.error);

            let entry = DeadLetterEntry::for_record(&self.partition, reject, Utc::now());
            if let Err(e) = self.dead_letter.publish(entry).await {
                error!(partition = %self.partition, "dead-letter publish failed: {e}");
            }
        }

        let now = Utc::now();
        let mut closed = Vec::new();
        for event in outcome.events {
            if let Some(event) = normalizer.normalize(event) {
                if let Some(batch) = batcher.accept(event, now) {
                    closed.push(batch);
                }
            }
        }

        self.commit_closed(closed, batcher.lowest_buffered_sequence()).await;
    }

    /// Commit a round of closed batches in ascending sequence order, giving
    /// each commit a checkpoint floor that covers its not-yet-committed
    /// siblings. An interruption mid-round (a crash or an expired shutdown
    /// grace period) then leaves the checkpoint at or below every unwritten
    /// event, so those events are redelivered rather than lost.
    async fn commit_closed(&self, mut closed: Vec<Batch>, lowest_open: Option<u64>) {
        closed.sort_by_key(Batch::max_sequence);

        let mut pending = VecDeque::from(closed);
        while let Some(batch) = pending.pop_front() {
            let floor = pending
                .iter()
                .filter_map(Batch::min_sequence)
                .chain(lowest_open)
                .min();
            self.commit(batch, floor).await;
        }
    }

    /// Sink write then checkpoint advance, in that order. A permanent sink
    /// failure dead-letters the batch and the worker moves on; the partition
    /// never halts on a single bad batch.
    async fn commit(&self, batch: Batch, lowest_buffered: Option<u64>) {
        match commit_batch(
            self.sink.as_ref(),
            &batch,
            self.config.sink_prefix.as_deref(),
            &self.retry_policy(),
            &self.metrics,
        )
        .await
        {
            Ok(result) => {
                incr(&self.metrics.batches_committed);
                add(&self.metrics.events_committed, batch.len() as u64);
                info!(
                    partition = %self.partition,
                    location = %result.location,
                    events = batch.len(),
                    bytes = result.byte_size,
                    "committed batch"
                );

                if let Some(mut sequence) = batch.max_sequence() {
                    // Never checkpoint past an event still buffered in an
                    // open batch; it has not been durably written yet.
                    if let Some(low) = lowest_buffered {
                        sequence = sequence.min(low.saturating_sub(1));
                    }
                    self.checkpoints.advance(&self.partition, sequence).await;
                }
            }
            Err(e) => {
                incr(&self.metrics.dead_lettered_batches);
                error!(partition = %self.partition, batch_id = %batch.batch_id, "batch failed permanently: {e}");

                let entry = DeadLetterEntry::for_batch(&batch, &e.to_string(), Utc::now());
                if let Err(dl) = self.dead_letter.publish(entry).await {
                    error!(partition = %self.partition, "dead-letter publish failed: {dl}");
                }
            }
        }
    }

    /// Forced flush on shutdown, bounded by the grace period. An abandoned
    /// in-flight batch is redelivered and reprocessed idempotently after
    /// restart.
    async fn final_flush(&self, batcher: &mut WindowedBatcher) {
        let pending = batcher.flush_all(Utc::now());
        if pending.is_empty() {
            return;
        }

        info!(
            partition = %self.partition,
            batches = pending.len(),
            "flushing open batches before shutdown"
        );

        let commits = self.commit_closed(pending, None);

        if tokio::time::timeout(self.config.shutdown_grace_period(), commits)
            .await
            .is_err()
        {
            warn!(
                partition = %self.partition,
                "shutdown grace period exceeded, abandoning in-flight batch for redelivery"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{DateTime, TimeZone};

    use crate::conversions::change_event::{ChangeEvent, Operation, RowImage};
    use crate::pipeline::checkpoints::memory::MemoryCheckpointStore;
    use crate::pipeline::dead_letter::MemoryDeadLetter;
    use crate::pipeline::sinks::SinkError;
    use crate::pipeline::sources::{MemoryTransport, TransportError};

    /// Sink that records the order of writes; with `stall` set every put
    /// blocks forever, simulating a destination outage at shutdown.
    #[derive(Default)]
    struct RecordingSink {
        keys: Mutex<Vec<String>>,
        stall: bool,
    }

    #[async_trait]
    impl SinkWriter for RecordingSink {
        async fn put(&self, key: &str, _body: Bytes) -> Result<(), SinkError> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.keys.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    /// Transport whose first `failing_lookups` position lookups fail.
    struct FlakyTransport {
        inner: MemoryTransport,
        failing_lookups: AtomicUsize,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        fn partitions(&self) -> Vec<String> {
            self.inner.partitions()
        }

        async fn poll(
            &self,
            partition: &str,
            from_sequence: Option<u64>,
            timeout: Duration,
        ) -> Result<Option<RawBatch>, TransportError> {
            self.inner.poll(partition, from_sequence, timeout).await
        }

        async fn latest_sequence(&self, partition: &str) -> Result<Option<u64>, TransportError> {
            if self
                .failing_lookups
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Unavailable("injected outage".to_string()));
            }
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.latest_sequence(partition).await
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, d, 12, 0, 0).unwrap()
    }

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

    fn config() -> PipelineConfig {
        PipelineConfig {
            max_batch_event_count: 1,
            max_retry_attempts: 1,
            retry_backoff_base_ms: 1,
            shutdown_grace_period_ms: 50,
            poll_timeout_ms: 20,
            flush_tick_ms: 10,
            ..Default::default()
        }
    }

    fn harness<T, S>(
        transport: Arc<T>,
        sink: Arc<S>,
        config: PipelineConfig,
    ) -> (
        PartitionWorker<T, S, MemoryDeadLetter>,
        CheckpointHandle,
        CancellationToken,
    )
    where
        T: Transport + 'static,
        S: SinkWriter + 'static,
    {
        let retry = RetryPolicy {
            max_attempts: config.max_retry_attempts,
            base_delay: config.retry_backoff_base(),
        };
        let checkpoints = CheckpointHandle::new(MemoryCheckpointStore::new(), retry);
        let cancel = CancellationToken::new();
        let worker = PartitionWorker::new(
            "shard-0".to_string(),
            transport,
            sink,
            Arc::new(MemoryDeadLetter::new()),
            checkpoints.clone(),
            config,
            PipelineMetrics::shared(),
            cancel.clone(),
        );
        (worker, checkpoints, cancel)
    }

    #[tokio::test]
    async fn sibling_batches_commit_in_sequence_order() {
        let sink = Arc::new(RecordingSink::default());
        let (worker, checkpoints, _cancel) = harness(
            Arc::new(MemoryTransport::new(&["shard-0"])),
            sink.clone(),
            config(),
        );

        let day_one = Batch::close(
            "ingest_date=2026-02-07".to_string(),
            (1..=4).map(|seq| event(seq, day(7))).collect(),
            day(7),
            day(7),
        );
        let day_two = Batch::close(
            "ingest_date=2026-02-08".to_string(),
            (5..=6).map(|seq| event(seq, day(8))).collect(),
            day(8),
            day(8),
        );

        // Handed over out of order, the way a map drain can.
        worker.commit_closed(vec![day_two, day_one], None).await;

        let keys = sink.keys.lock().unwrap().clone();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].contains("ingest_date=2026-02-07"));
        assert!(keys[1].contains("ingest_date=2026-02-08"));
        assert_eq!(checkpoints.committed("shard-0").await, Some(6));
        checkpoints.shutdown().await;
    }

    #[tokio::test]
    async fn stalled_final_flush_never_checkpoints_unwritten_events() {
        let sink = Arc::new(RecordingSink {
            stall: true,
            ..Default::default()
        });
        let (worker, checkpoints, _cancel) = harness(
            Arc::new(MemoryTransport::new(&["shard-0"])),
            sink.clone(),
            config(),
        );

        // One partition's events split across two ingest dates, so the forced
        // flush closes two sibling batches in the same round.
        let mut batcher = WindowedBatcher::new(BatchConfig::new(
            chrono::Duration::seconds(60),
            usize::MAX,
            100,
        ));
        for seq in 1..=4 {
            batcher.accept(event(seq, day(7)), day(7));
        }
        for seq in 5..=6 {
            batcher.accept(event(seq, day(8)), day(8));
        }

        worker.final_flush(&mut batcher).await;

        // The stalled write was abandoned at the grace deadline. Nothing
        // became durable, so nothing may be checkpointed; every event is
        // redelivered on restart.
        assert!(sink.keys.lock().unwrap().is_empty());
        assert_eq!(checkpoints.committed("shard-0").await, None);
        checkpoints.shutdown().await;
    }

    #[tokio::test]
    async fn startup_transport_outage_is_retried_not_fatal() {
        let transport = Arc::new(FlakyTransport {
            inner: MemoryTransport::new(&["shard-0"]),
            failing_lookups: AtomicUsize::new(2),
            lookups: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let (worker, checkpoints, cancel) = harness(
            transport.clone(),
            sink.clone(),
            PipelineConfig {
                start_position: StartPosition::Latest,
                ..config()
            },
        );

        let run = tokio::spawn(worker.run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while transport.lookups.load(Ordering::SeqCst) == 0 {
            if tokio::time::Instant::now() > deadline {
                panic!("worker never got past the startup outage");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        transport.inner.push(
            "shard-0",
            1,
            r#"{"data": {"id": 1}, "metadata": {"record-type": "data", "operation": "insert", "timestamp": "2026-02-07T10:00:00Z", "sequence": 1}}"#,
        );

        while checkpoints.committed("shard-0").await != Some(1) {
            if tokio::time::Instant::now() > deadline {
                panic!("worker never committed after the startup outage");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        run.await.unwrap();
        checkpoints.shutdown().await;
    }
}
