use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown partition {0:?}")]
    UnknownPartition(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// One pull's worth of framed records from a single transport partition.
/// `last_sequence` is the position of the final record; the worker resumes
/// its next poll after it.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub source_partition: String,
    pub data: Bytes,
    pub last_sequence: u64,
}

/// The partitioned, retained log feeding the pipeline.
///
/// Contract: at-least-once delivery per partition; records within a partition
/// arrive in non-decreasing position order and may repeat on redelivery, but
/// are never silently reordered-and-dropped. Record positions double as the
/// envelope sequence the normalizer dedups on.
#[async_trait]
pub trait Transport: Send + Sync {
    fn partitions(&self) -> Vec<String>;

    /// Pull records positioned strictly after `from_sequence` (`None` means
    /// from the earliest retained record). Returns `Ok(None)` when nothing
    /// arrives within `timeout`.
    async fn poll(
        &self,
        partition: &str,
        from_sequence: Option<u64>,
        timeout: Duration,
    ) -> Result<Option<RawBatch>, TransportError>;

    /// Highest retained position, for `start_position: latest` resumes.
    async fn latest_sequence(&self, partition: &str) -> Result<Option<u64>, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn partitions(&self) -> Vec<String> {
        (**self).partitions()
    }

    async fn poll(
        &self,
        partition: &str,
        from_sequence: Option<u64>,
        timeout: Duration,
    ) -> Result<Option<RawBatch>, TransportError> {
        (**self).poll(partition, from_sequence, timeout).await
    }

    async fn latest_sequence(&self, partition: &str) -> Result<Option<u64>, TransportError> {
        (**self).latest_sequence(partition).await
    }
}

/// In-memory retained log for tests and demos. Records are kept after
/// delivery, so polling again from an older position redelivers them exactly
/// like the real transport would.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    logs: Mutex<HashMap<String, Vec<(u64, Bytes)>>>,
    arrived: Notify,
}

impl MemoryTransport {
    pub fn new(partitions: &[&str]) -> Self {
        let logs = partitions
            .iter()
            .map(|p| (p.to_string(), Vec::new()))
            .collect();
        Self {
            logs: Mutex::new(logs),
            arrived: Notify::new(),
        }
    }

    /// Append one framed record at `sequence`. Appending an already-delivered
    /// position again simulates transport redelivery.
    pub fn push(&self, partition: &str, sequence: u64, record: impl Into<Bytes>) {
        let mut logs = self.logs.lock().unwrap();
        logs.entry(partition.to_string())
            .or_default()
            .push((sequence, record.into()));
        drop(logs);
        self.arrived.notify_waiters();
    }

    fn take_after(
        &self,
        partition: &str,
        from_sequence: Option<u64>,
    ) -> Result<Option<RawBatch>, TransportError> {
        let logs = self.logs.lock().unwrap();
        let log = logs
            .get(partition)
            .ok_or_else(|| TransportError::UnknownPartition(partition.to_string()))?;

        let mut data = BytesMut::new();
        let mut last_sequence = 0u64;
        for (sequence, record) in log {
            if from_sequence.is_some_and(|from| *sequence <= from) {
                continue;
            }
            data.extend_from_slice(record);
            data.extend_from_slice(b"\n");
            last_sequence = last_sequence.max(*sequence);
        }

        if data.is_empty() {
            return Ok(None);
        }

        Ok(Some(RawBatch {
            source_partition: partition.to_string(),
            data: data.freeze(),
            last_sequence,
        }))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn partitions(&self) -> Vec<String> {
        let mut partitions: Vec<String> = self.logs.lock().unwrap().keys().cloned().collect();
        partitions.sort();
        partitions
    }

    async fn poll(
        &self,
        partition: &str,
        from_sequence: Option<u64>,
        timeout: Duration,
    ) -> Result<Option<RawBatch>, TransportError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(batch) = self.take_after(partition, from_sequence)? {
                return Ok(Some(batch));
            }

            let notified = self.arrived.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn latest_sequence(&self, partition: &str) -> Result<Option<u64>, TransportError> {
        let logs = self.logs.lock().unwrap();
        let log = logs
            .get(partition)
            .ok_or_else(|| TransportError::UnknownPartition(partition.to_string()))?;
        Ok(log.iter().map(|(sequence, _)| *sequence).max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_returns_records_after_the_cursor() {
        let transport = MemoryTransport::new(&["shard-0"]);
        transport.push("shard-0", 1, "a");
        transport.push("shard-0", 2, "b");

        let batch = transport
            .poll("shard-0", Some(1), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(&batch.data[..], b"b\n");
        assert_eq!(batch.last_sequence, 2);
    }

    #[tokio::test]
    async fn poll_times_out_on_an_empty_partition() {
        let transport = MemoryTransport::new(&["shard-0"]);
        let polled = transport
            .poll("shard-0", None, Duration::from_millis(5))
            .await
            .unwrap();
        assert!(polled.is_none());
    }

    #[tokio::test]
    async fn records_are_retained_for_redelivery() {
        let transport = MemoryTransport::new(&["shard-0"]);
        transport.push("shard-0", 1, "a");

        let first = transport
            .poll("shard-0", None, Duration::from_millis(10))
            .await
            .unwrap();
        let again = transport
            .poll("shard-0", None, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(first.unwrap().data, again.unwrap().data);
    }

    #[tokio::test]
    async fn unknown_partition_is_an_error() {
        let transport = MemoryTransport::new(&["shard-0"]);
        let err = transport
            .poll("shard-9", None, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownPartition(_)));
    }
}
