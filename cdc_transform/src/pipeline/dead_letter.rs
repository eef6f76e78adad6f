use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;

use super::batching::Batch;
use super::decoder::RejectedRecord;
use super::sinks::SinkError;

/// One poison record or failed batch, preserved for operator inspection under
/// a timestamped key.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub key: String,
    pub payload: Bytes,
    pub reason: String,
}

impl DeadLetterEntry {
    /// A record the decoder could not parse: raw bytes plus the structured
    /// failure reason.
    pub fn for_record(source_partition: &str, reject: &RejectedRecord, at: DateTime<Utc>) -> Self {
        let reason = reject.error.reason.clone();
        let payload = json!({
            "reason": reason,
            "source_partition": source_partition,
            "offending_offset": reject.error.offending_offset,
            "raw": String::from_utf8_lossy(&reject.raw),
            "occurred_at": at,
        });
        Self {
            key: format!(
                "dead-letter/{source_partition}/{}-offset{}.json",
                key_timestamp(at),
                reject.error.offending_offset
            ),
            payload: Bytes::from(payload.to_string()),
            reason,
        }
    }

    /// A batch the sink permanently refused: serialized rows plus the reason,
    /// so nothing is lost even when the sink rejects it.
    pub fn for_batch(batch: &Batch, reason: &str, at: DateTime<Utc>) -> Self {
        let payload = json!({
            "reason": reason,
            "batch_id": batch.batch_id,
            "partition_key": batch.partition_key,
            "events": &batch.events,
            "occurred_at": at,
        });
        Self {
            key: format!(
                "dead-letter/{}/{}-{}.json",
                batch.partition_key,
                key_timestamp(at),
                batch.batch_id
            ),
            payload: Bytes::from(payload.to_string()),
            reason: reason.to_string(),
        }
    }
}

fn key_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

/// Durable side destination for unprocessable units of work, consumed
/// out-of-band by operators.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, entry: DeadLetterEntry) -> Result<(), SinkError>;
}

#[async_trait]
impl<D: DeadLetterSink + ?Sized> DeadLetterSink for std::sync::Arc<D> {
    async fn publish(&self, entry: DeadLetterEntry) -> Result<(), SinkError> {
        (**self).publish(entry).await
    }
}

/// In-memory dead-letter sink for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryDeadLetter {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl MemoryDeadLetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetter {
    async fn publish(&self, entry: DeadLetterEntry) -> Result<(), SinkError> {
        warn!(key = %entry.key, reason = %entry.reason, "dead-lettered");
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}
