use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::conversions::{
    canonical,
    change_event::{ChangeEvent, Operation, RowImage},
};

/// A record whose framing or envelope was unusable. Carries enough context for
/// the dead-letter sink: the raw bytes plus where in the batch they sat.
#[derive(Debug, Error)]
#[error("record at offset {offending_offset}: {reason}")]
pub struct DecodeError {
    pub reason: String,
    pub offending_offset: usize,
}

#[derive(Debug)]
pub struct RejectedRecord {
    pub error: DecodeError,
    pub raw: Bytes,
}

/// Result of decoding one transport batch. A poison record never aborts the
/// batch; it lands in `rejected` and the rest still decode.
#[derive(Debug, Default)]
pub struct DecodeOutcome {
    pub events: Vec<ChangeEvent>,
    pub rejected: Vec<RejectedRecord>,
    pub control_skipped: usize,
}

/// Wire envelope: one mutation per newline-delimited JSON record.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<RowImage>,
    #[serde(default)]
    before: Option<RowImage>,
    #[serde(default)]
    key: Option<RowImage>,
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(rename = "record-type")]
    record_type: String,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(rename = "schema-name", default)]
    schema_name: Option<String>,
    #[serde(rename = "table-name", default)]
    table_name: Option<String>,
    #[serde(rename = "transaction-id", default)]
    transaction_id: Option<u64>,
    #[serde(default)]
    sequence: Option<u64>,
}

pub struct RecordDecoder;

impl RecordDecoder {
    /// Parse an opaque transport batch into typed change events. Pure function
    /// of its inputs; `ingested_at` is stamped onto every event so a whole
    /// batch shares one ingest timestamp.
    pub fn decode_batch(
        source_partition: &str,
        raw: &[u8],
        ingested_at: DateTime<Utc>,
    ) -> DecodeOutcome {
        let mut outcome = DecodeOutcome::default();
        let mut offset = 0usize;

        for line in raw.split(|b| *b == b'\n') {
            let line_offset = offset;
            offset += line.len() + 1;

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match Self::decode_record(source_partition, line, line_offset, ingested_at) {
                Ok(Some(event)) => outcome.events.push(event),
                Ok(None) => outcome.control_skipped += 1,
                Err(error) => outcome.rejected.push(RejectedRecord {
                    error,
                    raw: Bytes::copy_from_slice(line),
                }),
            }
        }

        outcome
    }

    /// Returns `Ok(None)` for control/heartbeat records, which are not data
    /// mutations and are skipped without dead-lettering.
    fn decode_record(
        source_partition: &str,
        line: &[u8],
        offset: usize,
        ingested_at: DateTime<Utc>,
    ) -> Result<Option<ChangeEvent>, DecodeError> {
        let reject = |reason: String| DecodeError {
            reason,
            offending_offset: offset,
        };

        let envelope: Envelope = serde_json::from_slice(line)
            .map_err(|e| reject(format!("malformed envelope: {e}")))?;

        if envelope.metadata.record_type != "data" {
            return Ok(None);
        }

        let operation = match envelope.metadata.operation.as_deref() {
            Some("insert") => Operation::Insert,
            Some("update") => Operation::Update,
            Some("delete") => Operation::Delete,
            Some(other) => return Err(reject(format!("unknown operation {other:?}"))),
            None => return Err(reject("missing metadata.operation".to_string())),
        };

        let sequence = envelope
            .metadata
            .sequence
            .ok_or_else(|| reject("missing metadata.sequence".to_string()))?;

        let source_timestamp = envelope
            .metadata
            .timestamp
            .as_ref()
            .and_then(canonical::parse_timestamp)
            .ok_or_else(|| reject("missing or unparseable metadata.timestamp".to_string()))?;

        let data = envelope.data.map(canonical::canonicalize_row);
        let before = envelope.before.map(canonical::canonicalize_row);

        let (before_image, after_image) = match operation {
            Operation::Insert => {
                let after = data
                    .ok_or_else(|| reject("insert record without a row image".to_string()))?;
                (None, Some(after))
            }
            Operation::Update => {
                let after = data
                    .ok_or_else(|| reject("update record without a new row image".to_string()))?;
                (before, Some(after))
            }
            // Some source encoders put the deleted row under `data` instead
            // of `before`; accept either.
            Operation::Delete => {
                let old = before
                    .or(data)
                    .ok_or_else(|| reject("delete record without an old row image".to_string()))?;
                (Some(old), None)
            }
        };

        let key = match envelope.key {
            Some(key) if !key.is_empty() => key,
            _ => Self::key_from_images(&before_image, &after_image)
                .ok_or_else(|| reject("record without a primary key".to_string()))?,
        };

        Ok(Some(ChangeEvent {
            source_partition: source_partition.to_string(),
            sequence,
            operation,
            key,
            before_image,
            after_image,
            schema_name: envelope.metadata.schema_name.unwrap_or_default(),
            table_name: envelope.metadata.table_name.unwrap_or_default(),
            transaction_id: envelope.metadata.transaction_id,
            source_timestamp,
            ingest_timestamp: ingested_at,
        }))
    }

    /// Fallback for envelopes without an explicit key block: an `id` column in
    /// whichever image is present.
    fn key_from_images(
        before: &Option<RowImage>,
        after: &Option<RowImage>,
    ) -> Option<RowImage> {
        let id = after
            .as_ref()
            .and_then(|row| row.get("id"))
            .or_else(|| before.as_ref().and_then(|row| row.get("id")))?;
        Some(RowImage::from([("id".to_string(), id.clone())]))
    }
}
