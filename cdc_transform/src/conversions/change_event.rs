use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The mutation kind captured at the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// A full-row snapshot, column name to canonical value. `BTreeMap` keeps the
/// column order deterministic so serialized rows and batch hashes are stable.
pub type RowImage = BTreeMap<String, Value>;

/// One captured mutation. Built by the decoder, read-only afterwards.
///
/// `(source_partition, sequence)` uniquely identifies an event; the
/// normalizer deduplicates on that pair.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub source_partition: String,
    pub sequence: u64,
    #[serde(rename = "op")]
    pub operation: Operation,
    pub key: RowImage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_image: Option<RowImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_image: Option<RowImage>,
    pub schema_name: String,
    pub table_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<u64>,
    pub source_timestamp: DateTime<Utc>,
    pub ingest_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// The output partition this event belongs to, derived from its logical
    /// ingest date.
    pub fn partition_key(&self) -> String {
        format!("ingest_date={}", self.ingest_timestamp.format("%Y-%m-%d"))
    }

    /// Serialized size of the output row, used for batch byte accounting.
    pub fn encoded_len(&self) -> usize {
        // +1 for the newline separating rows in the output object
        serde_json::to_vec(self).map(|v| v.len() + 1).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event_at(ingest: DateTime<Utc>) -> ChangeEvent {
        ChangeEvent {
            source_partition: "shard-0".to_string(),
            sequence: 1,
            operation: Operation::Insert,
            key: RowImage::from([("id".to_string(), 7.into())]),
            before_image: None,
            after_image: Some(RowImage::from([("city".to_string(), "Oslo".into())])),
            schema_name: "hr".to_string(),
            table_name: "employees".to_string(),
            transaction_id: Some(42),
            source_timestamp: ingest,
            ingest_timestamp: ingest,
        }
    }

    #[test]
    fn partition_key_is_ingest_date() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 7, 23, 59, 59).unwrap();
        assert_eq!(event_at(ts).partition_key(), "ingest_date=2026-02-07");
    }

    #[test]
    fn absent_images_are_omitted_from_output_rows() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 7, 0, 0, 0).unwrap();
        let row = serde_json::to_value(event_at(ts)).unwrap();
        assert!(row.get("before_image").is_none());
        assert_eq!(row["op"], "insert");
        assert_eq!(row["after_image"]["city"], "Oslo");
    }
}
