//! Canonical value encoding for row images.
//!
//! Source encoders disagree on how they represent the same value: epoch
//! seconds vs ISO strings for timestamps, `7.0` vs `7` for integers, empty
//! strings vs absent columns for missing data. Everything downstream of the
//! decoder sees one encoding so batches are stable across heterogeneous
//! sources.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

use super::change_event::RowImage;

/// Column names treated as timestamps when canonicalizing row images.
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "created_at", "updated_at", "datetime", "date"];

/// Canonicalize a decoded row image in place: drop null and empty-string
/// columns, collapse integral floats to integers and rewrite well-known
/// timestamp columns to RFC 3339 UTC.
pub fn canonicalize_row(row: RowImage) -> RowImage {
    row.into_iter()
        .filter_map(|(name, value)| {
            canonicalize_value(&name, value).map(|value| (name, value))
        })
        .collect()
}

fn canonicalize_value(name: &str, value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        value if TIMESTAMP_FIELDS.contains(&name) => Some(canonicalize_timestamp(value)),
        Value::Number(n) => Some(canonical_number(n)),
        value => Some(value),
    }
}

fn canonical_number(n: serde_json::Number) -> Value {
    if let Some(f) = n.as_f64() {
        if n.as_i64().is_none() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
            return Value::Number((f as i64).into());
        }
    }
    Value::Number(n)
}

fn canonicalize_timestamp(value: Value) -> Value {
    match parse_timestamp(&value) {
        Some(ts) => Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        None => value,
    }
}

/// Best-effort parse of the timestamp encodings the source is known to emit:
/// RFC 3339, naive ISO 8601 (assumed UTC) and unix epoch seconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            // Naive ISO without a zone offset is assumed UTC.
            for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(naive.and_utc());
                }
            }
            None
        }
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                return DateTime::from_timestamp(secs, 0);
            }
            n.as_f64().and_then(|f| {
                DateTime::from_timestamp(f.trunc() as i64, (f.fract() * 1e9) as u32)
            })
        }
        _ => None,
    }
}
