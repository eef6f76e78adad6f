//! Output encoding: newline-delimited JSON rows, gzip-compressed, one object
//! per batch. The gzip header carries no mtime, so encoding the same events
//! twice yields byte-identical objects and retried writes stay idempotent.

use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::SinkError;
use crate::conversions::change_event::ChangeEvent;

pub const OBJECT_EXT: &str = "ndjson.gz";

pub fn encode_batch(events: &[ChangeEvent]) -> Result<Bytes, SinkError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        serde_json::to_writer(&mut encoder, event)
            .map_err(|e| SinkError::Permanent(format!("unserializable event: {e}")))?;
        encoder
            .write_all(b"\n")
            .map_err(|e| SinkError::Permanent(format!("encoding failed: {e}")))?;
    }
    let compressed = encoder
        .finish()
        .map_err(|e| SinkError::Permanent(format!("compression failed: {e}")))?;
    Ok(Bytes::from(compressed))
}

/// `[<prefix>/]<partition_key>/<batch_id>.ndjson.gz` — deterministic per
/// batch identity.
pub fn object_key(prefix: Option<&str>, partition_key: &str, batch_id: &str) -> String {
    match prefix {
        Some(prefix) => {
            let prefix = prefix.trim_end_matches('/');
            format!("{prefix}/{partition_key}/{batch_id}.{OBJECT_EXT}")
        }
        None => format!("{partition_key}/{batch_id}.{OBJECT_EXT}"),
    }
}

/// Reader-side counterpart of [`encode_batch`]: decompress one output object
/// back into its rows.
pub fn decode_rows(body: &[u8]) -> std::io::Result<Vec<serde_json::Value>> {
    use std::io::Read;

    let mut decoder = flate2::read::GzDecoder::new(body);
    let mut text = String::new();
    decoder.read_to_string(&mut text)?;
    text.lines()
        .map(|line| serde_json::from_str(line).map_err(std::io::Error::from))
        .collect()
}
