pub mod windowed;

use std::fmt::Write;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::conversions::change_event::ChangeEvent;

/// Closure thresholds for open batches. A batch closes when its age reaches
/// `max_window` or its size reaches either limit, whichever comes first.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_window: chrono::Duration,
    pub max_size_bytes: usize,
    pub max_event_count: usize,
}

impl BatchConfig {
    pub fn new(
        max_window: chrono::Duration,
        max_size_bytes: usize,
        max_event_count: usize,
    ) -> Self {
        Self {
            max_window,
            max_size_bytes,
            max_event_count,
        }
    }
}

/// A closed, immutable group of events destined for one sink write.
///
/// `batch_id` is a deterministic hash of the contained event identities, so a
/// batch rebuilt from redelivered events maps to the same sink key and a
/// retried write is an overwrite, not a duplicate.
#[derive(Debug)]
pub struct Batch {
    pub batch_id: String,
    pub partition_key: String,
    pub events: Vec<ChangeEvent>,
    pub open_since: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl Batch {
    pub(crate) fn close(
        partition_key: String,
        events: Vec<ChangeEvent>,
        open_since: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    ) -> Self {
        let batch_id = Self::compute_id(&partition_key, &events);
        Self {
            batch_id,
            partition_key,
            events,
            open_since,
            closed_at,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Highest source sequence contained in this batch; the checkpoint
    /// candidate once the batch is durably committed.
    pub fn max_sequence(&self) -> Option<u64> {
        self.events.iter().map(|e| e.sequence).max()
    }

    /// Lowest source sequence contained in this batch. While the batch is
    /// still awaiting its commit, no checkpoint may reach this value.
    pub fn min_sequence(&self) -> Option<u64> {
        self.events.iter().map(|e| e.sequence).min()
    }

    fn compute_id(partition_key: &str, events: &[ChangeEvent]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(partition_key.as_bytes());
        for event in events {
            hasher.update(event.source_partition.as_bytes());
            hasher.update(event.sequence.to_be_bytes());
        }
        let digest = hasher.finalize();
        digest.iter().take(16).fold(String::new(), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
    }
}
