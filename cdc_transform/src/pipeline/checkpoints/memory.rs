use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use super::{Checkpoint, CheckpointError, CheckpointStore};

/// In-memory checkpoint store for tests and demos, with failure injection for
/// the warn-and-continue path.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    fail_next: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` persists.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn committed(&self, source_partition: &str) -> Option<u64> {
        self.checkpoints
            .lock()
            .unwrap()
            .get(source_partition)
            .map(|c| c.committed_sequence)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn persist(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CheckpointError::Unavailable("injected failure".to_string()));
        }

        info!(
            partition = %checkpoint.source_partition,
            sequence = checkpoint.committed_sequence,
            "stored checkpoint"
        );
        self.checkpoints
            .lock()
            .unwrap()
            .insert(checkpoint.source_partition.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, source_partition: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.lock().unwrap().get(source_partition).cloned())
    }
}
