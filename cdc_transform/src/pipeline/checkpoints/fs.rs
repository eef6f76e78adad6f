use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{Checkpoint, CheckpointError, CheckpointStore};

/// Checkpoint store backed by one JSON file per source partition. Files are
/// written to a temp path and renamed, so a crash mid-write leaves the
/// previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    root: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, source_partition: &str) -> PathBuf {
        // Partition ids may contain path separators; flatten them.
        let name = source_partition.replace(['/', '\\'], "_");
        self.root.join(format!("{name}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn persist(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let path = self.path_for(&checkpoint.source_partition);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint)?;

        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            partition = %checkpoint.source_partition,
            sequence = checkpoint.committed_sequence,
            "stored checkpoint"
        );
        Ok(())
    }

    async fn load(&self, source_partition: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(source_partition);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }
}
