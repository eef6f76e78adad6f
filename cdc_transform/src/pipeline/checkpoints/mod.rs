pub mod fs;
pub mod memory;
pub mod tracker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Durable record of progress for one source partition. Written only after
/// the sink confirmed every event up to `committed_sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_partition: String,
    pub committed_sequence: u64,
    pub updated_at: DateTime<Utc>,
}

/// Small durable key-value store keyed by source partition. Adapters only
/// store and fetch; monotonicity is enforced by the tracker in front of them.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn persist(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load(&self, source_partition: &str) -> Result<Option<Checkpoint>, CheckpointError>;
}

#[async_trait]
impl<A: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<A> {
    async fn persist(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        (**self).persist(checkpoint).await
    }

    async fn load(&self, source_partition: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        (**self).load(source_partition).await
    }
}
