use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{SinkError, SinkWriter};

/// Local-filesystem object sink: one file per object under a root directory,
/// keys mapped to relative paths. Writes go to a temp file first and are
/// renamed into place, so a reader never observes a partial object and a
/// retried put atomically replaces the previous one.
#[derive(Debug, Clone)]
pub struct FsSink {
    root: PathBuf,
}

impl FsSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn classify(err: std::io::Error) -> SinkError {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::PermissionDenied => SinkError::Permanent(err.to_string()),
        _ => SinkError::Transient(err.to_string()),
    }
}

#[async_trait]
impl SinkWriter for FsSink {
    async fn put(&self, key: &str, body: Bytes) -> Result<(), SinkError> {
        let path = self.root.join(key);
        let parent = path
            .parent()
            .ok_or_else(|| SinkError::Permanent(format!("key {key:?} has no parent")))?;

        tokio::fs::create_dir_all(parent).await.map_err(classify)?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &body).await.map_err(classify)?;
        tokio::fs::rename(&tmp, &path).await.map_err(classify)?;

        debug!(key, bytes = body.len(), "stored object");
        Ok(())
    }
}
