pub mod fs;
pub mod memory;
pub mod ndjson;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use super::batching::Batch;
use super::metrics::{incr, PipelineMetrics};

/// Sink failures, classified for the retry discipline: `Transient` is retried
/// with exponential backoff, `Permanent` is dead-lettered and never retried.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("transient sink failure: {0}")]
    Transient(String),

    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

#[derive(Debug)]
pub struct WriteResult {
    pub location: String,
    pub byte_size: usize,
}

/// Durable object destination. One `put` is one atomic object; a retried put
/// with the same key and body must be an idempotent overwrite.
#[async_trait]
pub trait SinkWriter: Send + Sync {
    async fn put(&self, key: &str, body: Bytes) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: SinkWriter + ?Sized> SinkWriter for Arc<S> {
    async fn put(&self, key: &str, body: Bytes) -> Result<(), SinkError> {
        (**self).put(key, body).await
    }
}

/// Bounded-retry policy for transient sink and checkpoint failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub(crate) fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_times(self.max_attempts)
    }
}

/// Serialize, compress and durably write one closed batch.
///
/// The object key is a pure function of the batch identity, so retrying after
/// a transient failure overwrites the same object instead of duplicating it.
/// Exhausted retries escalate to `Permanent`; the caller dead-letters those.
pub async fn commit_batch(
    sink: &dyn SinkWriter,
    batch: &Batch,
    prefix: Option<&str>,
    retry: &RetryPolicy,
    metrics: &Arc<PipelineMetrics>,
) -> Result<WriteResult, SinkError> {
    let body = ndjson::encode_batch(&batch.events)?;
    let key = ndjson::object_key(prefix, &batch.partition_key, &batch.batch_id);
    let byte_size = body.len();

    let put = || {
        let body = body.clone();
        let key = key.as_str();
        async move { sink.put(key, body).await }
    };

    put.retry(retry.backoff())
        .when(SinkError::is_transient)
        .notify(|err: &SinkError, after: Duration| {
            incr(&metrics.sink_retries);
            warn!(key = %key, ?after, "sink write failed, retrying: {err}");
        })
        .await
        .map_err(|err| match err {
            SinkError::Transient(detail) => {
                SinkError::Permanent(format!("retries exhausted: {detail}"))
            }
            permanent => permanent,
        })?;

    Ok(WriteResult {
        location: key,
        byte_size,
    })
}
