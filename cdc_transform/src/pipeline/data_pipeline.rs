use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::PipelineConfig;

use super::checkpoints::{tracker::CheckpointHandle, CheckpointStore};
use super::dead_letter::DeadLetterSink;
use super::metrics::PipelineMetrics;
use super::sinks::{RetryPolicy, SinkWriter};
use super::sources::Transport;
use super::worker::PartitionWorker;
use super::PipelineError;

/// Wires transport, sink, dead-letter and checkpoint store into a running
/// pipeline: one worker task per transport partition, supervised until
/// shutdown. Partitions are independent, so cross-partition parallelism is
/// unrestricted; all sequencing lives inside each worker.
pub struct DataPipeline<T, S, D> {
    transport: Arc<T>,
    sink: Arc<S>,
    dead_letter: Arc<D>,
    checkpoints: CheckpointHandle,
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
    task_tracker: TaskTracker,
}

impl<T, S, D> DataPipeline<T, S, D>
where
    T: Transport + 'static,
    S: SinkWriter + 'static,
    D: DeadLetterSink + 'static,
{
    pub fn new<A: CheckpointStore + 'static>(
        transport: T,
        sink: S,
        dead_letter: D,
        checkpoint_store: A,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let retry = RetryPolicy {
            max_attempts: config.max_retry_attempts,
            base_delay: config.retry_backoff_base(),
        };
        let checkpoints = CheckpointHandle::new(checkpoint_store, retry);

        Ok(DataPipeline {
            transport: Arc::new(transport),
            sink: Arc::new(sink),
            dead_letter: Arc::new(dead_letter),
            checkpoints,
            config,
            metrics: PipelineMetrics::shared(),
            cancel: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        })
    }

    /// Cancelling this token (or calling [`shutdown`](Self::shutdown))
    /// triggers the controlled stop: workers force-flush, commit within the
    /// grace period and exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn checkpoints(&self) -> CheckpointHandle {
        self.checkpoints.clone()
    }

    /// Run until shutdown. Spawns every partition worker, waits for all of
    /// them, then stops the checkpoint tracker.
    pub async fn run(&mut self) -> Result<(), PipelineError> {
        let partitions = self.transport.partitions();
        if partitions.is_empty() {
            return Err(PipelineError::NoPartitions);
        }

        info!(?partitions, "starting pipeline");

        for partition in partitions {
            let worker = PartitionWorker::new(
                partition,
                self.transport.clone(),
                self.sink.clone(),
                self.dead_letter.clone(),
                self.checkpoints.clone(),
                self.config.clone(),
                self.metrics.clone(),
                self.cancel.clone(),
            );
            self.task_tracker.spawn(worker.run());
        }

        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("stopped partition workers");

        self.checkpoints.shutdown().await;

        info!(snapshot = ?self.metrics.snapshot(), "pipeline stopped");

        Ok(())
    }
}
