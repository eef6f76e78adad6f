use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Checkpoint, CheckpointError, CheckpointStore};
use crate::pipeline::sinks::RetryPolicy;

pub enum TrackerMessage {
    Advance {
        partition: String,
        sequence: u64,
    },
    Committed {
        partition: String,
        respond_to: oneshot::Sender<Option<u64>>,
    },
}

/// Actor owning the committed positions for all source partitions. Keeps the
/// monotonicity invariant in one place: `Advance` merges with fetch-max, so a
/// stale advance can never move a checkpoint backwards.
struct CheckpointTracker<A: CheckpointStore> {
    rx: mpsc::Receiver<TrackerMessage>,
    positions: HashMap<String, u64>,
    adapter: A,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<A: CheckpointStore + 'static> CheckpointTracker<A> {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                Some(msg) = self.rx.recv() => {
                    self.handle_message(msg).await;
                },
                _ = self.cancel.cancelled() => {
                    // Drain advances already reported before shutting down.
                    self.rx.close();
                    while let Some(msg) = self.rx.recv().await {
                        self.handle_message(msg).await;
                    }
                    break;
                },
                else => break,
            }
        }
    }

    async fn handle_message(&mut self, msg: TrackerMessage) {
        match msg {
            TrackerMessage::Advance {
                partition,
                sequence,
            } => {
                let position = self.position(&partition).await;
                if position.is_some_and(|current| sequence <= current) {
                    return;
                }
                self.positions.insert(partition.clone(), sequence);
                self.persist(&partition, sequence).await;
            }
            TrackerMessage::Committed {
                partition,
                respond_to,
            } => {
                let position = self.position(&partition).await;
                let _ = respond_to.send(position);
            }
        }
    }

    /// Cached committed position, falling back to the adapter on the first
    /// ask for a partition.
    async fn position(&mut self, partition: &str) -> Option<u64> {
        if let Some(position) = self.positions.get(partition) {
            return Some(*position);
        }
        match self.adapter.load(partition).await {
            Ok(Some(checkpoint)) => {
                self.positions
                    .insert(partition.to_string(), checkpoint.committed_sequence);
                Some(checkpoint.committed_sequence)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(partition, "unable to load checkpoint: {e}");
                None
            }
        }
    }

    /// Persist with bounded retry. A persistently failing persist is logged
    /// and swallowed: the sink write already succeeded and is the source of
    /// truth, so the cost is at most one reprocessing window on restart.
    async fn persist(&self, partition: &str, sequence: u64) {
        let checkpoint = Checkpoint {
            source_partition: partition.to_string(),
            committed_sequence: sequence,
            updated_at: chrono::Utc::now(),
        };

        let persist = || async { self.adapter.persist(&checkpoint).await };
        let result = persist
            .retry(self.retry.backoff())
            .notify(|err: &CheckpointError, after: Duration| {
                warn!(partition, sequence, ?after, "checkpoint persist failed, retrying: {err}");
            })
            .await;

        if let Err(e) = result {
            warn!(
                partition,
                sequence,
                "checkpoint persist failed after retries, batch remains committed in sink: {e}"
            );
        }
    }
}

/// Cheap handle to the tracker actor, shared by all partition workers.
#[derive(Debug, Clone)]
pub struct CheckpointHandle {
    sender: mpsc::Sender<TrackerMessage>,
    cancel: CancellationToken,
    done: Arc<tokio::sync::Notify>,
}

impl CheckpointHandle {
    pub fn new<A: CheckpointStore + 'static>(adapter: A, retry: RetryPolicy) -> Self {
        let (sender, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let done = Arc::new(tokio::sync::Notify::new());

        let mut tracker = CheckpointTracker {
            rx,
            positions: HashMap::new(),
            adapter,
            retry,
            cancel: cancel.clone(),
        };

        let done_clone = done.clone();
        tokio::spawn(async move {
            tracker.run().await;
            done_clone.notify_one();
        });

        Self {
            sender,
            cancel,
            done,
        }
    }

    /// Report that every event up to `sequence` in `partition` is durably
    /// written. Must only be called after the sink confirmed the commit.
    pub async fn advance(&self, partition: &str, sequence: u64) {
        let msg = TrackerMessage::Advance {
            partition: partition.to_string(),
            sequence,
        };
        let _ = self.sender.send(msg).await;
    }

    /// Last committed sequence for `partition`, or `None` when it has never
    /// committed.
    pub async fn committed(&self, partition: &str) -> Option<u64> {
        let (send, recv) = oneshot::channel();
        let msg = TrackerMessage::Committed {
            partition: partition.to_string(),
            respond_to: send,
        };

        let _ = self.sender.send(msg).await;
        recv.await.expect("checkpoint tracker task has been killed")
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.done.notified().await;
    }
}
