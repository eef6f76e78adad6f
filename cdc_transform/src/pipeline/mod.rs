use thiserror::Error;

use crate::config::ConfigError;

pub mod batching;
pub mod checkpoints;
pub mod data_pipeline;
pub mod dead_letter;
pub mod decoder;
pub mod metrics;
pub mod normalizer;
pub mod sinks;
pub mod sources;
mod worker;

use sources::TransportError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("transport exposes no partitions")]
    NoPartitions,
}
