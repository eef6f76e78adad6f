//! Change-data-capture streaming transform pipeline.
//!
//! Pulls framed mutation records from a partitioned transport, decodes and
//! canonicalizes them, groups them into time- or size-bounded batches and
//! writes each batch as one compressed object under a date partition, with
//! per-partition checkpoints for resumable at-least-once processing.
//!
//! Delivery model: at-least-once with idempotent commits. Redelivered events
//! are dropped by a bounded dedup window; anything that slips past it is
//! re-committed to the same deterministic object key, so downstream readers
//! never see duplicates.

pub mod config;
pub mod conversions;
pub mod pipeline;

pub use config::{ConfigError, PipelineConfig, StartPosition};
pub use conversions::change_event::{ChangeEvent, Operation};
pub use pipeline::{data_pipeline::DataPipeline, PipelineError};
