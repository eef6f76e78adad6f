use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Startup configuration problems. Fatal: no partition worker starts when
/// validation fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where a partition starts when no checkpoint exists for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    #[default]
    Earliest,
    Latest,
}

/// Pipeline tuning knobs. All fields have defaults so a partial (or absent)
/// config file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Maximum age of an open batch before it is force-closed.
    pub max_batch_window_seconds: u64,
    /// Close a batch once its serialized size reaches this many bytes.
    pub max_batch_size_bytes: usize,
    /// Close a batch once it holds this many events.
    pub max_batch_event_count: usize,
    /// Per-partition dedup window, sized to cover the transport's worst-case
    /// redelivery window.
    pub dedup_window_size: usize,
    /// Retry attempts for transient sink and checkpoint failures.
    pub max_retry_attempts: usize,
    /// Base delay for exponential retry backoff.
    pub retry_backoff_base_ms: u64,
    /// How long a shutting-down worker may spend committing its final flush.
    pub shutdown_grace_period_ms: u64,
    /// Transport poll timeout.
    pub poll_timeout_ms: u64,
    /// Granularity of the age-based flush check.
    pub flush_tick_ms: u64,
    /// Resume position for partitions with no checkpoint.
    pub start_position: StartPosition,
    /// Optional key prefix prepended to every sink object.
    pub sink_prefix: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_window_seconds: 60,
            max_batch_size_bytes: 4 * 1024 * 1024,
            max_batch_event_count: 500,
            dedup_window_size: 4096,
            max_retry_attempts: 5,
            retry_backoff_base_ms: 200,
            shutdown_grace_period_ms: 5_000,
            poll_timeout_ms: 1_000,
            flush_tick_ms: 250,
            start_position: StartPosition::Earliest,
            sink_prefix: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn nonzero(value: usize, name: &str) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
            Ok(())
        }

        nonzero(self.max_batch_window_seconds as usize, "max_batch_window_seconds")?;
        nonzero(self.max_batch_size_bytes, "max_batch_size_bytes")?;
        nonzero(self.max_batch_event_count, "max_batch_event_count")?;
        nonzero(self.dedup_window_size, "dedup_window_size")?;
        nonzero(self.retry_backoff_base_ms as usize, "retry_backoff_base_ms")?;
        nonzero(self.poll_timeout_ms as usize, "poll_timeout_ms")?;
        nonzero(self.flush_tick_ms as usize, "flush_tick_ms")?;

        if let Some(prefix) = &self.sink_prefix {
            if prefix.starts_with('/') {
                return Err(ConfigError::Invalid(
                    "sink_prefix must be a relative key prefix".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn max_batch_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_batch_window_seconds as i64)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn flush_tick(&self) -> Duration {
        Duration::from_millis(self.flush_tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_window_is_rejected() {
        let config = PipelineConfig {
            max_batch_window_seconds: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn absolute_sink_prefix_is_rejected() {
        let config = PipelineConfig {
            sink_prefix: Some("/data/trusted".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_batch_event_count: 3\nstart_position: latest").unwrap();

        let config = PipelineConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.max_batch_event_count, 3);
        assert_eq!(config.start_position, StartPosition::Latest);
        assert_eq!(config.max_batch_window_seconds, 60);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_bach_event_count: 3").unwrap();
        assert!(matches!(
            PipelineConfig::from_yaml_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
