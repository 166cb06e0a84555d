//! Configuration parsing and validation.
//!
//! Handles loading configuration from YAML files with environment variable
//! interpolation, and enforces the structural invariants the pipeline cannot
//! recover from at runtime (most importantly the source/destination prefix
//! separation that prevents transformation feedback loops).

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyDestinationPrefixSnafu, EmptyMetadataPathSnafu, EmptySourcePrefixSnafu,
    EmptyStoragePathSnafu, EnvInterpolationSnafu, InvocationOutlivesVisibilitySnafu,
    PrefixOverlapSnafu, ReadFileSnafu, YamlParseSnafu, ZeroBatchSizeSnafu,
    ZeroMaxReceiveCountSnafu, ZeroTargetWidthSnafu, ZeroVisibilityTimeoutSnafu,
};

/// Main configuration structure for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bucket holding both source uploads and transformed outputs.
    pub storage: StorageConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    pub metadata: MetadataConfig,
    /// Metrics configuration (optional, enabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Alarm configuration (optional).
    #[serde(default)]
    pub alerting: AlertingConfig,
}

/// Storage location for source and destination objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket URL. Examples: "s3://media-bucket", "/var/lib/darkroom/media"
    pub path: String,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Output resize width in pixels.
    pub target_width_px: u32,

    /// Prefix under which qualifying source objects live (e.g. "uploads/").
    pub source_prefix: String,

    /// Prefix under which transformed outputs are written (e.g. "processed/").
    /// Must never overlap the source prefix.
    pub destination_prefix: String,

    /// Maximum jobs received per invocation (default: 10).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum concurrent batch invocations (default: 4). Receive attempts
    /// beyond this bound are throttled, not queued in-process.
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    /// Hard per-invocation timeout in seconds (default: 30). An invocation
    /// that exceeds it is abandoned; visibility-timeout redelivery is the
    /// sole recovery mechanism.
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,

    /// Interval in seconds between polls of the source prefix for new
    /// objects (default: 10).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_batch_size() -> usize {
    10
}

fn default_max_concurrent_batches() -> usize {
    4
}

fn default_invocation_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl WorkerConfig {
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Durable queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Period during which a received-but-unacknowledged job stays hidden
    /// (default: 60). Must exceed the worst-case invocation time with margin,
    /// otherwise a slow-but-successful job is redelivered and
    /// double-processed before it can be acknowledged.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Receive attempts before a job is redriven into the DLQ (default: 5).
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    /// Optional storage path for persisted DLQ records (NDJSON).
    #[serde(default)]
    pub dlq_path: Option<String>,

    /// Storage options for DLQ persistence (credentials, region, etc.)
    #[serde(default)]
    pub dlq_storage_options: HashMap<String, String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receive_count: default_max_receive_count(),
            dlq_path: None,
            dlq_storage_options: HashMap::new(),
        }
    }
}

fn default_visibility_timeout_secs() -> u64 {
    60
}

fn default_max_receive_count() -> u32 {
    5
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

/// Metadata table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Path to the metadata table.
    /// Examples: "s3://media-bucket/metadata", "/var/lib/darkroom/metadata"
    pub path: String,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Configuration for a single threshold alarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    /// Whether the alarm is evaluated at all (default: true).
    #[serde(default = "default_alarm_enabled")]
    pub enabled: bool,
    /// Firing threshold. Counts for error/throttle alarms, seconds for the
    /// duration alarm, entries for the DLQ alarm.
    pub threshold: f64,
    /// Length of one evaluation period in seconds (default: 60).
    #[serde(default = "default_evaluation_period_secs")]
    pub evaluation_period_secs: u64,
    /// Consecutive breaching periods before the alarm fires (default: 1).
    #[serde(default = "default_evaluation_periods")]
    pub evaluation_periods: u32,
    /// Opaque notification channel reference (topic ARN, URL, ...).
    #[serde(default)]
    pub channel: String,
}

fn default_alarm_enabled() -> bool {
    true
}

fn default_evaluation_period_secs() -> u64 {
    60
}

fn default_evaluation_periods() -> u32 {
    1
}

impl AlarmConfig {
    pub fn evaluation_period(&self) -> Duration {
        Duration::from_secs(self.evaluation_period_secs)
    }

    fn with_threshold(threshold: f64) -> Self {
        Self {
            enabled: true,
            threshold,
            evaluation_period_secs: default_evaluation_period_secs(),
            evaluation_periods: default_evaluation_periods(),
            channel: String::new(),
        }
    }
}

/// Alarm configuration, one entry per alarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// Failed invocations over the rolling window.
    #[serde(default = "default_errors_alarm")]
    pub errors: AlarmConfig,
    /// Throttled receive attempts over the rolling window.
    #[serde(default = "default_throttles_alarm")]
    pub throttles: AlarmConfig,
    /// 95th-percentile invocation duration, in seconds.
    #[serde(default = "default_duration_alarm")]
    pub duration_p95: AlarmConfig,
    /// DLQ depth. Any entry represents a job that exhausted all automatic
    /// retries, so the default threshold is 1.
    #[serde(default = "default_dlq_alarm")]
    pub dlq: AlarmConfig,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            errors: default_errors_alarm(),
            throttles: default_throttles_alarm(),
            duration_p95: default_duration_alarm(),
            dlq: default_dlq_alarm(),
        }
    }
}

fn default_errors_alarm() -> AlarmConfig {
    AlarmConfig::with_threshold(5.0)
}

fn default_throttles_alarm() -> AlarmConfig {
    AlarmConfig::with_threshold(10.0)
}

fn default_duration_alarm() -> AlarmConfig {
    AlarmConfig::with_threshold(30.0)
}

fn default_dlq_alarm() -> AlarmConfig {
    AlarmConfig::with_threshold(1.0)
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_options(path, true)
    }

    /// Load configuration from a YAML file with optional environment variable interpolation.
    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;

        let content = if interpolate_env {
            match vars::interpolate(&content) {
                Ok(text) => text,
                Err(errors) => {
                    return EnvInterpolationSnafu {
                        message: errors.join("\n"),
                    }
                    .fail();
                }
            }
        } else {
            content
        };

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// The prefix-overlap check is the one class of error the pipeline treats
    /// as fatal at configuration time rather than recoverable at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.storage.path.is_empty(), EmptyStoragePathSnafu);
        ensure!(!self.metadata.path.is_empty(), EmptyMetadataPathSnafu);
        ensure!(
            !self.worker.source_prefix.is_empty(),
            EmptySourcePrefixSnafu
        );
        ensure!(
            !self.worker.destination_prefix.is_empty(),
            EmptyDestinationPrefixSnafu
        );
        ensure!(self.worker.target_width_px >= 1, ZeroTargetWidthSnafu);
        ensure!(self.worker.batch_size >= 1, ZeroBatchSizeSnafu);
        ensure!(
            self.queue.visibility_timeout_secs >= 1,
            ZeroVisibilityTimeoutSnafu
        );
        ensure!(self.queue.max_receive_count >= 1, ZeroMaxReceiveCountSnafu);
        ensure!(
            self.worker.invocation_timeout_secs < self.queue.visibility_timeout_secs,
            InvocationOutlivesVisibilitySnafu {
                invocation_timeout_secs: self.worker.invocation_timeout_secs,
                visibility_timeout_secs: self.queue.visibility_timeout_secs,
            }
        );

        let source = normalize_prefix(&self.worker.source_prefix);
        let destination = normalize_prefix(&self.worker.destination_prefix);
        ensure!(
            !source.starts_with(&destination) && !destination.starts_with(&source),
            PrefixOverlapSnafu {
                source_prefix: self.worker.source_prefix.clone(),
                destination_prefix: self.worker.destination_prefix.clone(),
            }
        );

        Ok(())
    }

    /// Source prefix with a guaranteed trailing slash.
    pub fn source_prefix(&self) -> String {
        normalize_prefix(&self.worker.source_prefix)
    }

    /// Destination prefix with a guaranteed trailing slash.
    pub fn destination_prefix(&self) -> String {
        normalize_prefix(&self.worker.destination_prefix)
    }
}

/// Normalize a key prefix to always end with a slash, so "uploads" and
/// "uploads/" behave identically and "uploads-old/x" never matches "uploads/".
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    format!("{trimmed}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml() -> &'static str {
        r#"
storage:
  path: "s3://media-bucket"

worker:
  target_width_px: 1024
  source_prefix: "uploads/"
  destination_prefix: "processed/"

metadata:
  path: "s3://media-bucket/metadata"
"#
    }

    #[test]
    fn test_config_yaml_parsing() {
        let config: Config = serde_yaml::from_str(base_yaml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.storage.path, "s3://media-bucket");
        assert_eq!(config.worker.target_width_px, 1024);
        assert_eq!(config.worker.source_prefix, "uploads/");
        // Defaults
        assert_eq!(config.worker.batch_size, 10);
        assert_eq!(config.queue.visibility_timeout_secs, 60);
        assert_eq!(config.queue.max_receive_count, 5);
        assert!(config.metrics.enabled);
        assert_eq!(config.alerting.dlq.threshold, 1.0);
    }

    #[test]
    fn test_prefix_overlap_rejected() {
        let yaml = r#"
storage:
  path: "s3://media-bucket"

worker:
  target_width_px: 1024
  source_prefix: "media/"
  destination_prefix: "media/processed/"

metadata:
  path: "s3://media-bucket/metadata"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::PrefixOverlap { .. }));
    }

    #[test]
    fn test_identical_prefixes_rejected() {
        let yaml = r#"
storage:
  path: "/tmp/media"

worker:
  target_width_px: 512
  source_prefix: "uploads"
  destination_prefix: "uploads/"

metadata:
  path: "/tmp/metadata"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::PrefixOverlap { .. }
        ));
    }

    #[test]
    fn test_sibling_prefixes_allowed() {
        // "uploads-raw/" shares a string prefix with "uploads/" but is a
        // distinct key namespace.
        let yaml = r#"
storage:
  path: "/tmp/media"

worker:
  target_width_px: 512
  source_prefix: "uploads"
  destination_prefix: "uploads-resized"

metadata:
  path: "/tmp/metadata"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_invocation_timeout_must_fit_visibility() {
        let yaml = r#"
storage:
  path: "/tmp/media"

worker:
  target_width_px: 512
  source_prefix: "uploads/"
  destination_prefix: "processed/"
  invocation_timeout_secs: 120

queue:
  visibility_timeout_secs: 60

metadata:
  path: "/tmp/metadata"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvocationOutlivesVisibility { .. }
        ));
    }

    #[test]
    fn test_zero_target_width_rejected() {
        let yaml = r#"
storage:
  path: "/tmp/media"

worker:
  target_width_px: 0
  source_prefix: "uploads/"
  destination_prefix: "processed/"

metadata:
  path: "/tmp/metadata"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::ZeroTargetWidth
        ));
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("uploads"), "uploads/");
        assert_eq!(normalize_prefix("uploads/"), "uploads/");
        assert_eq!(normalize_prefix("uploads//"), "uploads/");
    }

    #[test]
    fn test_alarm_config_defaults() {
        let config: Config = serde_yaml::from_str(base_yaml()).unwrap();
        assert!(config.alerting.errors.enabled);
        assert_eq!(config.alerting.errors.evaluation_periods, 1);
        assert_eq!(config.alerting.duration_p95.threshold, 30.0);
    }

    #[test]
    fn test_alarm_overrides() {
        let yaml = r#"
storage:
  path: "/tmp/media"

worker:
  target_width_px: 512
  source_prefix: "uploads/"
  destination_prefix: "processed/"

metadata:
  path: "/tmp/metadata"

alerting:
  errors:
    enabled: false
    threshold: 20
    evaluation_period_secs: 300
    evaluation_periods: 2
    channel: "arn:aws:sns:us-east-1:123456789012:media-alerts"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.alerting.errors.enabled);
        assert_eq!(config.alerting.errors.threshold, 20.0);
        assert_eq!(config.alerting.errors.evaluation_periods, 2);
        // Untouched alarms keep defaults
        assert!(config.alerting.dlq.enabled);
    }
}
