//! Error types for the darkroom media pipeline.

use snafu::prelude::*;

use crate::metrics::events::FailureStage;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Storage path is empty.
    #[snafu(display("Storage path cannot be empty"))]
    EmptyStoragePath,

    /// Metadata table path is empty.
    #[snafu(display("Metadata table path cannot be empty"))]
    EmptyMetadataPath,

    /// Source prefix is empty.
    #[snafu(display("Source prefix cannot be empty"))]
    EmptySourcePrefix,

    /// Destination prefix is empty.
    #[snafu(display("Destination prefix cannot be empty"))]
    EmptyDestinationPrefix,

    /// The destination prefix overlaps the source prefix. Writing an output
    /// would then enqueue a new job for the same pipeline, looping forever.
    #[snafu(display(
        "Destination prefix '{destination_prefix}' overlaps source prefix '{source_prefix}'"
    ))]
    PrefixOverlap {
        source_prefix: String,
        destination_prefix: String,
    },

    /// Target width must be positive.
    #[snafu(display("worker.target_width_px must be at least 1"))]
    ZeroTargetWidth,

    /// Batch size must be positive.
    #[snafu(display("worker.batch_size must be at least 1"))]
    ZeroBatchSize,

    /// Visibility timeout must be positive.
    #[snafu(display("queue.visibility_timeout_secs must be at least 1"))]
    ZeroVisibilityTimeout,

    /// Max receive count must be positive.
    #[snafu(display("queue.max_receive_count must be at least 1"))]
    ZeroMaxReceiveCount,

    /// A slow-but-successful invocation would be redelivered mid-flight.
    #[snafu(display(
        "worker.invocation_timeout_secs ({invocation_timeout_secs}) must be below \
         queue.visibility_timeout_secs ({visibility_timeout_secs})"
    ))]
    InvocationOutlivesVisibility {
        invocation_timeout_secs: u64,
        visibility_timeout_secs: u64,
    },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Queue Errors ============

/// Errors that can occur during queue and DLQ operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix is intentional to avoid snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum QueueError {
    /// Failed to write a dead-letter record.
    #[snafu(display("Failed to write DLQ record"))]
    DlqWrite { source: StorageError },

    /// Failed to serialize a dead-letter record.
    #[snafu(display("Failed to serialize DLQ record"))]
    DlqSerialize { source: serde_json::Error },

    /// Failed to create DLQ storage provider.
    #[snafu(display("Failed to create DLQ storage"))]
    DlqStorage { source: StorageError },
}

// ============ Event Errors ============

/// Errors that can occur while adapting upstream object-created events.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EventError {
    /// Notification body is not valid event JSON.
    #[snafu(display("Failed to parse object-created notification"))]
    NotificationParse { source: serde_json::Error },

    /// Object key could not be URL-decoded.
    #[snafu(display("Failed to decode object key '{key}': {message}"))]
    KeyDecode { key: String, message: String },

    /// Listing the source prefix failed.
    #[snafu(display("Failed to list source prefix: {source}"))]
    SourceList { source: StorageError },
}

// ============ Transform Errors ============

/// Errors that can occur during image transformation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    /// Input bytes are not a recognized image format.
    #[snafu(display("Unrecognized image format: {source}"))]
    UnknownFormat { source: image::ImageError },

    /// Failed to decode the source image.
    #[snafu(display("Failed to decode image: {source}"))]
    Decode { source: image::ImageError },

    /// Failed to re-encode the resized image.
    #[snafu(display("Failed to encode image: {source}"))]
    Encode { source: image::ImageError },

    /// Target width must be positive.
    #[snafu(display("Target width must be at least 1"))]
    ZeroWidth,
}

// ============ Metadata Errors ============

/// Errors that can occur during metadata store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetadataError {
    /// Failed to create the metadata storage provider.
    #[snafu(display("Failed to create metadata storage"))]
    TableStorage { source: StorageError },

    /// Failed to read a metadata record.
    #[snafu(display("Failed to read metadata record '{id}'"))]
    RecordRead { id: String, source: StorageError },

    /// Failed to write a metadata record.
    #[snafu(display("Failed to write metadata record '{id}'"))]
    RecordWrite { id: String, source: StorageError },

    /// Failed to serialize a metadata record.
    #[snafu(display("Failed to serialize metadata record '{id}'"))]
    RecordSerialize {
        id: String,
        source: serde_json::Error,
    },

    /// Failed to deserialize a metadata record.
    #[snafu(display("Failed to deserialize metadata record '{id}'"))]
    RecordDeserialize {
        id: String,
        source: serde_json::Error,
    },
}

// ============ Worker Errors ============

/// Per-job errors raised by the transformation worker.
///
/// Each variant carries the source key so operators can correlate log lines
/// with redeliveries and eventual DLQ entries.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WorkerError {
    /// Failed to fetch the source object.
    #[snafu(display("Failed to fetch source '{key}': {source}"))]
    Fetch { key: String, source: StorageError },

    /// Failed to transform the source image.
    #[snafu(display("Failed to transform '{key}': {source}"))]
    Transform {
        key: String,
        source: TransformError,
    },

    /// The blocking transform task ended without producing a result.
    #[snafu(display("Transform task for '{key}' did not complete: {source}"))]
    TransformJoin {
        key: String,
        source: tokio::task::JoinError,
    },

    /// Failed to write the destination object.
    #[snafu(display("Failed to write output for '{key}': {source}"))]
    WriteOutput { key: String, source: StorageError },

    /// Failed to upsert the metadata record.
    #[snafu(display("Failed to write metadata for '{key}': {source}"))]
    Metadata { key: String, source: MetadataError },
}

impl WorkerError {
    /// The pipeline stage at which this job failed, for metrics labeling.
    pub fn stage(&self) -> FailureStage {
        match self {
            WorkerError::Fetch { .. } => FailureStage::Fetch,
            WorkerError::Transform { .. } | WorkerError::TransformJoin { .. } => {
                FailureStage::Transform
            }
            WorkerError::WriteOutput { .. } => FailureStage::Write,
            WorkerError::Metadata { .. } => FailureStage::Metadata,
        }
    }

    /// True for failures that no amount of redelivery will fix (missing or
    /// corrupt source). They still follow normal redelivery accounting so
    /// the job eventually lands in the DLQ for operator triage.
    pub fn is_permanent(&self) -> bool {
        match self {
            WorkerError::Fetch { source, .. } => source.is_not_found(),
            WorkerError::Transform { .. } => true,
            _ => false,
        }
    }
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Pipeline Errors ============

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Storage error.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Queue error.
    #[snafu(display("Queue error: {source}"))]
    Queue { source: QueueError },

    /// Event source error.
    #[snafu(display("Event source error: {source}"))]
    Event { source: EventError },

    /// Metadata store error.
    #[snafu(display("Metadata store error: {source}"))]
    MetadataStore { source: MetadataError },

    /// Task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<QueueError> for PipelineError {
    fn from(source: QueueError) -> Self {
        PipelineError::Queue { source }
    }
}

impl From<EventError> for PipelineError {
    fn from(source: EventError) -> Self {
        PipelineError::Event { source }
    }
}

impl From<MetadataError> for PipelineError {
    fn from(source: MetadataError) -> Self {
        PipelineError::MetadataStore { source }
    }
}
