//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Outcome of a processed transformation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Skipped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Skipped => "skipped",
            JobStatus::Failed => "failed",
        }
    }
}

/// Stage at which a job failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Fetch,
    Transform,
    Write,
    Metadata,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Fetch => "fetch",
            FailureStage::Transform => "transform",
            FailureStage::Write => "write",
            FailureStage::Metadata => "metadata",
        }
    }
}

/// Event emitted when jobs are accepted from the event source.
pub struct JobsEnqueued {
    pub count: u64,
}

impl InternalEvent for JobsEnqueued {
    fn emit(self) {
        trace!(count = self.count, "Jobs enqueued");
        counter!("darkroom_jobs_enqueued_total").increment(self.count);
    }
}

/// Event emitted when a job finishes processing.
pub struct JobProcessed {
    pub status: JobStatus,
}

impl InternalEvent for JobProcessed {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Job processed");
        counter!("darkroom_jobs_processed_total", "status" => self.status.as_str()).increment(1);
    }
}

/// Event emitted when a job fails processing.
pub struct JobFailed {
    pub stage: FailureStage,
}

impl InternalEvent for JobFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), "Job failed");
        counter!("darkroom_jobs_failed_total", "stage" => self.stage.as_str()).increment(1);
    }
}

/// Event emitted when jobs exhaust their redelivery budget and are
/// redriven into the dead-letter queue.
pub struct JobsRedriven {
    pub count: u64,
}

impl InternalEvent for JobsRedriven {
    fn emit(self) {
        trace!(count = self.count, "Jobs redriven to DLQ");
        counter!("darkroom_jobs_redriven_total").increment(self.count);
    }
}

/// Event emitted when a receive attempt is rejected because the
/// concurrency bound is exhausted.
pub struct InvocationThrottled;

impl InternalEvent for InvocationThrottled {
    fn emit(self) {
        trace!("Invocation throttled");
        counter!("darkroom_invocations_throttled_total").increment(1);
    }
}

// ============================================================================
// Histogram events for timing
// ============================================================================

/// Event emitted when a worker invocation (one batch) completes.
pub struct InvocationCompleted {
    pub duration: Duration,
}

impl InternalEvent for InvocationCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Invocation completed"
        );
        histogram!("darkroom_invocation_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when an image transform completes.
pub struct TransformCompleted {
    pub duration: Duration,
}

impl InternalEvent for TransformCompleted {
    fn emit(self) {
        trace!(duration_ms = self.duration.as_millis(), "Transform completed");
        histogram!("darkroom_transform_duration_seconds").record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Gauge events for queue depths and alarm state
// ============================================================================

/// Event emitted when the durable queue depth changes.
pub struct QueueDepth {
    pub count: usize,
}

impl InternalEvent for QueueDepth {
    fn emit(self) {
        trace!(count = self.count, "Queue depth");
        gauge!("darkroom_queue_depth").set(self.count as f64);
    }
}

/// Event emitted when the dead-letter queue depth changes.
pub struct DlqDepth {
    pub count: usize,
}

impl InternalEvent for DlqDepth {
    fn emit(self) {
        trace!(count = self.count, "DLQ depth");
        gauge!("darkroom_dlq_depth").set(self.count as f64);
    }
}

/// Event emitted when an alarm changes state.
pub struct AlarmStateChanged {
    pub alarm: &'static str,
    pub firing: bool,
}

impl InternalEvent for AlarmStateChanged {
    fn emit(self) {
        trace!(alarm = self.alarm, firing = self.firing, "Alarm state changed");
        gauge!("darkroom_alarm_firing", "alarm" => self.alarm).set(if self.firing {
            1.0
        } else {
            0.0
        });
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    Head,
    List,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::Head => "head",
            StorageOperation::List => "list",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "darkroom_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request duration"
        );
        histogram!(
            "darkroom_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
