//! Queue message types.
//!
//! Contains the job payload exchanged with the event source, the receipt
//! handed out on delivery, and the dead-letter record for exhausted jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of transformation work.
///
/// The wire form matches the upstream notification payload:
/// `{"sourceBucket": ..., "sourceKey": ..., "eventTime": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationJob {
    /// Bucket holding the source asset.
    pub source_bucket: String,
    /// Path of the source asset within the bucket.
    pub source_key: String,
    /// Time the upstream object-created event was emitted.
    pub event_time: DateTime<Utc>,
}

impl TransformationJob {
    pub fn new(
        source_bucket: impl Into<String>,
        source_key: impl Into<String>,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            source_bucket: source_bucket.into(),
            source_key: source_key.into(),
            event_time,
        }
    }

    /// Derive the destination key for this job: the source file name placed
    /// under the destination prefix. The prefix must already be normalized
    /// with a trailing slash.
    pub fn destination_key(&self, destination_prefix: &str) -> String {
        let file_name = self
            .source_key
            .rsplit('/')
            .next()
            .unwrap_or(&self.source_key);
        format!("{destination_prefix}{file_name}")
    }
}

/// Opaque handle identifying one queued job, required to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub(crate) id: u64,
}

/// A job delivered by `receive_batch`, hidden from other receivers until its
/// visibility timeout elapses.
#[derive(Debug, Clone)]
pub struct ReceivedJob {
    pub job: TransformationJob,
    pub receipt: Receipt,
    /// How many times this job has been delivered, including this delivery.
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// A job that exhausted its redelivery budget without being acknowledged.
///
/// Entries are created only by the queue's redrive mechanism and removed only
/// by operator intervention (replay or discard).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: TransformationJob,
    /// Receive attempts consumed before redrive.
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub moved_at: DateTime<Utc>,
}
