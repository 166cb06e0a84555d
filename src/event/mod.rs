//! Event-source adapter.
//!
//! Converts upstream object-created notifications into transformation jobs
//! and enforces the admission rules that keep the pipeline from feeding on
//! its own outputs.

mod poller;

pub use poller::ObjectPoller;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::config::normalize_prefix;
use crate::error::{EventError, KeyDecodeSnafu, NotificationParseSnafu};
use crate::queue::TransformationJob;

/// Object-created notification payload, in the S3 event wire format.
#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(rename = "Records", default)]
    records: Vec<NotificationRecord>,
}

#[derive(Debug, Deserialize)]
struct NotificationRecord {
    #[serde(rename = "eventTime")]
    event_time: DateTime<Utc>,
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: BucketEntity,
    object: ObjectEntity,
}

#[derive(Debug, Deserialize)]
struct BucketEntity {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectEntity {
    key: String,
}

/// Decode a notification object key.
///
/// Keys arrive URL-encoded with spaces as `+`, so "my photo.jpg" is
/// delivered as "my+photo.jpg".
pub fn decode_key(raw: &str) -> Result<String, EventError> {
    let plussed = raw.replace('+', " ");
    let decoded = urlencoding::decode(&plussed).map_err(|e| {
        KeyDecodeSnafu {
            key: raw.to_string(),
            message: e.to_string(),
        }
        .build()
    })?;
    Ok(decoded.into_owned())
}

/// Admission rules for candidate object keys.
#[derive(Debug, Clone)]
pub struct JobFilter {
    source_prefix: String,
    destination_prefix: String,
}

/// Why a candidate key was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Key lives under the destination prefix: admitting it would make the
    /// pipeline reprocess its own outputs indefinitely.
    FeedbackGuard,
    /// Key is outside the configured source prefix.
    OutsideSource,
    /// Key names a directory placeholder, not an object.
    Directory,
}

impl JobFilter {
    pub fn new(source_prefix: &str, destination_prefix: &str) -> Self {
        Self {
            source_prefix: normalize_prefix(source_prefix),
            destination_prefix: normalize_prefix(destination_prefix),
        }
    }

    /// Check whether a key qualifies for transformation.
    pub fn admit(&self, key: &str) -> Result<(), Rejection> {
        if key.starts_with(&self.destination_prefix) {
            return Err(Rejection::FeedbackGuard);
        }
        if !key.starts_with(&self.source_prefix) {
            return Err(Rejection::OutsideSource);
        }
        if key.ends_with('/') {
            return Err(Rejection::Directory);
        }
        Ok(())
    }
}

/// Parse a notification body into admitted transformation jobs.
///
/// Records that fail admission are logged and dropped; a notification with
/// zero admitted records is not an error.
pub fn jobs_from_notification(
    body: &[u8],
    filter: &JobFilter,
) -> Result<Vec<TransformationJob>, EventError> {
    let notification: Notification =
        serde_json::from_slice(body).context(NotificationParseSnafu)?;

    let mut jobs = Vec::new();
    for record in notification.records {
        let key = decode_key(&record.s3.object.key)?;
        match filter.admit(&key) {
            Ok(()) => {
                jobs.push(TransformationJob::new(
                    record.s3.bucket.name,
                    key,
                    record.event_time,
                ));
            }
            Err(Rejection::FeedbackGuard) => {
                warn!(key = %key, "Dropping notification for pipeline output");
            }
            Err(reason) => {
                debug!(key = %key, ?reason, "Dropping non-qualifying notification");
            }
        }
    }
    Ok(jobs)
}
