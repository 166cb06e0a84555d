//! Source prefix poller.
//!
//! Periodically lists the source prefix and enqueues a job for each newly
//! observed object. This is the standing replacement for push notifications:
//! the same admission rules apply, and duplicates suppressed here are only an
//! optimization since the worker's idempotency guard tolerates re-enqueues.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::emit;
use crate::error::{EventError, SourceListSnafu};
use crate::metrics::events::JobsEnqueued;
use crate::queue::{DurableQueue, TransformationJob};
use crate::storage::{StorageProvider, list_keys};
use snafu::prelude::*;

use super::JobFilter;

/// Keys remembered between polls before the set is reset. The set only
/// suppresses redundant enqueues; correctness on re-enqueue comes from the
/// worker's idempotency guard, so resetting it is safe.
const DEFAULT_SEEN_LIMIT: usize = 100_000;

/// Polls object storage for new source objects and feeds the queue.
pub struct ObjectPoller {
    storage: Arc<StorageProvider>,
    queue: Arc<DurableQueue>,
    filter: JobFilter,
    bucket: String,
    source_prefix: String,
    poll_interval: std::time::Duration,
    seen: HashSet<String>,
    seen_limit: usize,
}

impl ObjectPoller {
    pub fn new(
        storage: Arc<StorageProvider>,
        queue: Arc<DurableQueue>,
        filter: JobFilter,
        bucket: impl Into<String>,
        source_prefix: impl Into<String>,
        poll_interval: std::time::Duration,
    ) -> Self {
        Self {
            storage,
            queue,
            filter,
            bucket: bucket.into(),
            source_prefix: source_prefix.into(),
            poll_interval,
            seen: HashSet::new(),
            seen_limit: DEFAULT_SEEN_LIMIT,
        }
    }

    /// Override the seen-set bound. Past the bound the set is reset and
    /// previously seen keys may be enqueued again.
    pub fn with_seen_limit(mut self, limit: usize) -> Self {
        self.seen_limit = limit;
        self
    }

    /// Poll until cancelled. Listing failures are logged and retried on the
    /// next tick rather than taking the pipeline down.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            prefix = %self.source_prefix,
            interval_secs = self.poll_interval.as_secs(),
            "Starting source poller"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Source poller shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("Source poll failed: {}", e);
                    }
                }
            }
        }
    }

    /// One listing pass. Returns the number of jobs enqueued.
    pub async fn poll_once(&mut self) -> Result<usize, EventError> {
        if self.seen.len() >= self.seen_limit {
            debug!(
                tracked = self.seen.len(),
                "Resetting seen-key set at its bound"
            );
            self.seen.clear();
        }

        let keys = list_keys(&self.storage, &self.source_prefix)
            .await
            .context(SourceListSnafu)?;

        let mut enqueued = 0;
        for key in keys {
            if self.seen.contains(&key) {
                continue;
            }
            if self.filter.admit(&key).is_err() {
                self.seen.insert(key);
                continue;
            }

            debug!(key = %key, "New source object");
            self.queue
                .enqueue(TransformationJob::new(
                    self.bucket.clone(),
                    key.clone(),
                    Utc::now(),
                ))
                .await;
            self.seen.insert(key);
            enqueued += 1;
        }

        if enqueued > 0 {
            emit!(JobsEnqueued {
                count: enqueued as u64
            });
            info!("Enqueued {} new transformation jobs", enqueued);
        }
        Ok(enqueued)
    }
}
