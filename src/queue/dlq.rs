//! Dead Letter Queue implementation.
//!
//! Terminal store for jobs that exhausted their redelivery budget. Entries
//! leave only through operator intervention: `drain` (discard or inspect) or
//! `replay` (re-enqueue with a fresh receive budget). Entries can optionally
//! be mirrored as NDJSON to a configured storage location for inspection
//! after the process exits.

use bytes::Bytes;
use chrono::Utc;
use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::QueueConfig;
use crate::emit;
use crate::error::{DlqSerializeSnafu, DlqStorageSnafu, DlqWriteSnafu, QueueError};
use crate::metrics::events::DlqDepth;
use crate::storage::StorageProvider;

use super::types::DeadLetterEntry;
use super::{DurableQueue, TransformationJob};

/// NDJSON persistence for dead-letter records.
struct DlqPersistence {
    storage: Arc<StorageProvider>,
    filename: String,
    buffer: Mutex<Vec<DeadLetterEntry>>,
    buffer_size: usize,
}

/// Dead Letter Queue for jobs that exceeded `max_receive_count`.
pub struct DeadLetterQueue {
    entries: Mutex<Vec<DeadLetterEntry>>,
    persistence: Option<DlqPersistence>,
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadLetterQueue {
    /// Create an in-memory DLQ without persistence.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            persistence: None,
        }
    }

    /// Create a DLQ from queue configuration, attaching NDJSON persistence
    /// when a DLQ path is configured.
    pub async fn from_config(config: &QueueConfig) -> Result<Self, QueueError> {
        let Some(dlq_path) = &config.dlq_path else {
            return Ok(Self::new());
        };

        let storage = StorageProvider::for_url_with_options(
            dlq_path,
            config.dlq_storage_options.clone(),
        )
        .await
        .context(DlqStorageSnafu)?;

        // Each run writes its own file
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let filename = format!("dead-letters-{}.ndjson", timestamp);

        info!("DLQ persistence enabled: {}/{}", dlq_path, filename);

        Ok(Self {
            entries: Mutex::new(Vec::new()),
            persistence: Some(DlqPersistence {
                storage: Arc::new(storage),
                filename,
                buffer: Mutex::new(Vec::new()),
                buffer_size: 100,
            }),
        })
    }

    /// Record a redriven job. Called only by the queue's redrive mechanism.
    pub(super) async fn push(&self, entry: DeadLetterEntry) {
        let depth = {
            let mut entries = self.entries.lock().await;
            entries.push(entry.clone());
            entries.len()
        };
        emit!(DlqDepth { count: depth });

        if let Some(persistence) = &self.persistence {
            let should_flush = {
                let mut buffer = persistence.buffer.lock().await;
                buffer.push(entry);
                buffer.len() >= persistence.buffer_size
            };

            if should_flush && let Err(e) = self.flush().await {
                error!("Failed to flush DLQ records: {}", e);
            }
        }
    }

    /// Test-only entry point for seeding the DLQ without a queue.
    #[cfg(test)]
    pub(crate) async fn push_for_tests(&self, entry: DeadLetterEntry) {
        self.push(entry).await;
    }

    /// Number of entries currently isolated in the DLQ.
    pub async fn depth(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Snapshot of all entries, for operator inspection.
    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().await.clone()
    }

    /// Remove and return all entries (operator discard).
    pub async fn drain(&self) -> Vec<DeadLetterEntry> {
        let drained = {
            let mut entries = self.entries.lock().await;
            std::mem::take(&mut *entries)
        };
        emit!(DlqDepth { count: 0 });
        drained
    }

    /// Re-enqueue all entries with a fresh receive budget (operator replay).
    /// Returns the number of jobs replayed.
    pub async fn replay(&self, queue: &DurableQueue) -> usize {
        let entries = self.drain().await;
        let count = entries.len();
        for entry in entries {
            warn!(source_key = %entry.job.source_key, "Replaying dead-lettered job");
            let DeadLetterEntry { job, .. } = entry;
            queue
                .enqueue(TransformationJob {
                    source_bucket: job.source_bucket,
                    source_key: job.source_key,
                    event_time: job.event_time,
                })
                .await;
        }
        count
    }

    /// Flush buffered records to storage.
    pub async fn flush(&self) -> Result<(), QueueError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        let records = {
            let mut buffer = persistence.buffer.lock().await;
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        let count = records.len();
        let mut ndjson = String::new();
        for record in &records {
            let line = serde_json::to_string(record).context(DlqSerializeSnafu)?;
            ndjson.push_str(&line);
            ndjson.push('\n');
        }

        persistence
            .storage
            .put(persistence.filename.as_str(), Bytes::from(ndjson))
            .await
            .context(DlqWriteSnafu)?;

        info!("Flushed {} dead-letter records", count);
        Ok(())
    }

    /// Finalize the DLQ, flushing any remaining records.
    pub async fn finalize(&self) -> Result<(), QueueError> {
        self.flush().await?;
        let depth = self.depth().await;
        if depth > 0 {
            warn!("DLQ holds {} entries awaiting operator triage", depth);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn entry(key: &str) -> DeadLetterEntry {
        DeadLetterEntry {
            job: TransformationJob::new("media-bucket", key, Utc::now()),
            receive_count: 5,
            enqueued_at: Utc::now(),
            moved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_drain_empties_dlq() {
        let dlq = DeadLetterQueue::new();
        dlq.push(entry("uploads/a.jpg")).await;
        dlq.push(entry("uploads/b.jpg")).await;

        assert_eq!(dlq.depth().await, 2);
        let drained = dlq.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(dlq.depth().await, 0);
    }

    #[tokio::test]
    async fn test_replay_reenqueues_with_fresh_budget() {
        let dlq = Arc::new(DeadLetterQueue::new());
        let queue = DurableQueue::new(&QueueConfig::default(), dlq.clone());

        dlq.push(entry("uploads/a.jpg")).await;
        let replayed = dlq.replay(&queue).await;

        assert_eq!(replayed, 1);
        assert_eq!(dlq.depth().await, 0);

        let batch = queue.receive_batch(10).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].receive_count, 1);
    }

    #[tokio::test]
    async fn test_persisted_records_are_ndjson() {
        let temp_dir = TempDir::new().unwrap();
        let config = QueueConfig {
            dlq_path: Some(temp_dir.path().to_str().unwrap().to_string()),
            dlq_storage_options: HashMap::new(),
            ..QueueConfig::default()
        };

        let dlq = DeadLetterQueue::from_config(&config).await.unwrap();
        dlq.push(entry("uploads/a.jpg")).await;
        dlq.push(entry("uploads/b.jpg")).await;
        dlq.finalize().await.unwrap();

        let files: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);

        let content = std::fs::read_to_string(&files[0]).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: DeadLetterEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.job.source_key, "uploads/a.jpg");
    }
}
