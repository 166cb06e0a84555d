//! Durable in-process queue with at-least-once delivery.
//!
//! Mirrors the semantics of a managed message queue: received jobs are
//! hidden for a visibility timeout and redelivered if not acknowledged in
//! time; jobs that exhaust their receive budget are redriven into the
//! dead-letter queue instead of being delivered again.

mod dlq;
mod types;

pub use dlq::DeadLetterQueue;
pub use types::{DeadLetterEntry, Receipt, ReceivedJob, TransformationJob};

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::emit;
use crate::metrics::events::{JobsRedriven, QueueDepth};

/// A queued job together with its delivery bookkeeping.
#[derive(Debug)]
struct Envelope {
    id: u64,
    job: TransformationJob,
    receive_count: u32,
    enqueued_at: DateTime<Utc>,
    /// Jobs are deliverable once this instant has passed.
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<Envelope>,
    next_id: u64,
}

/// Durable queue with visibility-timeout-based at-least-once delivery.
///
/// There is no explicit nack: an unacknowledged job simply becomes visible
/// again when its timeout elapses, with its receive count incremented.
pub struct DurableQueue {
    state: Mutex<QueueState>,
    dlq: Arc<DeadLetterQueue>,
    visibility_timeout: Duration,
    max_receive_count: u32,
}

impl DurableQueue {
    /// Create a queue referencing an already-constructed DLQ.
    ///
    /// The DLQ must exist before the queue referencing it; assembly order
    /// matters here, not runtime coordination.
    pub fn new(config: &QueueConfig, dlq: Arc<DeadLetterQueue>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            dlq,
            visibility_timeout: config.visibility_timeout(),
            max_receive_count: config.max_receive_count,
        }
    }

    /// Enqueue a job. Duplicate enqueues are possible and are tolerated
    /// downstream by the worker's idempotency guard.
    pub async fn enqueue(&self, job: TransformationJob) {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        debug!(id, source_key = %job.source_key, "Enqueued job");
        state.entries.push_back(Envelope {
            id,
            job,
            receive_count: 0,
            enqueued_at: Utc::now(),
            visible_at: Instant::now(),
        });
        emit!(QueueDepth {
            count: state.entries.len()
        });
    }

    /// Receive up to `max_messages` visible jobs.
    ///
    /// Each delivered job is hidden for the visibility timeout and has its
    /// receive count incremented. Jobs whose next delivery would exceed the
    /// receive budget are moved to the DLQ instead of being returned.
    pub async fn receive_batch(&self, max_messages: usize) -> Vec<ReceivedJob> {
        let now = Instant::now();
        let mut redriven = Vec::new();
        let mut delivered = Vec::new();

        {
            let mut state = self.state.lock().await;
            let mut remaining = VecDeque::with_capacity(state.entries.len());

            while let Some(mut envelope) = state.entries.pop_front() {
                if envelope.visible_at > now {
                    remaining.push_back(envelope);
                    continue;
                }

                if envelope.receive_count >= self.max_receive_count {
                    redriven.push(envelope);
                    continue;
                }

                if delivered.len() >= max_messages {
                    remaining.push_back(envelope);
                    continue;
                }

                envelope.receive_count += 1;
                envelope.visible_at = now + self.visibility_timeout;
                delivered.push(ReceivedJob {
                    job: envelope.job.clone(),
                    receipt: Receipt { id: envelope.id },
                    receive_count: envelope.receive_count,
                    enqueued_at: envelope.enqueued_at,
                });
                remaining.push_back(envelope);
            }

            state.entries = remaining;
            emit!(QueueDepth {
                count: state.entries.len()
            });
        }

        if !redriven.is_empty() {
            emit!(JobsRedriven {
                count: redriven.len() as u64
            });
            for envelope in redriven {
                warn!(
                    source_key = %envelope.job.source_key,
                    receive_count = envelope.receive_count,
                    "Job exhausted its receive budget, moving to DLQ"
                );
                self.dlq
                    .push(DeadLetterEntry {
                        job: envelope.job,
                        receive_count: envelope.receive_count,
                        enqueued_at: envelope.enqueued_at,
                        moved_at: Utc::now(),
                    })
                    .await;
            }
        }

        delivered
    }

    /// Permanently remove an acknowledged job.
    ///
    /// Must be called only once all side effects of processing are durable.
    /// Acknowledging a job that is no longer queued (e.g. a duplicate ack
    /// after redelivery) is a no-op; returns whether the job was removed.
    pub async fn ack(&self, receipt: &Receipt) -> bool {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|envelope| envelope.id != receipt.id);
        let removed = state.entries.len() < before;
        emit!(QueueDepth {
            count: state.entries.len()
        });
        removed
    }

    /// Number of jobs currently held by the queue, visible or in flight.
    pub async fn depth(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// The dead-letter queue this queue redrives into.
    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(visibility_secs: u64, max_receive_count: u32) -> QueueConfig {
        QueueConfig {
            visibility_timeout_secs: visibility_secs,
            max_receive_count,
            dlq_path: None,
            dlq_storage_options: Default::default(),
        }
    }

    fn job(key: &str) -> TransformationJob {
        TransformationJob::new("media-bucket", key, Utc::now())
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_hides_job_until_timeout() {
        let dlq = Arc::new(DeadLetterQueue::new());
        let queue = DurableQueue::new(&test_config(30, 5), dlq);

        queue.enqueue(job("uploads/a.jpg")).await;

        let first = queue.receive_batch(10).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);

        // Still hidden
        assert!(queue.receive_batch(10).await.is_empty());

        // Visible again after the timeout, with an incremented receive count
        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.receive_batch(10).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
        assert_eq!(second[0].job.source_key, "uploads/a.jpg");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_removes_job_permanently() {
        let dlq = Arc::new(DeadLetterQueue::new());
        let queue = DurableQueue::new(&test_config(30, 5), dlq);

        queue.enqueue(job("uploads/a.jpg")).await;
        let received = queue.receive_batch(10).await;
        assert!(queue.ack(&received[0].receipt).await);
        assert_eq!(queue.depth().await, 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(queue.receive_batch(10).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ack_is_noop() {
        let dlq = Arc::new(DeadLetterQueue::new());
        let queue = DurableQueue::new(&test_config(30, 5), dlq);

        queue.enqueue(job("uploads/a.jpg")).await;
        let received = queue.receive_batch(10).await;
        assert!(queue.ack(&received[0].receipt).await);
        assert!(!queue.ack(&received[0].receipt).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redrive_after_max_receive_count() {
        let dlq = Arc::new(DeadLetterQueue::new());
        let queue = DurableQueue::new(&test_config(10, 3), dlq.clone());

        queue.enqueue(job("uploads/poison.jpg")).await;

        // Exactly max_receive_count deliveries, none acknowledged
        for attempt in 1..=3u32 {
            tokio::time::advance(Duration::from_secs(11)).await;
            let batch = queue.receive_batch(10).await;
            assert_eq!(batch.len(), 1, "attempt {attempt} should deliver");
            assert_eq!(batch[0].receive_count, attempt);
        }

        // The next receive attempt redrives instead of delivering
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(queue.receive_batch(10).await.is_empty());

        assert_eq!(queue.depth().await, 0);
        assert_eq!(dlq.depth().await, 1);
        let entries = dlq.entries().await;
        assert_eq!(entries[0].job.source_key, "uploads/poison.jpg");
        assert_eq!(entries[0].receive_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_size_respected() {
        let dlq = Arc::new(DeadLetterQueue::new());
        let queue = DurableQueue::new(&test_config(30, 5), dlq);

        for i in 0..7 {
            queue.enqueue(job(&format!("uploads/{i}.jpg"))).await;
        }

        let batch = queue.receive_batch(5).await;
        assert_eq!(batch.len(), 5);
        let rest = queue.receive_batch(5).await;
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_jobs_keep_fifo_redelivery() {
        let dlq = Arc::new(DeadLetterQueue::new());
        let queue = DurableQueue::new(&test_config(5, 5), dlq);

        queue.enqueue(job("uploads/a.jpg")).await;
        queue.enqueue(job("uploads/b.jpg")).await;

        let batch = queue.receive_batch(10).await;
        assert_eq!(batch.len(), 2);
        // Ack only the second
        queue.ack(&batch[1].receipt).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        let redelivered = queue.receive_batch(10).await;
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].job.source_key, "uploads/a.jpg");
    }
}
