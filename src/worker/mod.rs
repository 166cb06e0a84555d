//! Transformation worker.
//!
//! Stateless consumer of the durable queue. Each invocation receives one
//! batch, processes its jobs independently, and acknowledges a job only once
//! every side effect of processing it is durable. There are no in-worker
//! retries: any failure leaves the job unacknowledged so visibility-timeout
//! redelivery can try again with a fresh invocation.

use futures::stream::{FuturesUnordered, StreamExt};
use snafu::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerting::PipelineWindow;
use crate::config::Config;
use crate::emit;
use crate::error::{
    FetchSnafu, MetadataSnafu, TransformJoinSnafu, TransformSnafu, WorkerError, WriteOutputSnafu,
};
use crate::event::JobFilter;
use crate::metadata::{MetadataRecord, MetadataStore};
use crate::metrics::events::{
    InvocationCompleted, InvocationThrottled, JobFailed, JobProcessed, JobStatus,
    TransformCompleted,
};
use crate::queue::{DurableQueue, ReceivedJob};
use crate::storage::StorageProvider;
use crate::transform;

/// Backoff applied when a receive attempt is throttled.
const THROTTLE_BACKOFF: Duration = Duration::from_millis(100);
/// Backoff applied when the queue has nothing visible.
const IDLE_BACKOFF: Duration = Duration::from_millis(250);

/// Outcome of one batch invocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Stateless job processor shared by all invocations.
pub struct Worker {
    queue: Arc<DurableQueue>,
    storage: Arc<StorageProvider>,
    metadata: Arc<MetadataStore>,
    filter: JobFilter,
    destination_prefix: String,
    target_width: u32,
}

impl Worker {
    pub fn new(
        config: &Config,
        queue: Arc<DurableQueue>,
        storage: Arc<StorageProvider>,
        metadata: Arc<MetadataStore>,
    ) -> Self {
        Self {
            queue,
            storage,
            metadata,
            filter: JobFilter::new(&config.worker.source_prefix, &config.worker.destination_prefix),
            destination_prefix: config.destination_prefix(),
            target_width: config.worker.target_width_px,
        }
    }

    /// Process one batch. Jobs fail and are acknowledged independently; one
    /// poison job never blocks the rest of its batch.
    pub async fn process_batch(&self, batch: Vec<ReceivedJob>) -> BatchOutcome {
        let mut results: FuturesUnordered<_> = batch
            .iter()
            .map(|received| self.process_one(received))
            .collect();

        let mut outcome = BatchOutcome::default();
        while let Some(status) = results.next().await {
            match status {
                JobStatus::Success => outcome.succeeded += 1,
                JobStatus::Skipped => outcome.skipped += 1,
                JobStatus::Failed => outcome.failed += 1,
            }
        }
        outcome
    }

    /// Process a single received job through to its ack decision.
    async fn process_one(&self, received: &ReceivedJob) -> JobStatus {
        let key = &received.job.source_key;

        // The queue can be fed by external notifications, so admission is
        // re-checked here even though the poller filters too. A job for a
        // pipeline output is acknowledged without processing, breaking any
        // feedback loop at the second line of defense.
        if let Err(reason) = self.filter.admit(key) {
            warn!(key = %key, ?reason, "Discarding non-qualifying job");
            self.queue.ack(&received.receipt).await;
            emit!(JobProcessed {
                status: JobStatus::Skipped
            });
            return JobStatus::Skipped;
        }

        match self.transform_job(received).await {
            Ok(status) => {
                self.queue.ack(&received.receipt).await;
                emit!(JobProcessed { status });
                status
            }
            Err(e) => {
                if e.is_permanent() {
                    warn!(
                        key = %key,
                        receive_count = received.receive_count,
                        "Job failed permanently, redelivery will exhaust into the DLQ: {}",
                        e
                    );
                } else {
                    error!(
                        key = %key,
                        receive_count = received.receive_count,
                        "Job failed, leaving unacknowledged for redelivery: {}",
                        e
                    );
                }

                // Best-effort failure record; the job's fate is governed by
                // the queue, not by this write.
                let record = MetadataRecord::failed(key.clone());
                if let Err(me) = self.metadata.upsert(&record).await {
                    warn!(key = %key, "Could not record failure: {}", me);
                }

                emit!(JobFailed { stage: e.stage() });
                emit!(JobProcessed {
                    status: JobStatus::Failed
                });
                JobStatus::Failed
            }
        }
    }

    /// Fetch, transform, write, and record one job. Ordering is load-bearing:
    /// the destination object must be durable before the metadata record
    /// claims success, and both before the caller acknowledges.
    async fn transform_job(&self, received: &ReceivedJob) -> Result<JobStatus, WorkerError> {
        let job = &received.job;
        let key = job.source_key.as_str();
        let destination = job.destination_key(&self.destination_prefix);

        if self
            .storage
            .exists(destination.as_str())
            .await
            .context(FetchSnafu { key })?
        {
            return self.refresh_metadata(key, &destination).await;
        }

        let source_bytes = self
            .storage
            .get(key)
            .await
            .context(FetchSnafu { key })?;

        // Decode and resize are CPU-bound; keep them off the async workers
        let target_width = self.target_width;
        let started = Instant::now();
        let transformed =
            tokio::task::spawn_blocking(move || transform::resize_to_width(&source_bytes, target_width))
                .await
                .context(TransformJoinSnafu { key })?
                .context(TransformSnafu { key })?;
        emit!(TransformCompleted {
            duration: started.elapsed()
        });

        self.storage
            .put(destination.as_str(), transformed.bytes.clone())
            .await
            .context(WriteOutputSnafu { key })?;

        let record = MetadataRecord::succeeded(key, transformed.width, transformed.height);
        self.metadata
            .upsert(&record)
            .await
            .context(MetadataSnafu { key })?;

        debug!(
            key = %key,
            destination = %destination,
            width = transformed.width,
            height = transformed.height,
            "Transformed"
        );
        Ok(JobStatus::Success)
    }

    /// Idempotency guard hit: the output already exists, typically because a
    /// previous invocation crashed between writing it and acknowledging. The
    /// transform is skipped and the metadata record is refreshed from the
    /// existing output so the record converges even if the earlier attempt
    /// died before writing it.
    async fn refresh_metadata(&self, key: &str, destination: &str) -> Result<JobStatus, WorkerError> {
        let existing = self
            .storage
            .get(destination)
            .await
            .context(FetchSnafu { key })?;
        let (width, height) = transform::dimensions(&existing).context(TransformSnafu { key })?;

        let record = MetadataRecord::succeeded(key, width, height);
        self.metadata
            .upsert(&record)
            .await
            .context(MetadataSnafu { key })?;

        debug!(key = %key, destination = %destination, "Output already exists, skipping transform");
        Ok(JobStatus::Skipped)
    }
}

/// Cumulative totals across all invocations of one pool.
#[derive(Debug, Default)]
struct PoolTotals {
    invocations: AtomicU64,
    throttled: AtomicU64,
    timed_out: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_skipped: AtomicU64,
    jobs_failed: AtomicU64,
}

/// Final statistics reported when the pool shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub invocations: u64,
    pub throttled: u64,
    pub timed_out: u64,
    pub jobs_succeeded: u64,
    pub jobs_skipped: u64,
    pub jobs_failed: u64,
}

/// Drives concurrent batch invocations against the queue.
///
/// Concurrency is bounded by a semaphore sized to `max_concurrent_batches`;
/// a receive attempt with no free slot is throttled and counted, never
/// queued in-process.
pub struct WorkerPool {
    worker: Arc<Worker>,
    queue: Arc<DurableQueue>,
    window: Arc<PipelineWindow>,
    batch_size: usize,
    invocation_timeout: Duration,
    slots: Arc<Semaphore>,
    totals: Arc<PoolTotals>,
}

impl WorkerPool {
    pub fn new(
        config: &Config,
        worker: Arc<Worker>,
        queue: Arc<DurableQueue>,
        window: Arc<PipelineWindow>,
    ) -> Self {
        Self {
            worker,
            queue,
            window,
            batch_size: config.worker.batch_size,
            invocation_timeout: config.worker.invocation_timeout(),
            slots: Arc::new(Semaphore::new(config.worker.max_concurrent_batches)),
            totals: Arc::new(PoolTotals::default()),
        }
    }

    /// Receive and process batches until cancelled, then drain in-flight
    /// invocations and report totals.
    pub async fn run(&self, shutdown: CancellationToken) -> PipelineStats {
        let mut invocations: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished invocations without blocking the receive loop
            while invocations.try_join_next().is_some() {}

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.next_invocation(&mut invocations) => {}
            }
        }

        info!("Worker pool draining {} in-flight invocations", invocations.len());
        while invocations.join_next().await.is_some() {}
        self.stats()
    }

    async fn next_invocation(&self, invocations: &mut JoinSet<()>) {
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                emit!(InvocationThrottled);
                self.window.record_throttle();
                self.totals.throttled.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(THROTTLE_BACKOFF).await;
                return;
            }
        };

        let batch = self.queue.receive_batch(self.batch_size).await;
        if batch.is_empty() {
            drop(permit);
            tokio::time::sleep(IDLE_BACKOFF).await;
            return;
        }

        let worker = self.worker.clone();
        let window = self.window.clone();
        let totals = self.totals.clone();
        let timeout = self.invocation_timeout;

        invocations.spawn(async move {
            let batch_len = batch.len();
            let started = Instant::now();
            let result = tokio::time::timeout(timeout, worker.process_batch(batch)).await;
            let elapsed = started.elapsed();

            totals.invocations.fetch_add(1, Ordering::Relaxed);
            emit!(InvocationCompleted { duration: elapsed });
            window.record_duration(elapsed);

            match result {
                Ok(outcome) => {
                    totals
                        .jobs_succeeded
                        .fetch_add(outcome.succeeded as u64, Ordering::Relaxed);
                    totals
                        .jobs_skipped
                        .fetch_add(outcome.skipped as u64, Ordering::Relaxed);
                    totals
                        .jobs_failed
                        .fetch_add(outcome.failed as u64, Ordering::Relaxed);
                    for _ in 0..outcome.failed {
                        window.record_error();
                    }
                }
                Err(_) => {
                    // Abandoned mid-flight. Unacknowledged jobs come back via
                    // visibility-timeout redelivery.
                    error!(
                        batch_len,
                        timeout_secs = timeout.as_secs(),
                        "Invocation exceeded its timeout and was abandoned"
                    );
                    totals.timed_out.fetch_add(1, Ordering::Relaxed);
                    window.record_error();
                }
            }

            drop(permit);
        });
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            invocations: self.totals.invocations.load(Ordering::Relaxed),
            throttled: self.totals.throttled.load(Ordering::Relaxed),
            timed_out: self.totals.timed_out.load(Ordering::Relaxed),
            jobs_succeeded: self.totals.jobs_succeeded.load(Ordering::Relaxed),
            jobs_skipped: self.totals.jobs_skipped.load(Ordering::Relaxed),
            jobs_failed: self.totals.jobs_failed.load(Ordering::Relaxed),
        }
    }
}
