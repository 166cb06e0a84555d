//! Pipeline assembly and lifecycle.
//!
//! Wires storage, queue, metadata, alarms, poller, and worker pool together
//! and runs them until shutdown.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alerting::{LogNotifier, PipelineWindow, spawn_evaluators, standard_alarms};
use crate::config::Config;
use crate::error::PipelineError;
use crate::event::{JobFilter, ObjectPoller};
use crate::metadata::MetadataStore;
use crate::queue::{DeadLetterQueue, DurableQueue};
use crate::signal::shutdown_signal;
use crate::storage::StorageProvider;
use crate::worker::{PipelineStats, Worker, WorkerPool};

/// Run the pipeline until an OS shutdown signal arrives.
pub async fn run_pipeline(config: Config) -> Result<PipelineStats, PipelineError> {
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    run_pipeline_until(config, shutdown).await
}

/// Run the pipeline until the given token is cancelled.
pub async fn run_pipeline_until(
    config: Config,
    shutdown: CancellationToken,
) -> Result<PipelineStats, PipelineError> {
    config.validate()?;

    let storage = Arc::new(
        StorageProvider::for_url_with_options(
            &config.storage.path,
            config.storage.storage_options.clone(),
        )
        .await?,
    );
    info!(storage = ?storage, "Storage provider ready");

    // The DLQ must exist before the queue that redrives into it
    let dlq = Arc::new(DeadLetterQueue::from_config(&config.queue).await?);
    let queue = Arc::new(DurableQueue::new(&config.queue, dlq.clone()));

    let metadata = Arc::new(MetadataStore::from_config(&config.metadata).await?);

    // The observation window must cover the longest evaluation period
    let window_secs = [
        config.alerting.errors.evaluation_period_secs,
        config.alerting.throttles.evaluation_period_secs,
        config.alerting.duration_p95.evaluation_period_secs,
    ]
    .into_iter()
    .max()
    .unwrap_or(60)
    .max(60);
    let window = Arc::new(PipelineWindow::new(Duration::from_secs(window_secs)));

    let alarms = standard_alarms(&config.alerting, window.clone(), dlq.clone());
    info!("Evaluating {} alarms", alarms.len());
    let mut alarm_tasks = spawn_evaluators(alarms, Arc::new(LogNotifier), shutdown.clone());

    let poller = ObjectPoller::new(
        storage.clone(),
        queue.clone(),
        JobFilter::new(&config.worker.source_prefix, &config.worker.destination_prefix),
        config.storage.path.clone(),
        config.source_prefix(),
        config.worker.poll_interval(),
    );
    let poller_handle = tokio::spawn(poller.run(shutdown.clone()));

    let worker = Arc::new(Worker::new(
        &config,
        queue.clone(),
        storage.clone(),
        metadata.clone(),
    ));
    let pool = WorkerPool::new(&config, worker, queue.clone(), window.clone());

    info!(
        source_prefix = %config.source_prefix(),
        destination_prefix = %config.destination_prefix(),
        target_width_px = config.worker.target_width_px,
        "Pipeline running"
    );

    let stats = pool.run(shutdown.clone()).await;

    // Orderly teardown: poller and alarm tasks observe the same token
    if let Err(e) = poller_handle.await {
        warn!("Poller task ended abnormally: {}", e);
    }
    while alarm_tasks.join_next().await.is_some() {}

    dlq.finalize().await?;

    let dlq_depth = dlq.depth().await;
    if dlq_depth > 0 {
        warn!("{} jobs remain in the DLQ", dlq_depth);
    }

    Ok(stats)
}
