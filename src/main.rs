use clap::Parser;
use snafu::prelude::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use darkroom::config::Config;
use darkroom::error::{AddressParseSnafu, MetricsSnafu, PipelineError};
use darkroom::pipeline::run_pipeline;

#[derive(Parser, Debug)]
#[command(author, version, about = "Media transformation pipeline")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate configuration and print the resulting wiring without running
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = Config::from_file(&args.config)?;

    if args.dry_run {
        info!("Configuration valid");
        info!("  storage:            {}", config.storage.path);
        info!("  metadata:           {}", config.metadata.path);
        info!("  source prefix:      {}", config.source_prefix());
        info!("  destination prefix: {}", config.destination_prefix());
        info!("  target width:       {}px", config.worker.target_width_px);
        info!(
            "  queue:              visibility {}s, max receives {}",
            config.queue.visibility_timeout_secs, config.queue.max_receive_count
        );
        match &config.queue.dlq_path {
            Some(path) => info!("  dlq persistence:    {}", path),
            None => info!("  dlq persistence:    disabled"),
        }
        return Ok(());
    }

    if config.metrics.enabled {
        let addr: SocketAddr = config.metrics.address.parse().context(AddressParseSnafu)?;
        darkroom::metrics::init(addr).context(MetricsSnafu)?;
        info!("Metrics available at http://{}/metrics", addr);
    }

    let stats = run_pipeline(config).await?;

    info!(
        invocations = stats.invocations,
        succeeded = stats.jobs_succeeded,
        skipped = stats.jobs_skipped,
        failed = stats.jobs_failed,
        throttled = stats.throttled,
        timed_out = stats.timed_out,
        "Pipeline stopped"
    );
    Ok(())
}
