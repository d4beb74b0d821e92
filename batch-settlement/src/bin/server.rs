use batch_settlement::{BatchService, Config, IntervalTicks, Scheduler};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Batch settlement starting...");

    // Load configuration
    let config = match std::env::var("BATCH_CONFIG") {
        Ok(path) => {
            info!("Loading configuration from {}", path);
            Config::from_file(path)?
        }
        Err(_) => Config::from_env()?,
    };

    info!(
        "Configuration loaded - window: {}s, deadline: {}s, clearing: {}",
        config.window.interval_seconds,
        config.window.batch_timeout_seconds,
        if config.clearing.mock_enabled {
            "mock"
        } else {
            config.clearing.endpoint.as_str()
        }
    );

    let interval = config.window.interval();
    let service = Arc::new(BatchService::from_config(config)?);
    let scheduler = Scheduler::start(service.clone(), IntervalTicks::new(interval));

    info!("Batch settlement running, wallet {}", service.status().wallet_identity);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for in-flight batch");

    scheduler.stop().await?;

    let status = service.status();
    info!(
        "Batch settlement stopped: {} batches, {} completed, {} pending",
        status.batches_run, status.completed_count, status.pending_count
    );

    Ok(())
}
