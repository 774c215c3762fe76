use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use estatebook::clock::{Clock, SystemClock};
use estatebook::config::Config;
use estatebook::engine::Engine;
use estatebook::notify::NotifyHub;
use estatebook::reaper;
use estatebook::scheduler::{CompletionScheduler, TimerQueue};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    estatebook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (queue, fired) = TimerQueue::new(clock.clone(), config.max_armed_jobs);
    let scheduler = CompletionScheduler::new(Arc::new(queue));
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(
        Engine::new(config.wal_path(), notify, scheduler)?
            .with_clock(clock)
            .with_completion_grace(config.completion_grace),
    );

    info!("estatebook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  sweep_interval: {:?}", config.sweep_interval);
    info!("  completion_grace: {}s", config.completion_grace.num_seconds());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let shutdown = CancellationToken::new();
    let tasks = vec![
        tokio::spawn(reaper::run_completion_worker(engine.clone(), fired, shutdown.clone())),
        // The first sweep runs immediately and re-arms jobs for replayed reservations.
        tokio::spawn(reaper::run_sweeper(engine.clone(), config.sweep_interval, shutdown.clone())),
        tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold, shutdown.clone())),
    ];

    wait_for_signal().await?;
    info!("shutdown signal received, stopping background tasks");
    shutdown.cancel();
    for task in futures::future::join_all(tasks).await {
        if let Err(e) = task {
            tracing::error!("background task panicked: {e}");
        }
    }

    info!("estatebook stopped");
    Ok(())
}

async fn wait_for_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = ctrl_c => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    Ok(())
}
