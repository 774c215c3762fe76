use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Engine;
use crate::scheduler::FiredJob;

/// Drain fired jobs from the timer queue and complete their reservations.
pub async fn run_completion_worker(
    engine: Arc<Engine>,
    mut jobs: mpsc::Receiver<FiredJob>,
    shutdown: CancellationToken,
) {
    info!("completion worker started");
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let Some(reservation_id) = job.reservation_id() else {
            tracing::warn!(key = %job.key, action = %job.action, "ignoring unknown job");
            continue;
        };
        match engine.fire_completion(reservation_id, "scheduler").await {
            Ok(true) => info!(%reservation_id, "reservation completed"),
            Ok(false) => tracing::debug!(%reservation_id, "completion fire was a no-op"),
            Err(e) => tracing::warn!(%reservation_id, error = %e, "completion fire failed"),
        }
    }
    info!("completion worker stopped");
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub rearmed: usize,
    pub completed: usize,
}

/// One pass of the backstop: re-arm jobs that failed to schedule, then
/// complete anything whose end has passed regardless of its job.
pub async fn sweep_once(engine: &Engine) -> SweepReport {
    let rearmed = engine.reconcile_schedules().await;
    let due = engine.collect_due_completions(engine.now()).await;
    let results = join_all(due.iter().map(|id| engine.fire_completion(*id, "sweep"))).await;

    let mut completed = 0;
    for (id, result) in due.iter().zip(results) {
        match result {
            Ok(true) => completed += 1,
            Ok(false) => {}
            Err(e) => tracing::debug!(reservation_id = %id, error = %e, "sweep skip"),
        }
    }
    SweepReport { rearmed, completed }
}

pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let report = sweep_once(&engine).await;
        if report != SweepReport::default() {
            info!(rearmed = report.rearmed, completed = report.completed, "sweep");
        }
    }
}

/// Compact the WAL whenever enough appends have piled up since the last rewrite.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => tracing::error!(error = %e, "WAL compaction failed"),
        }
    }
}
