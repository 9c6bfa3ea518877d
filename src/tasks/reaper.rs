//! Reaper task - releases running flags left behind by crashed processes

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::metrics::SchedulerMetrics;
use crate::services::guard::{ExecutionGuard, StaleRunPolicy};

/// Background task that periodically force-releases stale executions.
///
/// Runs once at startup, then every `reaper_interval`.
pub async fn reaper_task(
    guard: ExecutionGuard,
    policy: StaleRunPolicy,
    reaper_interval: Duration,
    metrics: Arc<SchedulerMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(reaper_interval);

    info!(
        interval_secs = reaper_interval.as_secs(),
        floor_minutes = policy.floor.num_minutes(),
        ceiling_minutes = policy.ceiling.num_minutes(),
        "Stale-run reaper started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        match guard.reap_stale(Utc::now(), &policy).await {
            Ok(released) if !released.is_empty() => {
                metrics.inc_stale_released(released.len() as u64);
                warn!(count = released.len(), indicators = ?released, "Released stale executions");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Stale-run scan failed"),
        }
    }

    info!("Stale-run reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{sample_indicator, MemoryStore};
    use crate::store::IndicatorStore;

    #[tokio::test]
    async fn test_reaps_on_first_pass() {
        let store = Arc::new(MemoryStore::new());
        store.insert(sample_indicator(1));
        store
            .try_acquire_running(1, Utc::now() - chrono::Duration::hours(4))
            .await
            .unwrap();

        let metrics = Arc::new(SchedulerMetrics::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reaper_task(
            ExecutionGuard::new(store.clone()),
            StaleRunPolicy::default(),
            Duration::from_secs(3600),
            metrics.clone(),
            shutdown_rx,
        ));

        for _ in 0..200 {
            if !store.indicator(1).unwrap().is_currently_running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!store.indicator(1).unwrap().is_currently_running);
        assert_eq!(metrics.snapshot().stale_runs_released_total, 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
