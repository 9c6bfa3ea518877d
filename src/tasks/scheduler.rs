//! Scheduler task - one orchestrator tick per interval

use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::services::orchestrator::ExecutionOrchestrator;

/// Background task that drives the scheduling loop.
///
/// A tick that overruns the interval delays the next one instead of
/// stacking. On shutdown the in-flight tick finishes first.
pub async fn scheduler_task(
    orchestrator: ExecutionOrchestrator,
    tick_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_secs = tick_interval.as_secs(), "Scheduler task started");

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

        match orchestrator.run_tick(Utc::now()).await {
            Ok(summary) if summary.selected > 0 => {
                info!(
                    selected = summary.selected,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    alerted = summary.alerted,
                    suppressed = summary.suppressed,
                    aborted = summary.aborted,
                    "Scheduler tick complete"
                );
            }
            Ok(_) => debug!("No indicators due"),
            Err(e) => error!(error = %e, "Scheduler tick failed, retrying next tick"),
        }
    }

    info!("Scheduler task stopped");
}
