//! Dispatch task - drains the event outbox to notifications and subscribers

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use crate::buffer::EventOutbox;
use crate::metrics::SchedulerMetrics;
use crate::models::ExecutionEvent;
use crate::store::Notifier;

const DISPATCH_INTERVAL: Duration = Duration::from_millis(500);
const DISPATCH_BATCH: usize = 1000;

/// Background task that hands alert intents to the notifier and fans every
/// event out to WebSocket subscribers.
///
/// Runs every 500ms. On shutdown the outbox is drained once more so events
/// from the last executions are not lost.
pub async fn dispatch_task(
    outbox: EventOutbox,
    notifier: Arc<dyn Notifier>,
    broadcast_tx: broadcast::Sender<ExecutionEvent>,
    metrics: Arc<SchedulerMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(DISPATCH_INTERVAL);

    info!("Dispatch task started (500ms interval)");

    loop {
        let stopping = tokio::select! {
            _ = interval.tick() => false,
            changed = shutdown.changed() => changed.is_err(),
        };

        dispatch_batch(&outbox, notifier.as_ref(), &broadcast_tx, &metrics).await;

        if stopping || *shutdown.borrow() {
            while dispatch_batch(&outbox, notifier.as_ref(), &broadcast_tx, &metrics).await > 0 {}
            break;
        }
    }

    info!("Dispatch task stopped");
}

/// Dispatch one batch. Returns how many events were taken off the outbox.
pub async fn dispatch_batch(
    outbox: &EventOutbox,
    notifier: &dyn Notifier,
    broadcast_tx: &broadcast::Sender<ExecutionEvent>,
    metrics: &SchedulerMetrics,
) -> usize {
    let batch = outbox.pop_batch(DISPATCH_BATCH);
    let count = batch.len();
    if count == 0 {
        return 0;
    }
    debug!(batch_size = count, "Dispatching execution events");

    for event in batch {
        match &event {
            ExecutionEvent::AlertRaised { intent } => {
                if let Err(e) = notifier.submit(intent).await {
                    metrics.inc_notification_failures();
                    error!(
                        error = %e,
                        indicator_id = intent.indicator_id,
                        intent_id = %intent.id,
                        "Failed to submit alert"
                    );
                }
            }
            // Suppressed intents never reach the notifier
            ExecutionEvent::AlertSuppressed { .. }
            | ExecutionEvent::ExecutionCompleted { .. }
            | ExecutionEvent::ExecutionFailed { .. } => {}
        }

        // Ignore send errors (no receivers connected)
        let _ = broadcast_tx.send(event);
    }

    count
}
