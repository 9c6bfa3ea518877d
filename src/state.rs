//! Application state shared across handlers

use crate::buffer::EventOutbox;
use crate::metrics::SchedulerMetrics;
use crate::models::ExecutionEvent;
use crate::services::orchestrator::ExecutionOrchestrator;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Runs scheduled and manual executions
    pub orchestrator: ExecutionOrchestrator,
    /// Events waiting for the dispatch task
    pub outbox: EventOutbox,
    /// Fan-out of dispatched events to WebSocket subscribers
    pub broadcast_tx: broadcast::Sender<ExecutionEvent>,
    pub metrics: Arc<SchedulerMetrics>,
}

impl AppState {
    /// Create new application state
    ///
    /// # Arguments
    /// * `orchestrator` - Execution orchestrator, already wired to its stores
    /// * `outbox` - The outbox the orchestrator pushes events into
    /// * `metrics` - The collector the orchestrator reports to
    /// * `broadcast_capacity` - Capacity of the broadcast channel
    pub fn new(
        orchestrator: ExecutionOrchestrator,
        outbox: EventOutbox,
        metrics: Arc<SchedulerMetrics>,
        broadcast_capacity: usize,
    ) -> Self {
        let (broadcast_tx, _) = broadcast::channel(broadcast_capacity);
        Self {
            orchestrator,
            outbox,
            broadcast_tx,
            metrics,
        }
    }
}
