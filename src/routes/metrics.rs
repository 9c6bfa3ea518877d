//! Prometheus metrics endpoint

use axum::{extract::State, response::IntoResponse};
use std::fmt::Write;

use crate::state::AppState;

/// GET /metrics
///
/// Returns Prometheus-format metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    let outbox_len = state.outbox.len() as u64;
    let outbox_dropped = state.outbox.dropped();
    let outbox_dropped_alerts = state.outbox.dropped_alerts();
    let in_flight = state.orchestrator.guard().in_flight_count() as u64;

    let mut output = format!(
        r#"# HELP indicator_scheduler_ticks_total Scheduler ticks started
# TYPE indicator_scheduler_ticks_total counter
indicator_scheduler_ticks_total {}

# HELP indicator_scheduler_tick_failures_total Ticks aborted by a selection error
# TYPE indicator_scheduler_tick_failures_total counter
indicator_scheduler_tick_failures_total {}

# HELP indicator_scheduler_executions_total Executions that acquired the guard
# TYPE indicator_scheduler_executions_total counter
indicator_scheduler_executions_total {}

# HELP indicator_scheduler_executions_failed_total Executions that ended in failure
# TYPE indicator_scheduler_executions_failed_total counter
indicator_scheduler_executions_failed_total {}

# HELP indicator_scheduler_executions_skipped_total Acquire attempts lost to a running execution
# TYPE indicator_scheduler_executions_skipped_total counter
indicator_scheduler_executions_skipped_total {}

# HELP indicator_scheduler_alerts_emitted_total Alert intents emitted
# TYPE indicator_scheduler_alerts_emitted_total counter
indicator_scheduler_alerts_emitted_total {}

# HELP indicator_scheduler_alerts_suppressed_total Breaches held back by cooldown
# TYPE indicator_scheduler_alerts_suppressed_total counter
indicator_scheduler_alerts_suppressed_total {}

# HELP indicator_scheduler_notifications_failed_total Alert submissions that failed
# TYPE indicator_scheduler_notifications_failed_total counter
indicator_scheduler_notifications_failed_total {}

# HELP indicator_scheduler_events_dropped_total Events dropped because the outbox was full
# TYPE indicator_scheduler_events_dropped_total counter
indicator_scheduler_events_dropped_total {}

# HELP indicator_scheduler_alerts_dropped_total Alert intents dropped because the outbox was full
# TYPE indicator_scheduler_alerts_dropped_total counter
indicator_scheduler_alerts_dropped_total {}

# HELP indicator_scheduler_stale_runs_released_total Running flags force-released by the reaper
# TYPE indicator_scheduler_stale_runs_released_total counter
indicator_scheduler_stale_runs_released_total {}

# HELP indicator_scheduler_in_flight Executions currently held by this process
# TYPE indicator_scheduler_in_flight gauge
indicator_scheduler_in_flight {}

# HELP indicator_scheduler_outbox_depth Events waiting for dispatch
# TYPE indicator_scheduler_outbox_depth gauge
indicator_scheduler_outbox_depth {}

# HELP indicator_scheduler_websocket_connections Current number of active WebSocket connections
# TYPE indicator_scheduler_websocket_connections gauge
indicator_scheduler_websocket_connections {}

# HELP indicator_scheduler_info Build information
# TYPE indicator_scheduler_info gauge
indicator_scheduler_info{{version="{}"}} 1
"#,
        snapshot.ticks_total,
        snapshot.tick_failures_total,
        snapshot.executions_total,
        snapshot.executions_failed_total,
        snapshot.executions_skipped_total,
        snapshot.alerts_emitted_total,
        snapshot.alerts_suppressed_total,
        snapshot.notifications_failed_total,
        outbox_dropped,
        outbox_dropped_alerts,
        snapshot.stale_runs_released_total,
        in_flight,
        outbox_len,
        snapshot.ws_connections,
        env!("CARGO_PKG_VERSION"),
    );

    if !snapshot.per_indicator.is_empty() {
        output.push_str(
            "\n# HELP indicator_scheduler_indicator_executions_total Executions per indicator and outcome\n\
             # TYPE indicator_scheduler_indicator_executions_total counter\n",
        );
        for (id, counters) in &snapshot.per_indicator {
            for (outcome, value) in [
                ("succeeded", counters.succeeded),
                ("failed", counters.failed),
                ("alerted", counters.alerted),
                ("suppressed", counters.suppressed),
            ] {
                // writing to a String cannot fail
                let _ = writeln!(
                    output,
                    "indicator_scheduler_indicator_executions_total{{indicator_id=\"{id}\",outcome=\"{outcome}\"}} {value}"
                );
            }
        }
    }

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        output,
    )
}
