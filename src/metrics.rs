//! Scheduler metrics collector.
//!
//! One instance is created at startup and injected into the orchestrator and
//! background tasks; nothing here is process-global.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-indicator execution counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndicatorCounters {
    pub succeeded: u64,
    pub failed: u64,
    pub alerted: u64,
    pub suppressed: u64,
}

#[derive(Default)]
pub struct SchedulerMetrics {
    ticks_total: AtomicU64,
    tick_failures_total: AtomicU64,
    executions_total: AtomicU64,
    executions_failed_total: AtomicU64,
    executions_skipped_total: AtomicU64,
    alerts_emitted_total: AtomicU64,
    alerts_suppressed_total: AtomicU64,
    notifications_failed_total: AtomicU64,
    stale_runs_released_total: AtomicU64,
    ws_connections: AtomicU64,
    per_indicator: RwLock<BTreeMap<i64, IndicatorCounters>>,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ticks(&self) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tick_failures(&self) {
        self.tick_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.executions_skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, indicator_id: i64) {
        self.executions_total.fetch_add(1, Ordering::Relaxed);
        self.per_indicator.write().entry(indicator_id).or_default().succeeded += 1;
    }

    pub fn record_failure(&self, indicator_id: i64) {
        self.executions_total.fetch_add(1, Ordering::Relaxed);
        self.executions_failed_total.fetch_add(1, Ordering::Relaxed);
        self.per_indicator.write().entry(indicator_id).or_default().failed += 1;
    }

    pub fn record_alert(&self, indicator_id: i64) {
        self.alerts_emitted_total.fetch_add(1, Ordering::Relaxed);
        self.per_indicator.write().entry(indicator_id).or_default().alerted += 1;
    }

    pub fn record_suppressed(&self, indicator_id: i64) {
        self.alerts_suppressed_total.fetch_add(1, Ordering::Relaxed);
        self.per_indicator.write().entry(indicator_id).or_default().suppressed += 1;
    }

    pub fn inc_notification_failures(&self) {
        self.notifications_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale_released(&self, count: u64) {
        self.stale_runs_released_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_ws_connections(&self) {
        self.ws_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_ws_connections(&self) {
        self.ws_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn indicator(&self, indicator_id: i64) -> IndicatorCounters {
        self.per_indicator
            .read()
            .get(&indicator_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            tick_failures_total: self.tick_failures_total.load(Ordering::Relaxed),
            executions_total: self.executions_total.load(Ordering::Relaxed),
            executions_failed_total: self.executions_failed_total.load(Ordering::Relaxed),
            executions_skipped_total: self.executions_skipped_total.load(Ordering::Relaxed),
            alerts_emitted_total: self.alerts_emitted_total.load(Ordering::Relaxed),
            alerts_suppressed_total: self.alerts_suppressed_total.load(Ordering::Relaxed),
            notifications_failed_total: self.notifications_failed_total.load(Ordering::Relaxed),
            stale_runs_released_total: self.stale_runs_released_total.load(Ordering::Relaxed),
            ws_connections: self.ws_connections.load(Ordering::Relaxed),
            per_indicator: self
                .per_indicator
                .read()
                .iter()
                .map(|(id, c)| (*id, *c))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub ticks_total: u64,
    pub tick_failures_total: u64,
    pub executions_total: u64,
    pub executions_failed_total: u64,
    pub executions_skipped_total: u64,
    pub alerts_emitted_total: u64,
    pub alerts_suppressed_total: u64,
    pub notifications_failed_total: u64,
    pub stale_runs_released_total: u64,
    pub ws_connections: u64,
    pub per_indicator: Vec<(i64, IndicatorCounters)>,
}
