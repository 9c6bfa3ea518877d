//! Boundaries the scheduler consumes: indicator store, data source,
//! execution history, alert log and notification delivery.

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{AlertIntent, DataSourceReading, ExecutionRecord, Indicator, ReadingRequest};

/// Persisted indicator definitions and their mutual-exclusion state.
///
/// The running flag must only be mutated through the execution guard.
#[async_trait]
pub trait IndicatorStore: Send + Sync {
    /// Candidates eligible at `now`, oldest `last_run` first, NULL first.
    async fn due_candidates(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Indicator>>;

    async fn get_indicator(&self, id: i64) -> Result<Option<Indicator>>;

    /// Atomic check-and-set of the running flag. Returns `false` when the
    /// indicator is already running or does not exist.
    async fn try_acquire_running(&self, id: i64, now: DateTime<Utc>) -> Result<bool>;

    async fn release_running(&self, id: i64) -> Result<()>;

    /// Never moves `last_run` backwards.
    async fn update_last_run(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Indicators currently flagged as running, for the stale-run reaper
    async fn running_indicators(&self) -> Result<Vec<Indicator>>;

    /// Clears the running flag only if `execution_start_time` still equals
    /// `started_at`. Returns whether a row was released.
    async fn force_release(&self, id: i64, started_at: DateTime<Utc>) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}

/// Executes a collector procedure and returns its reading
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(&self, request: &ReadingRequest) -> Result<DataSourceReading>;
}

/// Append-only execution history
#[async_trait]
pub trait ExecutionHistory: Send + Sync {
    /// Persists the record and returns its assigned id
    async fn append(&self, record: &ExecutionRecord) -> Result<i64>;

    async fn recent(&self, indicator_id: i64, limit: i64) -> Result<Vec<ExecutionRecord>>;
}

/// Read-only view of delivered alerts
#[async_trait]
pub trait AlertLog: Send + Sync {
    async fn last_alert_time(&self, indicator_id: i64) -> Result<Option<DateTime<Utc>>>;
}

/// Notification boundary. Failures are logged by the caller, never propagated
/// back into execution state.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn submit(&self, intent: &AlertIntent) -> Result<()>;
}
