//! In-memory store and scripted data source with fault injection.
//!
//! Used by unit tests and available to downstream crates through the
//! `test-utils` feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::{AlertLog, DataSource, ExecutionHistory, IndicatorStore, Notifier};
use crate::error::{AppError, Result};
use crate::models::{
    AlertIntent, AlertLogEntry, DataSourceReading, ExecutionRecord, Indicator, ReadingRequest,
};

/// Indicator with sensible defaults for tests and benches
pub fn sample_indicator(id: i64) -> Indicator {
    Indicator {
        id,
        code: format!("IND-{id}"),
        name: format!("Indicator {id}"),
        frequency_minutes: 5,
        last_run: None,
        is_active: true,
        collector_id: 1,
        item_name: "failed_transactions".to_string(),
        last_minutes: 60,
        threshold_type: "count".to_string(),
        threshold_field: "value".to_string(),
        threshold_comparison: "gt".to_string(),
        threshold_value: Decimal::from(100),
        minimum_threshold: None,
        cooldown_minutes: 60,
        priority: 2,
        owner_contact_id: Some(1),
        is_currently_running: false,
        execution_start_time: None,
    }
}

#[derive(Default)]
struct Inner {
    indicators: BTreeMap<i64, Indicator>,
    executions: Vec<ExecutionRecord>,
    alerts: Vec<AlertLogEntry>,
    acquire_calls: HashMap<i64, u32>,
    release_calls: HashMap<i64, u32>,
    fail_selection: bool,
    fail_history: bool,
    fail_notify: bool,
    fail_alert_log: bool,
}

/// Store backed by a mutex-guarded map. Implements every persistence trait.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, indicator: Indicator) {
        self.inner.lock().indicators.insert(indicator.id, indicator);
    }

    pub fn indicator(&self, id: i64) -> Option<Indicator> {
        self.inner.lock().indicators.get(&id).cloned()
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.inner.lock().executions.clone()
    }

    pub fn alerts(&self) -> Vec<AlertLogEntry> {
        self.inner.lock().alerts.clone()
    }

    /// Seeds a delivered alert so the cooldown gate sees it
    pub fn record_alert(&self, indicator_id: i64, trigger_time: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        let id = inner.alerts.len() as i64 + 1;
        inner.alerts.push(AlertLogEntry {
            id,
            indicator_id,
            trigger_time,
            severity: crate::models::Severity::Warning,
            message: "seeded".to_string(),
        });
    }

    pub fn acquire_count(&self, id: i64) -> u32 {
        self.inner.lock().acquire_calls.get(&id).copied().unwrap_or(0)
    }

    pub fn release_count(&self, id: i64) -> u32 {
        self.inner.lock().release_calls.get(&id).copied().unwrap_or(0)
    }

    pub fn set_fail_selection(&self, fail: bool) {
        self.inner.lock().fail_selection = fail;
    }

    pub fn set_fail_history(&self, fail: bool) {
        self.inner.lock().fail_history = fail;
    }

    pub fn set_fail_notify(&self, fail: bool) {
        self.inner.lock().fail_notify = fail;
    }

    pub fn set_fail_alert_log(&self, fail: bool) {
        self.inner.lock().fail_alert_log = fail;
    }
}

#[async_trait]
impl IndicatorStore for MemoryStore {
    async fn due_candidates(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Indicator>> {
        let inner = self.inner.lock();
        if inner.fail_selection {
            return Err(AppError::DatabaseError("store unreachable".into()));
        }
        let mut due: Vec<Indicator> = inner
            .indicators
            .values()
            .filter(|ind| ind.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.last_run.cmp(&b.last_run).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn get_indicator(&self, id: i64) -> Result<Option<Indicator>> {
        Ok(self.indicator(id))
    }

    async fn try_acquire_running(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock();
        *inner.acquire_calls.entry(id).or_default() += 1;
        match inner.indicators.get_mut(&id) {
            Some(ind) if !ind.is_currently_running => {
                ind.is_currently_running = true;
                ind.execution_start_time = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_running(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        *inner.release_calls.entry(id).or_default() += 1;
        if let Some(ind) = inner.indicators.get_mut(&id) {
            ind.is_currently_running = false;
            ind.execution_start_time = None;
        }
        Ok(())
    }

    async fn update_last_run(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let ind = inner
            .indicators
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("indicator {id}")))?;
        ind.last_run = Some(ind.last_run.map_or(at, |prev| prev.max(at)));
        Ok(())
    }

    async fn running_indicators(&self) -> Result<Vec<Indicator>> {
        Ok(self
            .inner
            .lock()
            .indicators
            .values()
            .filter(|ind| ind.is_currently_running)
            .cloned()
            .collect())
    }

    async fn force_release(&self, id: i64, started_at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.indicators.get_mut(&id) {
            Some(ind)
                if ind.is_currently_running && ind.execution_start_time == Some(started_at) =>
            {
                ind.is_currently_running = false;
                ind.execution_start_time = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        if self.inner.lock().fail_selection {
            return Err(AppError::DatabaseError("store unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionHistory for MemoryStore {
    async fn append(&self, record: &ExecutionRecord) -> Result<i64> {
        let mut inner = self.inner.lock();
        if inner.fail_history {
            return Err(AppError::DatabaseError("history sink unavailable".into()));
        }
        let id = inner.executions.len() as i64 + 1;
        let mut stored = record.clone();
        stored.id = Some(id);
        inner.executions.push(stored);
        Ok(id)
    }

    async fn recent(&self, indicator_id: i64, limit: i64) -> Result<Vec<ExecutionRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .executions
            .iter()
            .rev()
            .filter(|r| r.indicator_id == indicator_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AlertLog for MemoryStore {
    async fn last_alert_time(&self, indicator_id: i64) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock();
        if inner.fail_alert_log {
            return Err(AppError::DatabaseError("alert log unavailable".into()));
        }
        Ok(inner
            .alerts
            .iter()
            .filter(|a| a.indicator_id == indicator_id)
            .map(|a| a.trigger_time)
            .max())
    }
}

#[async_trait]
impl Notifier for MemoryStore {
    async fn submit(&self, intent: &AlertIntent) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_notify {
            return Err(AppError::InternalError("notification channel down".into()));
        }
        let id = inner.alerts.len() as i64 + 1;
        inner.alerts.push(AlertLogEntry {
            id,
            indicator_id: intent.indicator_id,
            trigger_time: intent.triggered_at,
            severity: intent.severity,
            message: intent.summary(),
        });
        Ok(())
    }
}

/// Scripted response for one indicator
#[derive(Debug, Clone)]
pub enum Script {
    Reading(DataSourceReading),
    Fail(String),
    /// Sleeps before returning the reading
    Delay(Duration, DataSourceReading),
    Panic,
}

/// Data source that replays scripted responses per indicator
#[derive(Default)]
pub struct ScriptedDataSource {
    scripts: Mutex<HashMap<i64, Script>>,
    calls: Mutex<HashMap<i64, u32>>,
}

impl ScriptedDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, indicator_id: i64, script: Script) {
        self.scripts.lock().insert(indicator_id, script);
    }

    pub fn reading(&self, indicator_id: i64, current: Decimal, historical: Option<Decimal>) {
        self.script(
            indicator_id,
            Script::Reading(DataSourceReading {
                current_value: current,
                historical_value: historical,
                volume: None,
            }),
        );
    }

    pub fn calls(&self, indicator_id: i64) -> u32 {
        self.calls.lock().get(&indicator_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DataSource for ScriptedDataSource {
    async fn fetch(&self, request: &ReadingRequest) -> Result<DataSourceReading> {
        *self.calls.lock().entry(request.indicator_id).or_default() += 1;
        let script = self.scripts.lock().get(&request.indicator_id).cloned();
        match script {
            Some(Script::Reading(reading)) => Ok(reading),
            Some(Script::Fail(msg)) => Err(AppError::DataSourceError(msg)),
            Some(Script::Delay(delay, reading)) => {
                tokio::time::sleep(delay).await;
                Ok(reading)
            }
            Some(Script::Panic) => panic!("collector procedure crashed"),
            None => Err(AppError::DataSourceError(format!(
                "no script for indicator {}",
                request.indicator_id
            ))),
        }
    }
}
