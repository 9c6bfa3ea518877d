//! Execution orchestrator.
//!
//! Per execution: `Selected -> Acquiring -> Running -> Evaluating ->
//! (Clean | Suppressed | Alerted) -> Recorded -> Released`, or
//! `Failed -> Recorded -> Released` from any stage after acquisition.
//! A record is written for every acquired execution and the guard is
//! released on every path. `last_run` only moves when evaluation completed.

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cooldown::CooldownGate;
use super::evaluator::{evaluate, parse_priority, parse_rule, Evaluation};
use super::guard::ExecutionGuard;
use super::selection::select_due;
use crate::buffer::EventOutbox;
use crate::error::{AppError, Result};
use crate::metrics::SchedulerMetrics;
use crate::models::{
    AlertIntent, DataSourceReading, ExecutionContext, ExecutionEvent, ExecutionRecord, Indicator,
};
use crate::store::{AlertLog, DataSource, ExecutionHistory, IndicatorStore};

/// Lifecycle stage of one execution, used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStage {
    Selected,
    Acquiring,
    Running,
    Evaluating,
    Clean,
    Suppressed,
    Alerted,
    Failed,
    Recorded,
    Released,
}

impl ExecutionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Selected => "selected",
            Self::Acquiring => "acquiring",
            Self::Running => "running",
            Self::Evaluating => "evaluating",
            Self::Clean => "clean",
            Self::Suppressed => "suppressed",
            Self::Alerted => "alerted",
            Self::Failed => "failed",
            Self::Recorded => "recorded",
            Self::Released => "released",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub batch_size: usize,
    pub max_parallel_executions: usize,
    pub fetch_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_parallel_executions: 4,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Record of one execution plus the events it emitted
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub record: ExecutionRecord,
    pub events: Vec<ExecutionEvent>,
}

/// Counts for one scheduler tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub selected: usize,
    pub executed: usize,
    /// Lost the acquire race
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub alerted: usize,
    pub suppressed: usize,
    /// Acquire errors and tasks that died before producing an outcome
    pub aborted: usize,
}

impl TickSummary {
    fn absorb(&mut self, outcome: &ExecutionOutcome) {
        self.executed += 1;
        if outcome.record.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        for event in &outcome.events {
            match event {
                ExecutionEvent::AlertRaised { .. } => self.alerted += 1,
                ExecutionEvent::AlertSuppressed { .. } => self.suppressed += 1,
                ExecutionEvent::ExecutionCompleted { .. } | ExecutionEvent::ExecutionFailed { .. } => {}
            }
        }
    }
}

enum Verdict {
    Clean,
    Alerted(AlertIntent),
    Suppressed(AlertIntent),
}

struct Evaluated {
    reading: DataSourceReading,
    evaluation: Evaluation,
    verdict: Verdict,
}

struct StageFailure {
    stage: ExecutionStage,
    error: AppError,
    reading: Option<DataSourceReading>,
}

#[derive(Clone)]
pub struct ExecutionOrchestrator {
    store: Arc<dyn IndicatorStore>,
    data_source: Arc<dyn DataSource>,
    history: Arc<dyn ExecutionHistory>,
    guard: ExecutionGuard,
    cooldown: CooldownGate,
    outbox: EventOutbox,
    metrics: Arc<SchedulerMetrics>,
    config: OrchestratorConfig,
    shutdown: watch::Receiver<bool>,
}

impl ExecutionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn IndicatorStore>,
        data_source: Arc<dyn DataSource>,
        history: Arc<dyn ExecutionHistory>,
        alert_log: Arc<dyn AlertLog>,
        outbox: EventOutbox,
        metrics: Arc<SchedulerMetrics>,
        config: OrchestratorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            guard: ExecutionGuard::new(Arc::clone(&store)),
            cooldown: CooldownGate::new(alert_log),
            store,
            data_source,
            history,
            outbox,
            metrics,
            config,
            shutdown,
        }
    }

    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    pub fn store(&self) -> &Arc<dyn IndicatorStore> {
        &self.store
    }

    pub fn history(&self) -> &Arc<dyn ExecutionHistory> {
        &self.history
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One scheduler pass: select due indicators and execute them with
    /// bounded parallelism. A selection error aborts the tick.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        if self.is_shutting_down() {
            return Ok(TickSummary::default());
        }
        self.metrics.inc_ticks();

        let due = match select_due(self.store.as_ref(), now, self.config.batch_size).await {
            Ok(due) => due,
            Err(e) => {
                self.metrics.inc_tick_failures();
                return Err(e);
            }
        };

        let mut summary = TickSummary {
            selected: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_executions.max(1)));
        let mut handles = Vec::with_capacity(due.len());

        for indicator in due {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::InternalError(e.to_string()))?;
            // checked after the permit: waiting for one may have spanned a shutdown
            if self.is_shutting_down() {
                info!("Shutdown requested, not launching remaining executions");
                break;
            }
            let indicator_id = indicator.id;
            debug!(indicator_id, stage = ExecutionStage::Selected.as_str(), "Execution scheduled");

            let this = self.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                this.execute(indicator, ExecutionContext::Scheduled, now).await
            });
            handles.push((indicator_id, handle));
        }

        for (indicator_id, handle) in handles {
            match handle.await {
                Ok(Ok(Some(outcome))) => summary.absorb(&outcome),
                Ok(Ok(None)) => summary.skipped += 1,
                Ok(Err(e)) => {
                    error!(error = %e, indicator_id, "Failed to acquire execution guard");
                    summary.aborted += 1;
                }
                Err(e) => {
                    error!(error = %e, indicator_id, "Execution task died");
                    summary.aborted += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Run an indicator on demand, outside its schedule.
    ///
    /// Fails with `Conflict` if the indicator is already running. The run
    /// itself is detached: dropping the returned future does not cancel it,
    /// so it still records and releases.
    pub async fn execute_now(&self, indicator_id: i64) -> Result<ExecutionRecord> {
        self.execute_now_at(indicator_id, Utc::now()).await
    }

    pub async fn execute_now_at(&self, indicator_id: i64, now: DateTime<Utc>) -> Result<ExecutionRecord> {
        if self.is_shutting_down() {
            return Err(AppError::Cancelled("scheduler is shutting down".into()));
        }

        let indicator = self
            .store
            .get_indicator(indicator_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("indicator {indicator_id}")))?;

        let this = self.clone();
        let outcome = tokio::spawn(async move {
            this.execute(indicator, ExecutionContext::Manual, now).await
        })
        .await
        .map_err(|e| AppError::InternalError(format!("execution task failed: {e}")))??;

        match outcome {
            Some(outcome) => Ok(outcome.record),
            None => Err(AppError::Conflict(format!(
                "indicator {indicator_id} is already running"
            ))),
        }
    }

    /// Acquire, run, record, release. `Ok(None)` when the guard was held.
    async fn execute(
        &self,
        indicator: Indicator,
        context: ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionOutcome>> {
        let indicator_id = indicator.id;
        debug!(indicator_id, stage = ExecutionStage::Acquiring.as_str(), "Acquiring execution guard");

        let Some(lease) = self.guard.try_acquire(indicator_id, now).await? else {
            self.metrics.inc_skipped();
            return Ok(None);
        };

        let started = Instant::now();
        let pipeline = AssertUnwindSafe(self.run_pipeline(&indicator, now))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(StageFailure {
                    stage: ExecutionStage::Failed,
                    error: AppError::InternalError(format!(
                        "execution panicked: {}",
                        panic_message(panic.as_ref())
                    )),
                    reading: None,
                })
            });
        let duration_ms = started.elapsed().as_millis() as i64;

        let (mut record, alert_event) = match pipeline {
            Ok(evaluated) => self.success_record(&indicator, context, now, duration_ms, evaluated),
            Err(failure) => {
                warn!(
                    indicator_id,
                    stage = failure.stage.as_str(),
                    context = context.as_str(),
                    error = %failure.error,
                    "Indicator execution failed"
                );
                (failure_record(indicator_id, context, now, duration_ms, failure), None)
            }
        };

        match self.history.append(&record).await {
            Ok(id) => record.id = Some(id),
            Err(e) => error!(error = %e, indicator_id, "Failed to write execution record"),
        }
        if record.success {
            if let Err(e) = self.store.update_last_run(indicator_id, now).await {
                error!(error = %e, indicator_id, "Failed to update last run");
            }
        }
        debug!(indicator_id, stage = ExecutionStage::Recorded.as_str(), "Execution recorded");

        lease.release().await;
        debug!(indicator_id, stage = ExecutionStage::Released.as_str(), "Execution released");

        let mut events = Vec::with_capacity(2);
        if record.success {
            self.metrics.record_success(indicator_id);
            events.push(ExecutionEvent::ExecutionCompleted {
                record: record.clone(),
            });
        } else {
            self.metrics.record_failure(indicator_id);
            events.push(ExecutionEvent::ExecutionFailed {
                record: record.clone(),
            });
        }
        if let Some(event) = alert_event {
            match &event {
                ExecutionEvent::AlertRaised { .. } => self.metrics.record_alert(indicator_id),
                ExecutionEvent::AlertSuppressed { .. } => self.metrics.record_suppressed(indicator_id),
                _ => {}
            }
            events.push(event);
        }
        self.emit(&events);

        Ok(Some(ExecutionOutcome { record, events }))
    }

    async fn run_pipeline(
        &self,
        indicator: &Indicator,
        now: DateTime<Utc>,
    ) -> std::result::Result<Evaluated, StageFailure> {
        debug!(indicator_id = indicator.id, stage = ExecutionStage::Running.as_str(), "Fetching reading");
        let reading = self.fetch_reading(indicator).await.map_err(|error| StageFailure {
            stage: ExecutionStage::Running,
            error,
            reading: None,
        })?;

        debug!(indicator_id = indicator.id, stage = ExecutionStage::Evaluating.as_str(), "Evaluating reading");
        let parsed = parse_rule(indicator).and_then(|rule| Ok((rule, parse_priority(indicator)?)));
        let (rule, priority) = match parsed {
            Ok(parsed) => parsed,
            Err(error) => {
                return Err(StageFailure {
                    stage: ExecutionStage::Evaluating,
                    error,
                    reading: Some(reading),
                })
            }
        };

        let evaluation = match evaluate(
            reading.current_value,
            reading.historical_value,
            reading.volume,
            &rule,
        ) {
            Ok(evaluation) => evaluation,
            Err(error) => {
                return Err(StageFailure {
                    stage: ExecutionStage::Evaluating,
                    error,
                    reading: Some(reading),
                })
            }
        };

        let verdict = if !evaluation.breached {
            if evaluation.below_minimum {
                debug!(indicator_id = indicator.id, "Reading below minimum threshold, breach ignored");
            }
            Verdict::Clean
        } else {
            let suppressed = self
                .cooldown
                .should_suppress(indicator.id, now, indicator.cooldown_minutes)
                .await;
            let intent = AlertIntent {
                id: Uuid::new_v4(),
                indicator_id: indicator.id,
                indicator_code: indicator.code.clone(),
                current_value: reading.current_value,
                historical_value: reading.historical_value,
                deviation_percent: evaluation.deviation_percent,
                threshold_value: rule.value,
                comparison: rule.comparison,
                severity: priority.severity(),
                owner_contact_id: indicator.owner_contact_id,
                suppressed,
                triggered_at: now,
            };
            if suppressed {
                Verdict::Suppressed(intent)
            } else {
                self.cooldown.note_raised(indicator.id, now);
                Verdict::Alerted(intent)
            }
        };

        Ok(Evaluated {
            reading,
            evaluation,
            verdict,
        })
    }

    /// Data source call bounded by the fetch timeout and the shutdown signal
    async fn fetch_reading(&self, indicator: &Indicator) -> Result<DataSourceReading> {
        let timeout = self.config.fetch_timeout;
        let request = indicator.reading_request(timeout);
        let mut shutdown = self.shutdown.clone();

        tokio::select! {
            result = tokio::time::timeout(timeout, self.data_source.fetch(&request)) => {
                match result {
                    Ok(reading) => reading,
                    Err(_) => Err(AppError::Timeout(timeout.as_millis() as u64)),
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                Err(AppError::Cancelled("shutdown requested during fetch".into()))
            }
        }
    }

    fn success_record(
        &self,
        indicator: &Indicator,
        context: ExecutionContext,
        now: DateTime<Utc>,
        duration_ms: i64,
        evaluated: Evaluated,
    ) -> (ExecutionRecord, Option<ExecutionEvent>) {
        let Evaluated {
            reading,
            evaluation,
            verdict,
        } = evaluated;

        let (stage, alert_suppressed, event) = match verdict {
            Verdict::Clean => (ExecutionStage::Clean, false, None),
            Verdict::Suppressed(intent) => (
                ExecutionStage::Suppressed,
                true,
                Some(ExecutionEvent::AlertSuppressed { intent }),
            ),
            Verdict::Alerted(intent) => (
                ExecutionStage::Alerted,
                false,
                Some(ExecutionEvent::AlertRaised { intent }),
            ),
        };

        info!(
            indicator_id = indicator.id,
            code = %indicator.code,
            stage = stage.as_str(),
            context = context.as_str(),
            current = %reading.current_value,
            deviation = ?evaluation.deviation_percent,
            duration_ms,
            "Indicator evaluated"
        );

        let record = ExecutionRecord {
            id: None,
            indicator_id: indicator.id,
            executed_at: now,
            duration_ms,
            success: true,
            current_value: Some(reading.current_value),
            historical_value: reading.historical_value,
            deviation_percent: evaluation.deviation_percent,
            should_alert: evaluation.breached,
            alert_suppressed,
            error_message: None,
            execution_context: context,
        };
        (record, event)
    }

    fn emit(&self, events: &[ExecutionEvent]) {
        for event in events {
            if self.outbox.try_push(event.clone()).is_err() {
                warn!(indicator_id = event.indicator_id(), "Event outbox full, event dropped");
            }
        }
    }
}

fn failure_record(
    indicator_id: i64,
    context: ExecutionContext,
    now: DateTime<Utc>,
    duration_ms: i64,
    failure: StageFailure,
) -> ExecutionRecord {
    ExecutionRecord {
        id: None,
        indicator_id,
        executed_at: now,
        duration_ms,
        success: false,
        current_value: failure.reading.as_ref().map(|r| r.current_value),
        historical_value: failure.reading.as_ref().and_then(|r| r.historical_value),
        deviation_percent: None,
        should_alert: false,
        alert_suppressed: false,
        error_message: Some(failure.error.to_string()),
        execution_context: context,
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // sender gone: no shutdown will ever be signalled
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReadingRequest;
    use crate::store::memory::{sample_indicator, MemoryStore, Script, ScriptedDataSource};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        store: Arc<MemoryStore>,
        source: Arc<ScriptedDataSource>,
        outbox: EventOutbox,
        metrics: Arc<SchedulerMetrics>,
        orchestrator: ExecutionOrchestrator,
        shutdown_tx: watch::Sender<bool>,
    }

    fn harness_with(
        config: OrchestratorConfig,
        data_source: Arc<dyn DataSource>,
        scripted: Arc<ScriptedDataSource>,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let outbox = EventOutbox::new(1024);
        let metrics = Arc::new(SchedulerMetrics::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let orchestrator = ExecutionOrchestrator::new(
            store.clone(),
            data_source,
            store.clone(),
            store.clone(),
            outbox.clone(),
            metrics.clone(),
            config,
            shutdown_rx,
        );
        Harness {
            store,
            source: scripted,
            outbox,
            metrics,
            orchestrator,
            shutdown_tx,
        }
    }

    fn harness(config: OrchestratorConfig) -> Harness {
        let scripted = Arc::new(ScriptedDataSource::new());
        harness_with(config, scripted.clone(), scripted)
    }

    fn quick_config() -> OrchestratorConfig {
        OrchestratorConfig {
            batch_size: 10,
            max_parallel_executions: 4,
            fetch_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_breach_alerts() {
        let h = harness(quick_config());
        let now = Utc::now();
        let mut ind = sample_indicator(1);
        ind.frequency_minutes = 5;
        ind.last_run = Some(now - ChronoDuration::minutes(10));
        ind.threshold_comparison = "gt".into();
        ind.threshold_value = dec!(100);
        ind.cooldown_minutes = 60;
        h.store.insert(ind);
        h.source.reading(1, dec!(150), Some(dec!(100)));

        let summary = h.orchestrator.run_tick(now).await.unwrap();
        assert_eq!(summary.selected, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.alerted, 1);
        assert_eq!(summary.suppressed, 0);

        let records = h.store.executions();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.success);
        assert!(record.should_alert);
        assert!(!record.alert_suppressed);
        assert_eq!(record.deviation_percent, Some(dec!(50)));
        assert_eq!(record.execution_context, ExecutionContext::Scheduled);

        let events = h.outbox.pop_batch(10);
        let intents: Vec<&AlertIntent> = events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::AlertRaised { intent } => Some(intent),
                _ => None,
            })
            .collect();
        assert_eq!(intents.len(), 1);
        assert!(!intents[0].suppressed);
        assert_eq!(intents[0].deviation_percent, Some(dec!(50)));

        let ind = h.store.indicator(1).unwrap();
        assert_eq!(ind.last_run, Some(now));
        assert!(!ind.is_currently_running);
        assert_eq!(h.store.release_count(1), 1);
        assert_eq!(h.orchestrator.guard().in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_clean_run_advances_schedule_without_alert() {
        let h = harness(quick_config());
        let now = Utc::now();
        h.store.insert(sample_indicator(1));
        h.source.reading(1, dec!(80), Some(dec!(100)));

        let summary = h.orchestrator.run_tick(now).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.alerted, 0);

        let record = &h.store.executions()[0];
        assert!(record.success);
        assert!(!record.should_alert);
        assert_eq!(record.deviation_percent, Some(dec!(20)));
        assert_eq!(h.store.indicator(1).unwrap().last_run, Some(now));

        let events = h.outbox.pop_batch(10);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ExecutionEvent::ExecutionCompleted { .. }));
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_schedule() {
        let h = harness(quick_config());
        let now = Utc::now();
        let mut ind = sample_indicator(1);
        let previous = now - ChronoDuration::minutes(30);
        ind.last_run = Some(previous);
        h.store.insert(ind);
        h.source.script(1, Script::Fail("procedure missing".into()));

        let summary = h.orchestrator.run_tick(now).await.unwrap();
        assert_eq!(summary.failed, 1);

        let record = &h.store.executions()[0];
        assert!(!record.success);
        assert!(record.error_message.as_deref().unwrap().contains("procedure missing"));
        assert_eq!(h.store.indicator(1).unwrap().last_run, Some(previous));

        // still due right away
        let due = select_due(h.store.as_ref(), now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, 1);
    }

    #[tokio::test]
    async fn test_timeout_records_failure() {
        let h = harness(OrchestratorConfig {
            fetch_timeout: Duration::from_millis(30),
            ..quick_config()
        });
        h.store.insert(sample_indicator(1));
        h.source.script(
            1,
            Script::Delay(
                Duration::from_secs(5),
                DataSourceReading {
                    current_value: dec!(1),
                    historical_value: None,
                    volume: None,
                },
            ),
        );

        h.orchestrator.run_tick(Utc::now()).await.unwrap();

        let record = &h.store.executions()[0];
        assert!(!record.success);
        assert_eq!(record.error_message.as_deref(), Some("Timed out after 30ms"));
        assert_eq!(h.store.indicator(1).unwrap().last_run, None);
        assert_eq!(h.store.release_count(1), 1);
    }

    #[tokio::test]
    async fn test_malformed_rule_records_failure_with_reading() {
        let h = harness(quick_config());
        let mut ind = sample_indicator(1);
        ind.threshold_comparison = "roughly".into();
        h.store.insert(ind);
        h.source.reading(1, dec!(150), Some(dec!(100)));

        h.orchestrator.run_tick(Utc::now()).await.unwrap();

        let record = &h.store.executions()[0];
        assert!(!record.success);
        assert_eq!(record.current_value, Some(dec!(150)));
        assert!(record
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("Evaluation error"));
        assert_eq!(h.store.indicator(1).unwrap().last_run, None);
        assert_eq!(h.store.release_count(1), 1);
    }

    #[tokio::test]
    async fn test_always_released_under_faults() {
        let h = harness(quick_config());
        let ok = DataSourceReading {
            current_value: dec!(150),
            historical_value: Some(dec!(100)),
            volume: None,
        };
        for id in 1..=5 {
            h.store.insert(sample_indicator(id));
        }
        h.source.script(1, Script::Reading(ok.clone()));
        h.source.script(2, Script::Fail("network".into()));
        h.source.script(3, Script::Delay(Duration::from_secs(5), ok.clone()));
        h.source.script(4, Script::Panic);
        let mut broken = sample_indicator(5);
        broken.priority = 9;
        h.store.insert(broken);
        h.source.script(5, Script::Reading(ok));

        let summary = h.orchestrator.run_tick(Utc::now()).await.unwrap();
        assert_eq!(summary.executed, 5);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 4);
        assert_eq!(summary.aborted, 0);

        for id in 1..=5 {
            assert_eq!(h.store.acquire_count(id), 1, "indicator {id}");
            assert_eq!(h.store.release_count(id), 1, "indicator {id}");
            assert!(!h.store.indicator(id).unwrap().is_currently_running);
        }
        assert_eq!(h.store.executions().len(), 5);
        assert_eq!(h.orchestrator.guard().in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_panic_becomes_failure_record() {
        let h = harness(quick_config());
        h.store.insert(sample_indicator(1));
        h.source.script(1, Script::Panic);

        h.orchestrator.run_tick(Utc::now()).await.unwrap();

        let record = &h.store.executions()[0];
        assert!(!record.success);
        assert!(record
            .error_message
            .as_deref()
            .unwrap()
            .contains("collector procedure crashed"));
        assert_eq!(h.store.release_count(1), 1);
    }

    #[tokio::test]
    async fn test_history_failure_still_releases() {
        let h = harness(quick_config());
        let now = Utc::now();
        h.store.insert(sample_indicator(1));
        h.source.reading(1, dec!(10), None);
        h.store.set_fail_history(true);

        let summary = h.orchestrator.run_tick(now).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(h.store.executions().is_empty());
        assert_eq!(h.store.release_count(1), 1);
        assert_eq!(h.store.indicator(1).unwrap().last_run, Some(now));

        let events = h.outbox.pop_batch(10);
        match &events[0] {
            ExecutionEvent::ExecutionCompleted { record } => assert_eq!(record.id, None),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_breach_inside_cooldown_is_suppressed() {
        let h = harness(quick_config());
        let now = Utc::now();
        h.store.insert(sample_indicator(1));
        h.store.record_alert(1, now - ChronoDuration::minutes(10));
        h.source.reading(1, dec!(150), Some(dec!(100)));

        let summary = h.orchestrator.run_tick(now).await.unwrap();
        assert_eq!(summary.suppressed, 1);
        assert_eq!(summary.alerted, 0);

        let record = &h.store.executions()[0];
        assert!(record.success);
        assert!(record.should_alert);
        assert!(record.alert_suppressed);

        let events = h.outbox.pop_batch(10);
        assert!(events
            .iter()
            .all(|e| !matches!(e, ExecutionEvent::AlertRaised { .. })));
        let suppressed = events.iter().find_map(|e| match e {
            ExecutionEvent::AlertSuppressed { intent } => Some(intent),
            _ => None,
        });
        assert!(suppressed.unwrap().suppressed);
        assert_eq!(h.metrics.indicator(1).suppressed, 1);
    }

    #[tokio::test]
    async fn test_minimum_threshold_prevents_alert() {
        let h = harness(quick_config());
        let mut ind = sample_indicator(1);
        ind.threshold_value = dec!(1);
        ind.minimum_threshold = Some(dec!(10));
        h.store.insert(ind);
        h.source.reading(1, dec!(5), Some(dec!(1)));

        let summary = h.orchestrator.run_tick(Utc::now()).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.alerted, 0);
        assert!(!h.store.executions()[0].should_alert);
    }

    #[tokio::test]
    async fn test_selection_error_aborts_tick() {
        let h = harness(quick_config());
        h.store.insert(sample_indicator(1));
        h.store.set_fail_selection(true);

        assert!(h.orchestrator.run_tick(Utc::now()).await.is_err());
        assert_eq!(h.store.acquire_count(1), 0);
        assert_eq!(h.metrics.snapshot().tick_failures_total, 1);
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let h = harness(quick_config());
        let now = Utc::now();
        let mut ind = sample_indicator(1);
        // recently run and inactive: manual runs ignore the schedule
        ind.last_run = Some(now - ChronoDuration::minutes(1));
        ind.is_active = false;
        h.store.insert(ind);
        h.source.reading(1, dec!(3), None);

        let record = h.orchestrator.execute_now_at(1, now).await.unwrap();
        assert!(record.success);
        assert_eq!(record.execution_context, ExecutionContext::Manual);
        assert_eq!(record.id, Some(1));
        assert_eq!(h.store.release_count(1), 1);
    }

    #[tokio::test]
    async fn test_manual_trigger_while_running_conflicts() {
        let h = harness(quick_config());
        h.store.insert(sample_indicator(1));
        h.store.try_acquire_running(1, Utc::now()).await.unwrap();

        let err = h.orchestrator.execute_now(1).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(h.source.calls(1), 0);
        assert!(h.store.executions().is_empty());
    }

    #[tokio::test]
    async fn test_manual_trigger_unknown_indicator() {
        let h = harness(quick_config());
        let err = h.orchestrator.execute_now(99).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_inflight_fetch() {
        let h = harness(OrchestratorConfig {
            fetch_timeout: Duration::from_secs(30),
            ..quick_config()
        });
        h.store.insert(sample_indicator(1));
        h.source.script(
            1,
            Script::Delay(
                Duration::from_secs(30),
                DataSourceReading {
                    current_value: dec!(1),
                    historical_value: None,
                    volume: None,
                },
            ),
        );

        let orchestrator = h.orchestrator.clone();
        let tick = tokio::spawn(async move { orchestrator.run_tick(Utc::now()).await });
        while h.source.calls(1) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.shutdown_tx.send(true).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), tick)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.failed, 1);
        let record = &h.store.executions()[0];
        assert!(record.error_message.as_deref().unwrap().starts_with("Cancelled"));
        assert_eq!(h.store.release_count(1), 1);

        // no further ticks after shutdown
        let summary = h.orchestrator.run_tick(Utc::now()).await.unwrap();
        assert_eq!(summary, TickSummary::default());
    }

    fn slow_reading(delay: Duration) -> Script {
        Script::Delay(
            delay,
            DataSourceReading {
                current_value: dec!(1),
                historical_value: None,
                volume: None,
            },
        )
    }

    #[tokio::test]
    async fn test_dropped_manual_caller_still_records() {
        let h = harness(quick_config());
        h.store.insert(sample_indicator(1));
        h.source.script(1, slow_reading(Duration::from_secs(5)));

        // caller gives up while the fetch is still pending
        let attempt =
            tokio::time::timeout(Duration::from_millis(50), h.orchestrator.execute_now(1)).await;
        assert!(attempt.is_err());

        // the detached run hits the fetch timeout, records and releases
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.store.executions().is_empty() || h.store.release_count(1) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let records = h.store.executions();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].execution_context, ExecutionContext::Manual);
        assert_eq!(h.store.acquire_count(1), 1);
        assert_eq!(h.store.release_count(1), 1);
        assert!(!h.store.indicator(1).unwrap().is_currently_running);
    }

    #[tokio::test]
    async fn test_no_launch_after_shutdown_while_waiting_for_permit() {
        let h = harness(OrchestratorConfig {
            max_parallel_executions: 1,
            fetch_timeout: Duration::from_secs(30),
            ..quick_config()
        });
        h.store.insert(sample_indicator(1));
        h.store.insert(sample_indicator(2));
        h.source.script(1, slow_reading(Duration::from_secs(30)));
        h.source.reading(2, dec!(1), None);

        let orchestrator = h.orchestrator.clone();
        let tick = tokio::spawn(async move { orchestrator.run_tick(Utc::now()).await });
        while h.source.calls(1) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.shutdown_tx.send(true).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), tick)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.selected, 2);
        assert_eq!(summary.executed, 1);
        assert_eq!(summary.failed, 1);

        // indicator 2 was waiting for the permit and never started
        assert_eq!(h.store.acquire_count(2), 0);
        assert_eq!(h.source.calls(2), 0);
        let records = h.store.executions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].indicator_id, 1);
    }

    #[tokio::test]
    async fn test_deviation_overflow_records_evaluation_failure() {
        let h = harness(quick_config());
        h.store.insert(sample_indicator(1));
        h.source.reading(1, Decimal::MAX, Some(dec!(-1)));

        let summary = h.orchestrator.run_tick(Utc::now()).await.unwrap();
        assert_eq!(summary.failed, 1);

        let record = &h.store.executions()[0];
        assert!(!record.success);
        assert_eq!(record.current_value, Some(Decimal::MAX));
        let message = record.error_message.as_deref().unwrap();
        assert!(message.starts_with("Evaluation error"), "{message}");
        assert!(!message.contains("panicked"));
        assert_eq!(h.store.indicator(1).unwrap().last_run, None);
        assert_eq!(h.store.release_count(1), 1);
    }

    #[tokio::test]
    async fn test_last_run_never_moves_backwards() {
        let h = harness(quick_config());
        let now = Utc::now();
        h.store.insert(sample_indicator(1));
        h.source.reading(1, dec!(1), None);

        h.orchestrator.run_tick(now).await.unwrap();
        assert_eq!(h.store.indicator(1).unwrap().last_run, Some(now));

        // a completed run stamped earlier than the last one
        let record = h
            .orchestrator
            .execute_now_at(1, now - ChronoDuration::minutes(10))
            .await
            .unwrap();
        assert!(record.success);
        assert_eq!(h.store.indicator(1).unwrap().last_run, Some(now));

        let later = now + ChronoDuration::minutes(5);
        h.orchestrator.execute_now_at(1, later).await.unwrap();
        assert_eq!(h.store.indicator(1).unwrap().last_run, Some(later));
    }

    #[tokio::test]
    async fn test_back_to_back_alerts_suppressed_before_dispatch() {
        let h = harness(quick_config());
        let now = Utc::now();
        h.store.insert(sample_indicator(1));
        h.source.reading(1, dec!(150), Some(dec!(100)));

        let first = h.orchestrator.execute_now_at(1, now).await.unwrap();
        assert!(first.should_alert);
        assert!(!first.alert_suppressed);

        // the dispatch task has not written the alert log yet
        assert!(h.store.alerts().is_empty());
        let second = h
            .orchestrator
            .execute_now_at(1, now + ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert!(second.should_alert);
        assert!(second.alert_suppressed);

        let raised = h
            .outbox
            .pop_batch(10)
            .into_iter()
            .filter(|e| matches!(e, ExecutionEvent::AlertRaised { .. }))
            .count();
        assert_eq!(raised, 1);
    }

    struct ConcurrencyGauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl DataSource for ConcurrencyGauge {
        async fn fetch(&self, _request: &ReadingRequest) -> Result<DataSourceReading> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(DataSourceReading {
                current_value: dec!(1),
                historical_value: None,
                volume: None,
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallelism_is_bounded() {
        let gauge = Arc::new(ConcurrencyGauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let h = harness_with(
            OrchestratorConfig {
                max_parallel_executions: 2,
                ..quick_config()
            },
            gauge.clone(),
            Arc::new(ScriptedDataSource::new()),
        );
        for id in 1..=8 {
            h.store.insert(sample_indicator(id));
        }

        let summary = h.orchestrator.run_tick(Utc::now()).await.unwrap();
        assert_eq!(summary.succeeded, 8);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert!(gauge.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_batch_size_limits_selection() {
        let h = harness(OrchestratorConfig {
            batch_size: 2,
            ..quick_config()
        });
        for id in 1..=5 {
            h.store.insert(sample_indicator(id));
            h.source.reading(id, dec!(1), None);
        }

        let summary = h.orchestrator.run_tick(Utc::now()).await.unwrap();
        assert_eq!(summary.selected, 2);
        assert_eq!(h.store.executions().len(), 2);
    }
}
