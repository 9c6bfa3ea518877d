//! Execution guard: at most one concurrent execution per indicator.
//!
//! The persisted running flag is the lock. A successful acquire hands out a
//! [`GuardLease`]; releasing consumes it. A lease dropped without release
//! (panic, cancelled task) schedules the release on the runtime, so the flag
//! cannot stay set because of an unwinding pipeline.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::models::Indicator;
use crate::store::IndicatorStore;

type InFlight = Arc<Mutex<HashMap<i64, DateTime<Utc>>>>;

#[derive(Clone)]
pub struct ExecutionGuard {
    store: Arc<dyn IndicatorStore>,
    in_flight: InFlight,
}

impl ExecutionGuard {
    pub fn new(store: Arc<dyn IndicatorStore>) -> Self {
        Self {
            store,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Atomically claim `indicator_id`. `Ok(None)` means another execution
    /// holds it, which is a lost race rather than an error.
    pub async fn try_acquire(
        &self,
        indicator_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<GuardLease>> {
        if !self.store.try_acquire_running(indicator_id, now).await? {
            debug!(indicator_id, "Indicator already running, acquire refused");
            return Ok(None);
        }

        self.in_flight.lock().insert(indicator_id, now);
        Ok(Some(GuardLease {
            indicator_id,
            store: Arc::clone(&self.store),
            in_flight: Arc::clone(&self.in_flight),
            released: false,
        }))
    }

    /// Number of executions this process currently holds
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, indicator_id: i64) -> bool {
        self.in_flight.lock().contains_key(&indicator_id)
    }

    /// Force-release runs older than the policy allows.
    ///
    /// Indicators this process still holds are left alone; the release is
    /// conditional on the start time the reaper observed.
    pub async fn reap_stale(&self, now: DateTime<Utc>, policy: &StaleRunPolicy) -> Result<Vec<i64>> {
        let running = self.store.running_indicators().await?;
        let mut released = Vec::new();

        for indicator in running {
            if self.is_in_flight(indicator.id) {
                continue;
            }
            let Some(started_at) = indicator.execution_start_time else {
                // Flag set without a start time can only come from outside the guard
                warn!(indicator_id = indicator.id, "Running flag without start time");
                continue;
            };
            if !policy.is_stale(&indicator, started_at, now) {
                continue;
            }

            match self.store.force_release(indicator.id, started_at).await {
                Ok(true) => {
                    info!(
                        indicator_id = indicator.id,
                        started_at = %started_at,
                        stale_after_minutes = policy.threshold(&indicator).num_minutes(),
                        "Force-released stale execution"
                    );
                    released.push(indicator.id);
                }
                Ok(false) => {
                    debug!(indicator_id = indicator.id, "Stale run finished before reaping");
                }
                Err(e) => {
                    error!(error = %e, indicator_id = indicator.id, "Failed to force-release stale run");
                }
            }
        }

        Ok(released)
    }
}

/// Proof of a successful acquire
pub struct GuardLease {
    indicator_id: i64,
    store: Arc<dyn IndicatorStore>,
    in_flight: InFlight,
    released: bool,
}

impl GuardLease {
    pub fn indicator_id(&self) -> i64 {
        self.indicator_id
    }

    /// Release the indicator. Store failures are logged; the stale-run reaper
    /// is the backstop.
    pub async fn release(mut self) {
        self.released = true;
        release_indicator(self.store.as_ref(), &self.in_flight, self.indicator_id).await;
    }
}

impl Drop for GuardLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let indicator_id = self.indicator_id;
        warn!(indicator_id, "Guard lease dropped without release, releasing in background");

        let store = Arc::clone(&self.store);
        let in_flight = Arc::clone(&self.in_flight);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_indicator(store.as_ref(), &in_flight, indicator_id).await;
                });
            }
            Err(_) => {
                in_flight.lock().remove(&indicator_id);
                error!(indicator_id, "No runtime to release on, indicator left for the reaper");
            }
        }
    }
}

async fn release_indicator(store: &dyn IndicatorStore, in_flight: &InFlight, indicator_id: i64) {
    in_flight.lock().remove(&indicator_id);
    if let Err(e) = store.release_running(indicator_id).await {
        error!(error = %e, indicator_id, "Failed to release running flag");
    } else {
        debug!(indicator_id, "Execution guard released");
    }
}

/// When a running flag is considered abandoned
#[derive(Debug, Clone)]
pub struct StaleRunPolicy {
    /// Multiples of the indicator's own frequency
    pub multiplier: i32,
    pub floor: Duration,
    pub ceiling: Duration,
}

impl StaleRunPolicy {
    pub fn threshold(&self, indicator: &Indicator) -> Duration {
        let by_frequency = Duration::minutes(
            i64::from(indicator.frequency_minutes.max(1)) * i64::from(self.multiplier.max(1)),
        );
        by_frequency.max(self.floor).min(self.ceiling)
    }

    pub fn is_stale(&self, indicator: &Indicator, started_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - started_at > self.threshold(indicator)
    }
}

impl Default for StaleRunPolicy {
    fn default() -> Self {
        Self {
            multiplier: 3,
            floor: Duration::minutes(5),
            ceiling: Duration::minutes(120),
        }
    }
}
