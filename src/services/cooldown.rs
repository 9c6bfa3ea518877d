//! Alert cooldown gate

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::AlertLog;

/// Suppresses alert emission while a previous alert for the same indicator
/// is younger than its cooldown. Execution and history are never affected.
///
/// The alert log only sees an intent once the dispatch task has handed it to
/// the notifier, so alerts raised by this process are also remembered here
/// until then.
#[derive(Clone)]
pub struct CooldownGate {
    alert_log: Arc<dyn AlertLog>,
    raised: Arc<Mutex<HashMap<i64, DateTime<Utc>>>>,
}

impl CooldownGate {
    pub fn new(alert_log: Arc<dyn AlertLog>) -> Self {
        Self {
            alert_log,
            raised: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Remember an alert raised for `indicator_id` at `at`
    pub fn note_raised(&self, indicator_id: i64, at: DateTime<Utc>) {
        let mut raised = self.raised.lock();
        let entry = raised.entry(indicator_id).or_insert(at);
        *entry = (*entry).max(at);
    }

    /// Whether an alert for `indicator_id` must be held back at `now`.
    ///
    /// Fails open: when the alert log is unreadable only alerts raised by
    /// this process count.
    pub async fn should_suppress(
        &self,
        indicator_id: i64,
        now: DateTime<Utc>,
        cooldown_minutes: i32,
    ) -> bool {
        if cooldown_minutes <= 0 {
            return false;
        }

        let local = self.raised.lock().get(&indicator_id).copied();
        let logged = match self.alert_log.last_alert_time(indicator_id).await {
            Ok(last) => last,
            Err(e) => {
                warn!(error = %e, indicator_id, "Alert log unavailable, cooldown uses local alerts only");
                None
            }
        };

        let last = logged.max(local);
        let suppress = within_cooldown(last, now, cooldown_minutes);
        if suppress {
            debug!(indicator_id, cooldown_minutes, last_alert = ?last, "Alert inside cooldown window");
        }
        suppress
    }
}

/// Pure cooldown predicate: `now - last < cooldown`
pub fn within_cooldown(
    last_alert: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown_minutes: i32,
) -> bool {
    match last_alert {
        Some(last) if cooldown_minutes > 0 => {
            now - last < Duration::minutes(i64::from(cooldown_minutes))
        }
        _ => false,
    }
}
