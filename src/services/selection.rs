//! Due-selection: which indicators run on this tick

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::Indicator;
use crate::store::IndicatorStore;

/// Select at most `batch_size` indicators due at `now`, stalest first.
///
/// Never-run indicators sort before everything else. Each successful run moves
/// an indicator to the back of the queue, so with equal frequencies no
/// indicator is selected twice before every other one was selected once.
pub async fn select_due(
    store: &dyn IndicatorStore,
    now: DateTime<Utc>,
    batch_size: usize,
) -> Result<Vec<Indicator>> {
    if batch_size == 0 {
        return Ok(Vec::new());
    }
    let candidates = store.due_candidates(now, batch_size).await?;
    Ok(order_due(candidates, now, batch_size))
}

/// Filter and order a store snapshot. `None` sorts first on `Option`.
pub fn order_due(
    mut candidates: Vec<Indicator>,
    now: DateTime<Utc>,
    batch_size: usize,
) -> Vec<Indicator> {
    candidates.retain(|ind| ind.is_due(now));
    candidates.sort_by(|a, b| a.last_run.cmp(&b.last_run).then(a.id.cmp(&b.id)));
    candidates.truncate(batch_size);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{sample_indicator, MemoryStore};
    use chrono::Duration;
    use std::collections::HashSet;

    #[test]
    fn test_never_run_first_then_oldest() {
        let now = Utc::now();
        let mut a = sample_indicator(1);
        a.last_run = Some(now - Duration::minutes(10));
        let mut b = sample_indicator(2);
        b.last_run = Some(now - Duration::minutes(60));
        let c = sample_indicator(3);

        let ordered = order_due(vec![a, b, c], now, 10);
        let ids: Vec<i64> = ordered.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_filters_ineligible_and_truncates() {
        let now = Utc::now();
        let mut recent = sample_indicator(1);
        recent.last_run = Some(now - Duration::minutes(1));
        let mut inactive = sample_indicator(2);
        inactive.is_active = false;
        let mut running = sample_indicator(3);
        running.is_currently_running = true;

        let ordered = order_due(
            vec![recent, inactive, running, sample_indicator(4), sample_indicator(5)],
            now,
            1,
        );
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].id, 4);
    }

    #[tokio::test]
    async fn test_zero_batch_selects_nothing() {
        let store = MemoryStore::new();
        store.insert(sample_indicator(1));
        assert!(select_due(&store, Utc::now(), 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_selection_error_propagates() {
        let store = MemoryStore::new();
        store.set_fail_selection(true);
        assert!(select_due(&store, Utc::now(), 5).await.is_err());
    }

    #[tokio::test]
    async fn test_starvation_freedom() {
        let store = MemoryStore::new();
        let n = 7;
        let batch = 3;
        for id in 1..=n {
            store.insert(sample_indicator(id));
        }

        // Simulate ticks spaced one frequency apart; each selected indicator
        // runs successfully and gets last_run = tick time.
        let start = Utc::now();
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for tick in 0..10 {
            let now = start + Duration::minutes(5 * tick);
            let due = select_due(&store, now, batch).await.unwrap();
            for ind in due {
                order.push(ind.id);
                store.update_last_run(ind.id, now).await.unwrap();
            }
            if order.len() >= n as usize {
                break;
            }
        }

        for id in order.iter().take(n as usize) {
            assert!(seen.insert(*id), "indicator {id} selected twice before all ran once");
        }
        assert_eq!(seen.len(), n as usize);
    }
}
