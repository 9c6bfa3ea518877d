//! Lock-free outbox between executions and the dispatch task

use crate::models::ExecutionEvent;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bounded event outbox backed by crossbeam's ArrayQueue.
///
/// Executions push without blocking; the dispatch task drains in batches.
/// Rejected events are counted, split into alert intents and the rest, since
/// a lost `AlertRaised` means a notification that never goes out.
#[derive(Clone)]
pub struct EventOutbox {
    queue: Arc<ArrayQueue<ExecutionEvent>>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
    dropped_alerts: Arc<AtomicU64>,
}

impl EventOutbox {
    /// Create a new outbox with the specified capacity.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of events the outbox can hold
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity)),
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
            dropped_alerts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Try to push an event.
    ///
    /// Returns `Err(event)` if the outbox is full; the drop is counted.
    pub fn try_push(&self, event: ExecutionEvent) -> Result<(), ExecutionEvent> {
        self.queue.push(event).map_err(|event| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if matches!(event, ExecutionEvent::AlertRaised { .. }) {
                self.dropped_alerts.fetch_add(1, Ordering::Relaxed);
            }
            event
        })
    }

    /// Pop up to `max` events.
    pub fn pop_batch(&self, max: usize) -> Vec<ExecutionEvent> {
        let mut batch = Vec::with_capacity(max.min(self.queue.len()));
        for _ in 0..max {
            match self.queue.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Events rejected because the outbox was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// `AlertRaised` events among `dropped`
    pub fn dropped_alerts(&self) -> u64 {
        self.dropped_alerts.load(Ordering::Relaxed)
    }
}
