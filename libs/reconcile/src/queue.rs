//! Deduplicating, rate-limited work queue.
//!
//! The queue decouples producers (change notifications) from a single
//! consumer (the reconciliation loop). It follows the classic controller
//! work queue contract:
//!
//! - An item that is already waiting is not queued twice.
//! - An item added while it is being processed is queued again once the
//!   consumer calls [`WorkQueue::done`].
//! - Failed items are re-delivered with exponential backoff via
//!   [`WorkQueue::retry`] and dropped once the retry budget is spent.
//!
//! Items are delivered in FIFO order. All methods take `&self`, so the queue
//! is shared behind an `Arc` between any number of producers and the
//! consumer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::BackoffPolicy;

/// Outcome of handing a failed item back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The item will be re-delivered after `delay`.
    Requeued { attempt: u32, delay: Duration },

    /// The retry budget is exhausted; the item was dropped.
    Dropped { attempts: u32 },
}

impl RetryOutcome {
    /// Returns true if the item was dropped.
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped { .. })
    }
}

#[derive(Debug)]
struct QueueState<T> {
    /// Items ready for delivery, in order.
    queue: VecDeque<T>,

    /// Items that need processing (queued, or re-added while processing).
    dirty: HashSet<T>,

    /// Items handed to the consumer and not yet finished.
    processing: HashSet<T>,

    /// Items waiting out a backoff delay.
    delayed: HashMap<T, Instant>,

    /// Retry counts per item.
    requeues: HashMap<T, u32>,

    shutting_down: bool,
}

impl<T: Clone + Eq + Hash> QueueState<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            delayed: HashMap::new(),
            requeues: HashMap::new(),
            shutting_down: false,
        }
    }

    fn add(&mut self, item: T) {
        if self.shutting_down || self.dirty.contains(&item) {
            return;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            return;
        }
        self.queue.push_back(item);
    }

    fn add_after(&mut self, item: T, delay: Duration) {
        if self.shutting_down {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let ready_at = Instant::now() + delay;
        self.delayed
            .entry(item)
            .and_modify(|at| {
                if ready_at < *at {
                    *at = ready_at;
                }
            })
            .or_insert(ready_at);
    }

    fn promote_ready(&mut self, now: Instant) {
        let ready: Vec<T> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(item, _)| item.clone())
            .collect();
        for item in ready {
            self.delayed.remove(&item);
            self.add(item);
        }
    }
}

/// A deduplicating FIFO work queue with rate-limited re-delivery.
#[derive(Debug)]
pub struct WorkQueue<T> {
    name: String,
    backoff: BackoffPolicy,
    max_retries: u32,
    state: Mutex<QueueState<T>>,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send,
{
    /// Create a new queue.
    pub fn new(name: impl Into<String>, backoff: BackoffPolicy, max_retries: u32) -> Self {
        Self {
            name: name.into(),
            backoff,
            max_retries,
            state: Mutex::new(QueueState::new()),
        }
    }

    /// Queue name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add an item for processing.
    pub async fn add(&self, item: T) {
        self.state.lock().await.add(item);
    }

    /// Add several items under one lock, so a consumer drains all of them or
    /// none of them.
    pub async fn add_batch(&self, items: impl IntoIterator<Item = T>) {
        let mut state = self.state.lock().await;
        for item in items {
            state.add(item);
        }
    }

    /// Add an item once `delay` has elapsed.
    pub async fn add_after(&self, item: T, delay: Duration) {
        self.state.lock().await.add_after(item, delay);
    }

    /// Hand a failed item back for re-delivery with backoff.
    ///
    /// Once an item has been retried `max_retries` times it is dropped and
    /// its retry count forgotten.
    pub async fn retry(&self, item: T) -> RetryOutcome {
        let mut state = self.state.lock().await;
        let attempts = state.requeues.get(&item).copied().unwrap_or(0);

        if attempts >= self.max_retries {
            state.requeues.remove(&item);
            warn!(
                queue = %self.name,
                item = ?item,
                attempts,
                "Dropping item after exhausting retries"
            );
            return RetryOutcome::Dropped { attempts };
        }

        let delay = self.backoff.delay(attempts);
        state.requeues.insert(item.clone(), attempts + 1);
        debug!(
            queue = %self.name,
            item = ?item,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "Requeueing item with backoff"
        );
        state.add_after(item, delay);

        RetryOutcome::Requeued {
            attempt: attempts + 1,
            delay,
        }
    }

    /// Clear the retry count for an item (on success).
    pub async fn forget(&self, item: &T) {
        self.state.lock().await.requeues.remove(item);
    }

    /// Number of times an item has been requeued.
    pub async fn num_requeues(&self, item: &T) -> u32 {
        self.state
            .lock()
            .await
            .requeues
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Take every item that is ready now, in FIFO order.
    ///
    /// Each returned item is marked as processing and must be finished with
    /// [`WorkQueue::done`].
    pub async fn drain_ready(&self) -> Vec<T> {
        let mut state = self.state.lock().await;
        state.promote_ready(Instant::now());

        let mut items = Vec::with_capacity(state.queue.len());
        while let Some(item) = state.queue.pop_front() {
            state.dirty.remove(&item);
            state.processing.insert(item.clone());
            items.push(item);
        }
        items
    }

    /// Mark an item as finished. If it was re-added meanwhile it is queued
    /// again.
    pub async fn done(&self, item: &T) {
        let mut state = self.state.lock().await;
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
        }
    }

    /// Number of items ready for delivery.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Returns true if no item is ready for delivery.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of items waiting out a backoff delay.
    pub async fn delayed_len(&self) -> usize {
        self.state.lock().await.delayed.len()
    }

    /// Stop accepting new items. Items already queued can still be drained.
    pub async fn shut_down(&self) {
        let mut state = self.state.lock().await;
        state.shutting_down = true;
        state.delayed.clear();
    }

    /// Returns true once [`WorkQueue::shut_down`] has been called.
    pub async fn is_shutting_down(&self) -> bool {
        self.state.lock().await.shutting_down
    }
}
