//! Reconciliation loop primitives.
//!
//! This library provides the plumbing shared by clusterinfo's
//! reconciliation loops:
//!
//! - **Work queues**: deduplicating FIFO queues with rate-limited
//!   re-delivery, the only synchronization point between change producers
//!   and the single reconciling consumer.
//! - **Backoff**: exponential delays for failed items.
//! - **Checkpoints**: the last consumed position in an ordered change feed.
//!
//! # Invariants
//!
//! - An item is never delivered to the consumer twice concurrently
//! - A failed item is retried a bounded number of times, then dropped
//! - Checkpoints only move forward

use std::time::Duration;

mod backoff;
mod queue;

pub use backoff::BackoffPolicy;
pub use queue::{RetryOutcome, WorkQueue};

/// Checkpoint for a change feed.
///
/// Tracks the last consumed event so that each event is enqueued once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Last consumed event ID.
    pub last_event_id: i64,

    /// Timestamp of last checkpoint update.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    /// Create a new checkpoint.
    pub fn new(last_event_id: i64) -> Self {
        Self {
            last_event_id,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Check if an event has already been consumed.
    pub fn is_processed(&self, event_id: i64) -> bool {
        event_id <= self.last_event_id
    }

    /// Advance the checkpoint to a new event.
    pub fn advance(&mut self, event_id: i64) {
        if event_id > self.last_event_id {
            self.last_event_id = event_id;
            self.updated_at = chrono::Utc::now();
        }
    }
}

/// Default accounting period.
pub const DEFAULT_ACCOUNTING_PERIOD: Duration = Duration::from_secs(3);

/// Default retry limit per queued item.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default number of incremental cycles between full recomputes.
pub const DEFAULT_RESYNC_INTERVAL: u32 = 20;
