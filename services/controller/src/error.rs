//! Controller error types.
//!
//! Every failure here is local to one accounting cycle: it aborts that
//! cycle's publish (or drops one event) but never stops the controller.

use clusterinfo_resource::ResourceError;
use thiserror::Error;

use crate::ledger::LedgerError;

/// Errors reading the live node/workload view.
#[derive(Debug, Error, Clone)]
pub enum ViewError {
    /// The backing source could not be read.
    #[error("cluster view unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("malformed {kind} '{key}': {reason}")]
    Malformed {
        kind: &'static str,
        key: String,
        reason: String,
    },
}

impl ViewError {
    /// Returns true if the same read may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ViewError::Unavailable(_))
    }
}

/// Errors processing a single queued change event.
#[derive(Debug, Error)]
pub enum EventError {
    /// The event refers to an entity that no longer exists.
    #[error("stale reference to {kind} '{key}'")]
    StaleReference { kind: &'static str, key: String },

    /// The event is malformed.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The view could not be read.
    #[error(transparent)]
    View(#[from] ViewError),

    /// Applying the event would drive an aggregate negative or past its
    /// representable maximum.
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl EventError {
    /// Returns true if retrying the event may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventError::View(err) if err.is_transient())
    }
}

/// Errors that abort an accounting cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Resource arithmetic failed, typically idle going negative; the prior
    /// snapshot is kept.
    #[error("resource accounting failed: {0}")]
    Resource(#[from] ResourceError),

    /// Listing nodes or workloads for a full recompute failed.
    #[error(transparent)]
    View(#[from] ViewError),

    /// Publishing to the ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl CycleError {
    /// Returns true if the failure was an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CycleError::Ledger(LedgerError::Conflict { .. }))
    }
}
