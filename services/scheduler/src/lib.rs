//! Overcommit admission for a batch scheduler.
//!
//! A [`Session`] carries the nodes and jobs visible for one scheduling pass.
//! Plugins register enqueue predicates when the session opens;
//! [`enqueue_pending`] then offers each pending job to them in order.
//!
//! [`OvercommitPlugin`] admits a job only while the summed minimum resources
//! of queued jobs stay within the cluster's idle capacity, with ready-node
//! allocatable inflated by a configurable overcommit factor.

pub mod enqueue;
pub mod overcommit;
pub mod plugin;
pub mod session;

pub use enqueue::enqueue_pending;
pub use overcommit::{
    overcommit_factor, Admission, AdmissionGate, OvercommitPlugin, DEFAULT_OVERCOMMIT_FACTOR,
    OVERCOMMIT_FACTOR_KEY, PLUGIN_NAME,
};
pub use plugin::{ArgumentError, Arguments, Plugin};
pub use session::{EnqueuePredicate, JobInfo, JobPhase, NodeInfo, SchedulingSession, Session};
