//! clusterinfo controller library.
//!
//! Maintains a near-real-time aggregate of a cluster's resource capacity:
//! node allocatable, workload usage, idle capacity and idle-capacity
//! histograms, published as a single snapshot per cluster.
//!
//! The pieces, leaf-first:
//! - [`view`]: the live node/workload state the controller reads
//! - [`ledger`]: the persisted snapshot and its store contract
//! - [`events`]: change events and their queues
//! - [`accounting`]: the aggregation rules
//! - [`reconciler`] and [`worker`]: the periodic accounting cycle
//! - [`db`]: Postgres adapters for the store, the view and the change feed

pub mod accounting;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod ledger;
pub mod reconciler;
pub mod snapshot;
pub mod view;
pub mod worker;

pub use accounting::{AccountingIndex, AccountingPolicy};
pub use error::{CycleError, EventError, ViewError};
pub use events::{ChangeEvent, ChangeQueues, EventOp, NodeEvent, WorkloadEvent};
pub use ledger::{ClusterLedger, LedgerError, MemoryStore, ObjectStore, StoreError};
pub use reconciler::{CycleMode, CycleStats, LedgerReconciler, Strategy};
pub use snapshot::{ClusterSnapshot, ResourcesInfo};
pub use view::{ClusterView, MemoryClusterView, NodeView, WorkloadId, WorkloadView};
pub use worker::LedgerWorker;
