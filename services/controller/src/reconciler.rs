//! Ledger reconciler.
//!
//! One reconciler owns the accounting index for one cluster. Each call to
//! [`LedgerReconciler::run_cycle`]:
//! - Drains every ready node event, then every ready workload event
//! - Applies them to the index (incremental) or rebuilds the index from the
//!   view (full)
//! - Derives the snapshot and publishes it through the ledger
//!
//! Events are level-triggered: an event names the entity that changed, and
//! the entity's current state is read from the [`ClusterView`]. A delete for
//! an entity the view still has therefore re-applies its current state,
//! which keeps delete-then-add update pairs correct even when the queue has
//! coalesced one half with an earlier event.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use clusterinfo_reconcile::{RetryOutcome, WorkQueue, DEFAULT_RESYNC_INTERVAL};
use tracing::{debug, error, info, instrument, warn};

use crate::accounting::{AccountingIndex, AccountingPolicy};
use crate::error::{CycleError, EventError};
use crate::events::{ChangeEvent, ChangeQueues, EventOp, NodeEvent, WorkloadEvent};
use crate::ledger::ClusterLedger;
use crate::view::ClusterView;

/// How the index is maintained between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Rebuild from the view every cycle.
    Full,

    /// Apply queued events, with a full rebuild after every
    /// `resync_interval` incremental cycles.
    Incremental { resync_interval: u32 },
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Incremental {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }
}

/// What a single cycle actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    Full,
    Incremental,
}

impl fmt::Display for CycleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleMode::Full => f.write_str("full"),
            CycleMode::Incremental => f.write_str("incremental"),
        }
    }
}

/// Statistics from one accounting cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub mode: CycleMode,
    pub node_events: usize,
    pub workload_events: usize,

    /// Events naming entities the view no longer has.
    pub stale: usize,

    /// Events handed back to their queue for another attempt.
    pub requeued: usize,

    /// Events given up on, either malformed or out of retries.
    pub dropped: usize,

    /// Version of the published snapshot.
    pub resource_version: i64,
}

impl CycleStats {
    fn new(mode: CycleMode, node_events: usize, workload_events: usize) -> Self {
        Self {
            mode,
            node_events,
            workload_events,
            stale: 0,
            requeued: 0,
            dropped: 0,
            resource_version: 0,
        }
    }
}

/// The ledger reconciler.
pub struct LedgerReconciler {
    ledger: ClusterLedger,
    view: Arc<dyn ClusterView>,
    queues: ChangeQueues,
    strategy: Strategy,
    index: AccountingIndex,
    incremental_cycles: u32,

    /// Set when the index can no longer be trusted. The index starts empty,
    /// so the first cycle is always a full rebuild.
    force_resync: bool,
}

impl LedgerReconciler {
    pub fn new(
        ledger: ClusterLedger,
        view: Arc<dyn ClusterView>,
        queues: ChangeQueues,
        strategy: Strategy,
        policy: AccountingPolicy,
    ) -> Self {
        Self {
            ledger,
            view,
            queues,
            strategy,
            index: AccountingIndex::new(policy),
            incremental_cycles: 0,
            force_resync: true,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// True if the next cycle will rebuild from the view.
    pub fn resync_pending(&self) -> bool {
        self.next_mode() == CycleMode::Full
    }

    fn next_mode(&self) -> CycleMode {
        match self.strategy {
            Strategy::Full => CycleMode::Full,
            Strategy::Incremental { resync_interval } => {
                if self.force_resync || self.incremental_cycles >= resync_interval {
                    CycleMode::Full
                } else {
                    CycleMode::Incremental
                }
            }
        }
    }

    /// Run one accounting cycle and publish the result.
    ///
    /// A failed cycle leaves the previously published snapshot in place.
    #[instrument(skip(self), fields(cluster_id = %self.ledger.cluster_id()))]
    pub async fn run_cycle(&mut self) -> Result<CycleStats, CycleError> {
        let nodes = Arc::clone(&self.queues.nodes);
        let workloads = Arc::clone(&self.queues.workloads);

        let node_events = nodes.drain_ready().await;
        let workload_events = workloads.drain_ready().await;
        let mode = self.next_mode();
        let mut stats = CycleStats::new(mode, node_events.len(), workload_events.len());

        match mode {
            CycleMode::Full => {
                // The listing supersedes whatever the events said.
                discard(&nodes, node_events).await;
                discard(&workloads, workload_events).await;
                self.rebuild().await?;
            }
            CycleMode::Incremental => {
                for event in node_events {
                    let result = self.apply(&ChangeEvent::Node(event.clone())).await;
                    self.settle(&nodes, event, result, &mut stats).await;
                }
                for event in workload_events {
                    let result = self.apply(&ChangeEvent::Workload(event.clone())).await;
                    self.settle(&workloads, event, result, &mut stats).await;
                }
                self.incremental_cycles += 1;
            }
        }

        let resources = match self.index.snapshot() {
            Ok(resources) => resources,
            Err(err) => {
                if mode == CycleMode::Incremental {
                    self.force_resync = true;
                }
                warn!(mode = %mode, error = %err, "Idle computation failed, keeping previous snapshot");
                return Err(err.into());
            }
        };

        let published = self.ledger.publish(resources).await?;
        stats.resource_version = published.resource_version;

        info!(
            mode = %stats.mode,
            node_events = stats.node_events,
            workload_events = stats.workload_events,
            stale = stats.stale,
            requeued = stats.requeued,
            dropped = stats.dropped,
            total_nodes = published.resources.total_nodes,
            ready_nodes = published.resources.ready_nodes,
            idle = %published.resources.idle,
            resource_version = stats.resource_version,
            "Accounting cycle complete"
        );

        Ok(stats)
    }

    async fn rebuild(&mut self) -> Result<(), CycleError> {
        let nodes = self.view.list_nodes().await?;
        let workloads = self.view.list_workloads().await?;
        self.index.rebuild(&nodes, &workloads)?;

        self.force_resync = false;
        self.incremental_cycles = 0;
        debug!(
            nodes = nodes.len(),
            workloads = workloads.len(),
            "Rebuilt accounting index"
        );
        Ok(())
    }

    /// Apply one event against the current view.
    async fn apply(&mut self, event: &ChangeEvent) -> Result<(), EventError> {
        validate(event)?;

        match event {
            ChangeEvent::Node(NodeEvent {
                name,
                op: EventOp::Add,
                ..
            }) => {
                let node = self
                    .view
                    .get_node(name)
                    .await?
                    .ok_or_else(|| EventError::StaleReference {
                        kind: "node",
                        key: name.clone(),
                    })?;
                self.index.upsert_node(&node)?;
            }
            ChangeEvent::Node(NodeEvent {
                name,
                op: EventOp::Delete,
                ..
            }) => match self.view.get_node(name).await? {
                Some(node) => self.index.upsert_node(&node)?,
                None => {
                    self.index.remove_node(name)?;
                }
            },
            ChangeEvent::Workload(WorkloadEvent {
                id,
                op: EventOp::Add,
            }) => {
                let workload = self
                    .view
                    .get_workload(id)
                    .await?
                    .ok_or_else(|| EventError::StaleReference {
                        kind: "workload",
                        key: id.to_string(),
                    })?;
                self.index.upsert_workload(&workload)?;
            }
            ChangeEvent::Workload(WorkloadEvent {
                id,
                op: EventOp::Delete,
            }) => match self.view.get_workload(id).await? {
                Some(workload) => self.index.upsert_workload(&workload)?,
                None => {
                    self.index.remove_workload(id)?;
                }
            },
        }
        Ok(())
    }

    /// Record the outcome of one event and release it from its queue.
    async fn settle<T>(
        &mut self,
        queue: &WorkQueue<T>,
        item: T,
        result: Result<(), EventError>,
        stats: &mut CycleStats,
    ) where
        T: Clone + Eq + Hash + fmt::Debug + Send,
    {
        match result {
            Ok(()) => queue.forget(&item).await,
            Err(EventError::StaleReference { kind, key }) => {
                info!(queue = queue.name(), kind, key = %key, "Entity no longer exists, dropping event");
                stats.stale += 1;
                queue.forget(&item).await;
            }
            Err(EventError::InvalidEvent(reason)) => {
                warn!(queue = queue.name(), item = ?item, reason = %reason, "Dropping invalid event");
                stats.dropped += 1;
                queue.forget(&item).await;
            }
            Err(EventError::Resource(err)) => {
                warn!(
                    queue = queue.name(),
                    item = ?item,
                    error = %err,
                    "Accounting inconsistency, scheduling full recompute"
                );
                self.force_resync = true;
                queue.forget(&item).await;
            }
            Err(EventError::View(err)) if !err.is_transient() => {
                warn!(queue = queue.name(), item = ?item, error = %err, "Dropping event for unreadable entity");
                stats.dropped += 1;
                queue.forget(&item).await;
            }
            Err(EventError::View(err)) => match queue.retry(item.clone()).await {
                RetryOutcome::Requeued { attempt, .. } => {
                    debug!(queue = queue.name(), attempt, error = %err, "Event failed, requeued");
                    stats.requeued += 1;
                }
                RetryOutcome::Dropped { attempts } => {
                    error!(
                        queue = queue.name(),
                        item = ?item,
                        attempts,
                        error = %err,
                        "Event dropped after exhausting retries, scheduling full recompute"
                    );
                    stats.dropped += 1;
                    self.force_resync = true;
                }
            },
        }
        queue.done(&item).await;
    }
}

fn validate(event: &ChangeEvent) -> Result<(), EventError> {
    match event {
        ChangeEvent::Node(ev) if ev.name.is_empty() => {
            Err(EventError::InvalidEvent("node event with empty name".into()))
        }
        ChangeEvent::Workload(ev) if ev.id.namespace.is_empty() || ev.id.name.is_empty() => Err(
            EventError::InvalidEvent(format!("workload event with incomplete id '{}'", ev.id)),
        ),
        _ => Ok(()),
    }
}

async fn discard<T>(queue: &WorkQueue<T>, items: Vec<T>)
where
    T: Clone + Eq + Hash + fmt::Debug + Send,
{
    for item in items {
        queue.forget(&item).await;
        queue.done(&item).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViewError;
    use crate::ledger::{MemoryStore, ObjectStore};
    use crate::view::{MemoryClusterView, NodeView, WorkloadId, WorkloadPhase, WorkloadView};
    use async_trait::async_trait;
    use clusterinfo_reconcile::BackoffPolicy;
    use clusterinfo_resource::{Quantity, ResourceVector, CPU};

    fn cpu(units: u64) -> ResourceVector {
        ResourceVector::empty().with(CPU, Quantity::from_units(units))
    }

    struct Harness {
        store: Arc<MemoryStore>,
        view: Arc<MemoryClusterView>,
        queues: ChangeQueues,
        reconciler: LedgerReconciler,
    }

    fn harness(strategy: Strategy) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let view = Arc::new(MemoryClusterView::new());
        let queues = ChangeQueues::new(BackoffPolicy::immediate(), 2);
        let reconciler = LedgerReconciler::new(
            ClusterLedger::new(store.clone(), "test"),
            view.clone(),
            queues.clone(),
            strategy,
            AccountingPolicy::default(),
        );
        Harness {
            store,
            view,
            queues,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_first_cycle_is_full() {
        let mut h = harness(Strategy::default());
        h.view.upsert_node(NodeView::new("a", cpu(4), true)).await;

        let stats = h.reconciler.run_cycle().await.unwrap();
        assert_eq!(stats.mode, CycleMode::Full);

        let stored = h.store.get("test").await.unwrap();
        assert_eq!(stored.resources.allocatable, cpu(4));
        assert_eq!(stored.resource_version, stats.resource_version);
    }

    #[tokio::test]
    async fn test_resync_interval() {
        let mut h = harness(Strategy::Incremental { resync_interval: 2 });
        let modes = [
            CycleMode::Full,
            CycleMode::Incremental,
            CycleMode::Incremental,
            CycleMode::Full,
        ];
        for expected in modes {
            assert_eq!(h.reconciler.run_cycle().await.unwrap().mode, expected);
        }
    }

    #[tokio::test]
    async fn test_stale_add_is_dropped() {
        let mut h = harness(Strategy::default());
        h.reconciler.run_cycle().await.unwrap();

        h.queues.node_added("ghost", true).await;
        let stats = h.reconciler.run_cycle().await.unwrap();
        assert_eq!(stats.stale, 1);
        assert!(h.queues.nodes.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_event_is_dropped() {
        let mut h = harness(Strategy::default());
        h.reconciler.run_cycle().await.unwrap();

        h.queues.workload_added(&WorkloadId::new("", "w")).await;
        let stats = h.reconciler.run_cycle().await.unwrap();
        assert_eq!(stats.dropped, 1);
        assert!(!h.reconciler.resync_pending());
    }

    #[tokio::test]
    async fn test_update_pair_applied_in_one_cycle() {
        let mut h = harness(Strategy::default());
        h.view.upsert_node(NodeView::new("a", cpu(4), true)).await;
        h.reconciler.run_cycle().await.unwrap();

        h.view.upsert_node(NodeView::new("a", cpu(4), false)).await;
        h.queues.node_updated("a", true, false).await;
        let stats = h.reconciler.run_cycle().await.unwrap();

        assert_eq!(stats.mode, CycleMode::Incremental);
        assert_eq!(stats.node_events, 2);
        let stored = h.store.get("test").await.unwrap();
        assert!(stored.resources.allocatable.is_empty());
        assert_eq!(stored.resources.ready_nodes, 0);
        assert_eq!(stored.resources.total_nodes, 1);
    }

    #[tokio::test]
    async fn test_workload_lifecycle() {
        let mut h = harness(Strategy::default());
        h.view.upsert_node(NodeView::new("a", cpu(4), true)).await;
        h.reconciler.run_cycle().await.unwrap();

        let mut workload = WorkloadView {
            namespace: "default".into(),
            name: "web".into(),
            node_name: Some("a".into()),
            phase: WorkloadPhase::Running,
            containers: vec![cpu(1)],
            init_containers: vec![],
        };
        h.view.upsert_workload(workload.clone()).await;
        h.queues.workload_added(&workload.id()).await;
        h.reconciler.run_cycle().await.unwrap();
        assert_eq!(h.store.get("test").await.unwrap().resources.idle, cpu(3));

        workload.phase = WorkloadPhase::Succeeded;
        h.view.upsert_workload(workload.clone()).await;
        h.queues.workload_updated(&workload.id()).await;
        h.reconciler.run_cycle().await.unwrap();
        assert_eq!(h.store.get("test").await.unwrap().resources.idle, cpu(4));
    }

    struct BrokenView;

    #[async_trait]
    impl ClusterView for BrokenView {
        async fn list_nodes(&self) -> Result<Vec<NodeView>, ViewError> {
            Ok(vec![])
        }

        async fn get_node(&self, _name: &str) -> Result<Option<NodeView>, ViewError> {
            Err(ViewError::Unavailable("timeout".into()))
        }

        async fn list_workloads(&self) -> Result<Vec<WorkloadView>, ViewError> {
            Ok(vec![])
        }

        async fn get_workload(&self, _id: &WorkloadId) -> Result<Option<WorkloadView>, ViewError> {
            Err(ViewError::Unavailable("timeout".into()))
        }
    }

    #[tokio::test]
    async fn test_retries_then_forces_resync() {
        let queues = ChangeQueues::new(BackoffPolicy::immediate(), 1);
        let mut reconciler = LedgerReconciler::new(
            ClusterLedger::new(Arc::new(MemoryStore::new()), "test"),
            Arc::new(BrokenView),
            queues.clone(),
            Strategy::default(),
            AccountingPolicy::default(),
        );
        reconciler.run_cycle().await.unwrap();

        queues.node_added("a", true).await;
        let first = reconciler.run_cycle().await.unwrap();
        assert_eq!(first.requeued, 1);
        assert!(!reconciler.resync_pending());

        let second = reconciler.run_cycle().await.unwrap();
        assert_eq!(second.dropped, 1);
        assert!(reconciler.resync_pending());
        assert_eq!(queues.nodes.num_requeues(&NodeEvent {
            name: "a".into(),
            ready: true,
            op: EventOp::Add,
        }).await, 0);
    }
}
