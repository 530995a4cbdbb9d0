use std::sync::Arc;

use clusterinfo_controller::{
    AccountingPolicy, ChangeQueues, ClusterLedger, CycleMode, LedgerReconciler, MemoryClusterView,
    MemoryStore, NodeView, ObjectStore, ResourcesInfo, Strategy, WorkloadId, WorkloadView,
};
use clusterinfo_controller::view::WorkloadPhase;
use clusterinfo_reconcile::BackoffPolicy;
use clusterinfo_resource::{Quantity, ResourceVector, CPU, MEMORY};

const GI: u64 = 1 << 30;

fn res(cpu: u64, mem: u64) -> ResourceVector {
    ResourceVector::empty()
        .with(CPU, Quantity::from_units(cpu))
        .with(MEMORY, Quantity::from_units(mem))
}

fn workload(name: &str, node: Option<&str>, request: ResourceVector) -> WorkloadView {
    WorkloadView {
        namespace: "default".to_string(),
        name: name.to_string(),
        node_name: node.map(str::to_string),
        phase: WorkloadPhase::Running,
        containers: vec![request],
        init_containers: vec![],
    }
}

/// Incremental MaxResources only grows between resyncs, so compare the rest.
fn without_max(mut info: ResourcesInfo) -> ResourcesInfo {
    info.max_resources = ResourceVector::empty();
    info
}

struct Controller {
    store: Arc<MemoryStore>,
    queues: ChangeQueues,
    reconciler: LedgerReconciler,
}

impl Controller {
    fn new(view: Arc<MemoryClusterView>, strategy: Strategy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queues = ChangeQueues::new(BackoffPolicy::immediate(), 3);
        let reconciler = LedgerReconciler::new(
            ClusterLedger::new(store.clone(), "cluster"),
            view,
            queues.clone(),
            strategy,
            AccountingPolicy::default(),
        );
        Self {
            store,
            queues,
            reconciler,
        }
    }

    async fn cycle(&mut self) -> ResourcesInfo {
        self.reconciler.run_cycle().await.unwrap();
        self.store.get("cluster").await.unwrap().resources
    }
}

#[tokio::test]
async fn two_ready_nodes_without_workloads() {
    let view = Arc::new(MemoryClusterView::new());
    view.upsert_node(NodeView::new("a", res(4, 8 * GI), true)).await;
    view.upsert_node(NodeView::new("b", res(4, 8 * GI), true)).await;

    let mut controller = Controller::new(view, Strategy::Full);
    let info = controller.cycle().await;

    // Memory is floored to whole decimal gigabytes: 16Gi is 17.18e9 bytes.
    let expected = res(8, 17_000_000_000);
    assert_eq!(info.allocatable, expected);
    assert!(info.used.is_empty());
    assert_eq!(info.idle, expected);
    assert_eq!(info.ready_nodes, 2);
    assert_eq!(info.total_nodes, 2);
}

#[tokio::test]
async fn one_workload_on_one_node() {
    let view = Arc::new(MemoryClusterView::new());
    let cpu = |n| ResourceVector::empty().with(CPU, Quantity::from_units(n));
    view.upsert_node(NodeView::new("a", cpu(4), true)).await;

    let mut controller = Controller::new(view.clone(), Strategy::default());
    controller.cycle().await;

    let w = workload("w", Some("a"), cpu(1));
    view.upsert_workload(w.clone()).await;
    controller.queues.workload_added(&w.id()).await;
    let info = controller.cycle().await;

    assert_eq!(info.used, cpu(1));
    assert_eq!(info.idle, cpu(3));
}

#[tokio::test]
async fn full_and_incremental_converge() {
    let view = Arc::new(MemoryClusterView::new());
    let mut full = Controller::new(view.clone(), Strategy::Full);
    let mut incremental = Controller::new(view.clone(), Strategy::Incremental { resync_interval: 3 });

    // Both start from an empty cluster.
    assert_eq!(full.cycle().await, incremental.cycle().await);

    // Nodes join.
    for (name, cpu) in [("a", 32), ("b", 64), ("c", 16)] {
        view.upsert_node(NodeView::new(name, res(cpu, 64 * GI), true)).await;
        incremental.queues.node_added(name, true).await;
    }
    view.upsert_node(NodeView::new("virtual-kubelet", res(1000, 0), true)).await;
    incremental.queues.node_added("virtual-kubelet", true).await;

    // Workloads land, one on a node that does not exist yet.
    let placements = [("w1", "a", 8), ("w2", "b", 30), ("w3", "b", 10), ("w4", "d", 4)];
    for (name, node, cpu) in placements {
        let w = workload(name, Some(node), res(cpu, 4 * GI));
        view.upsert_workload(w.clone()).await;
        incremental.queues.workload_added(&w.id()).await;
    }
    let inc = incremental.cycle().await;
    assert_eq!(full.cycle().await, inc);

    // Node d joins, b goes not-ready, w1 finishes, w3 is deleted.
    view.upsert_node(NodeView::new("d", res(8, 16 * GI), true)).await;
    incremental.queues.node_added("d", true).await;

    view.upsert_node(NodeView::new("b", res(64, 64 * GI), false)).await;
    incremental.queues.node_updated("b", true, false).await;

    let mut w1 = workload("w1", Some("a"), res(8, 4 * GI));
    w1.phase = WorkloadPhase::Succeeded;
    view.upsert_workload(w1.clone()).await;
    incremental.queues.workload_updated(&w1.id()).await;

    let w3 = WorkloadId::new("default", "w3");
    view.remove_workload(&w3).await;
    incremental.queues.workload_deleted(&w3).await;

    let inc = incremental.cycle().await;
    let authoritative = full.cycle().await;
    assert_eq!(without_max(authoritative.clone()), without_max(inc.clone()));
    assert!(authoritative.max_resources.less_equal(&inc.max_resources));
    assert_eq!(inc.ready_nodes, 3);
    assert_eq!(inc.total_nodes, 5);

    // Nodes leave: MaxResources lags until the resync.
    view.remove_node("a").await;
    incremental.queues.node_deleted("a", true).await;
    view.remove_node("b").await;
    incremental.queues.node_deleted("b", false).await;

    let inc = incremental.cycle().await;
    let authoritative = full.cycle().await;
    assert_eq!(without_max(authoritative.clone()), without_max(inc.clone()));
    assert_ne!(inc.max_resources, authoritative.max_resources);

    // Three incremental cycles have passed; the next one is a resync.
    let stats = incremental.reconciler.run_cycle().await.unwrap();
    assert_eq!(stats.mode, CycleMode::Full);
    let inc = incremental.store.get("cluster").await.unwrap().resources;
    assert_eq!(full.cycle().await, inc);
}

#[tokio::test]
async fn publish_after_concurrent_write_refetches() {
    let view = Arc::new(MemoryClusterView::new());
    view.upsert_node(NodeView::new("a", res(4, 0), true)).await;
    let mut controller = Controller::new(view, Strategy::Full);
    controller.cycle().await;

    // A second controller for the same cluster writes concurrently.
    let other = ClusterLedger::new(controller.store.clone(), "cluster");
    let current = other.get_or_create().await.unwrap();
    other.update(&current).await.unwrap();

    // Publishing re-fetches, so the next cycle still succeeds.
    let stats = controller.reconciler.run_cycle().await.unwrap();
    assert_eq!(stats.resource_version, current.resource_version + 2);
}
