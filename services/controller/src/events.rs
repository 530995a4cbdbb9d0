//! Change events and the queues that carry them to the reconciler.
//!
//! Producers call the `*_added` / `*_updated` / `*_deleted` functions on
//! [`ChangeQueues`]; the reconciler drains the queues once per cycle. An
//! update is always enqueued as a delete-then-add pair under a single queue
//! lock, so a drain sees both halves or neither.

use std::fmt;
use std::sync::Arc;

use clusterinfo_reconcile::{BackoffPolicy, WorkQueue};

use crate::view::WorkloadId;

/// Direction of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventOp {
    Add,
    Delete,
}

impl EventOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOp::Add => "add",
            EventOp::Delete => "delete",
        }
    }
}

impl fmt::Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeEvent {
    pub name: String,

    /// Readiness as observed by the producer.
    pub ready: bool,
    pub op: EventOp,
}

/// A workload changed. Its request is re-read from the view when processed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadEvent {
    pub id: WorkloadId,
    pub op: EventOp,
}

/// Any change the ledger reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Node(NodeEvent),
    Workload(WorkloadEvent),
}

impl ChangeEvent {
    pub fn node(name: impl Into<String>, ready: bool, op: EventOp) -> Self {
        ChangeEvent::Node(NodeEvent {
            name: name.into(),
            ready,
            op,
        })
    }

    pub fn workload(id: WorkloadId, op: EventOp) -> Self {
        ChangeEvent::Workload(WorkloadEvent { id, op })
    }
}

/// The node and workload queues.
///
/// Cheap to clone; clones share the same queues.
#[derive(Debug, Clone)]
pub struct ChangeQueues {
    pub nodes: Arc<WorkQueue<NodeEvent>>,
    pub workloads: Arc<WorkQueue<WorkloadEvent>>,
}

impl ChangeQueues {
    pub fn new(backoff: BackoffPolicy, max_retries: u32) -> Self {
        Self {
            nodes: Arc::new(WorkQueue::new("nodes", backoff.clone(), max_retries)),
            workloads: Arc::new(WorkQueue::new("workloads", backoff, max_retries)),
        }
    }

    /// Enqueue a single event on the queue for its kind.
    pub async fn push(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Node(ev) => self.nodes.add(ev).await,
            ChangeEvent::Workload(ev) => self.workloads.add(ev).await,
        }
    }

    /// Enqueue several events, keeping per-kind order. Events of one kind
    /// are enqueued under a single lock.
    pub async fn push_batch(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        let mut nodes = Vec::new();
        let mut workloads = Vec::new();
        for event in events {
            match event {
                ChangeEvent::Node(ev) => nodes.push(ev),
                ChangeEvent::Workload(ev) => workloads.push(ev),
            }
        }
        if !nodes.is_empty() {
            self.nodes.add_batch(nodes).await;
        }
        if !workloads.is_empty() {
            self.workloads.add_batch(workloads).await;
        }
    }

    pub async fn node_added(&self, name: &str, ready: bool) {
        self.nodes
            .add(NodeEvent {
                name: name.to_string(),
                ready,
                op: EventOp::Add,
            })
            .await;
    }

    pub async fn node_updated(&self, name: &str, was_ready: bool, ready: bool) {
        self.nodes
            .add_batch([
                NodeEvent {
                    name: name.to_string(),
                    ready: was_ready,
                    op: EventOp::Delete,
                },
                NodeEvent {
                    name: name.to_string(),
                    ready,
                    op: EventOp::Add,
                },
            ])
            .await;
    }

    pub async fn node_deleted(&self, name: &str, ready: bool) {
        self.nodes
            .add(NodeEvent {
                name: name.to_string(),
                ready,
                op: EventOp::Delete,
            })
            .await;
    }

    pub async fn workload_added(&self, id: &WorkloadId) {
        self.workloads
            .add(WorkloadEvent {
                id: id.clone(),
                op: EventOp::Add,
            })
            .await;
    }

    pub async fn workload_updated(&self, id: &WorkloadId) {
        self.workloads
            .add_batch([
                WorkloadEvent {
                    id: id.clone(),
                    op: EventOp::Delete,
                },
                WorkloadEvent {
                    id: id.clone(),
                    op: EventOp::Add,
                },
            ])
            .await;
    }

    pub async fn workload_deleted(&self, id: &WorkloadId) {
        self.workloads
            .add(WorkloadEvent {
                id: id.clone(),
                op: EventOp::Delete,
            })
            .await;
    }

    /// Number of events ready in both queues.
    pub async fn pending(&self) -> usize {
        self.nodes.len().await + self.workloads.len().await
    }

    pub async fn shut_down(&self) {
        self.nodes.shut_down().await;
        self.workloads.shut_down().await;
    }
}
