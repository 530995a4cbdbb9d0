//! Live node and workload views.
//!
//! The controller never owns node or workload state; it reads it through a
//! [`ClusterView`] at processing time. Events only say *which* entity
//! changed, the view says what it looks like now.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use clusterinfo_resource::{ResourceError, ResourceVector};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{EventError, ViewError};

/// A node condition as reported by the node itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCondition {
    Ready,
    NotReady,
    MemoryPressure,
    DiskPressure,
    PidPressure,
    NetworkUnavailable,
}

/// A schedulable machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub name: String,
    pub allocatable: ResourceVector,

    /// Conditions in the order they were reported; the last one is current.
    pub conditions: Vec<NodeCondition>,
}

impl NodeView {
    pub fn new(name: impl Into<String>, allocatable: ResourceVector, ready: bool) -> Self {
        let condition = if ready {
            NodeCondition::Ready
        } else {
            NodeCondition::NotReady
        };
        Self {
            name: name.into(),
            allocatable,
            conditions: vec![condition],
        }
    }

    /// A node is ready iff its most recent condition is `Ready`.
    pub fn is_ready(&self) -> bool {
        matches!(self.conditions.last(), Some(NodeCondition::Ready))
    }
}

/// Workload lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkloadPhase {
    /// Terminal workloads hold no resources.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for WorkloadPhase {
    type Err = ViewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "unknown" => Ok(Self::Unknown),
            other => Err(ViewError::Malformed {
                kind: "workload phase",
                key: other.to_string(),
                reason: "unrecognized phase".to_string(),
            }),
        }
    }
}

/// Workload identity: `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadId {
    pub namespace: String,
    pub name: String,
}

impl WorkloadId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for WorkloadId {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(EventError::InvalidEvent(format!(
                "workload id '{s}' is not of the form namespace/name"
            ))),
        }
    }
}

/// A unit of work bound (or about to be bound) to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadView {
    pub namespace: String,
    pub name: String,

    /// Node the workload is bound to, if scheduled.
    pub node_name: Option<String>,
    pub phase: WorkloadPhase,

    /// Resource requests of the regular containers.
    pub containers: Vec<ResourceVector>,

    /// Resource requests of the init containers, which run one at a time.
    pub init_containers: Vec<ResourceVector>,
}

impl WorkloadView {
    pub fn id(&self) -> WorkloadId {
        WorkloadId::new(&self.namespace, &self.name)
    }

    /// Effective resource request.
    ///
    /// Regular containers run together, so their requests are summed. Init
    /// containers run sequentially before them, so the peak is the larger of
    /// that sum and any single init container.
    pub fn resource_request(&self) -> Result<ResourceVector, ResourceError> {
        let steady = ResourceVector::try_sum(&self.containers)?;
        Ok(self
            .init_containers
            .iter()
            .fold(steady, |peak, init| peak.max(init)))
    }

    /// Returns the node this workload consumes resources on, if any.
    pub fn consuming_node(&self) -> Option<&str> {
        if self.phase.is_terminal() {
            return None;
        }
        self.node_name.as_deref().filter(|n| !n.is_empty())
    }
}

/// Read access to current node and workload state.
#[async_trait]
pub trait ClusterView: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeView>, ViewError>;

    async fn get_node(&self, name: &str) -> Result<Option<NodeView>, ViewError>;

    async fn list_workloads(&self) -> Result<Vec<WorkloadView>, ViewError>;

    async fn get_workload(&self, id: &WorkloadId) -> Result<Option<WorkloadView>, ViewError>;
}

/// In-process view, fed directly by whoever observes the cluster.
#[derive(Debug, Default)]
pub struct MemoryClusterView {
    nodes: RwLock<BTreeMap<String, NodeView>>,
    workloads: RwLock<BTreeMap<WorkloadId, WorkloadView>>,
}

impl MemoryClusterView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node, returning the previous version.
    pub async fn upsert_node(&self, node: NodeView) -> Option<NodeView> {
        self.nodes.write().await.insert(node.name.clone(), node)
    }

    pub async fn remove_node(&self, name: &str) -> Option<NodeView> {
        self.nodes.write().await.remove(name)
    }

    /// Insert or replace a workload, returning the previous version.
    pub async fn upsert_workload(&self, workload: WorkloadView) -> Option<WorkloadView> {
        self.workloads.write().await.insert(workload.id(), workload)
    }

    pub async fn remove_workload(&self, id: &WorkloadId) -> Option<WorkloadView> {
        self.workloads.write().await.remove(id)
    }
}

#[async_trait]
impl ClusterView for MemoryClusterView {
    async fn list_nodes(&self) -> Result<Vec<NodeView>, ViewError> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeView>, ViewError> {
        Ok(self.nodes.read().await.get(name).cloned())
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadView>, ViewError> {
        Ok(self.workloads.read().await.values().cloned().collect())
    }

    async fn get_workload(&self, id: &WorkloadId) -> Result<Option<WorkloadView>, ViewError> {
        Ok(self.workloads.read().await.get(id).cloned())
    }
}
