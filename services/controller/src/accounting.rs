//! Resource accounting index.
//!
//! The index holds the last seen allocatable of every node and the request of
//! every live workload, together with the running aggregates derived from
//! them. Both reconciliation strategies go through it: a full recompute
//! rebuilds it from lists, an incremental cycle applies one entity at a time.
//! Because both paths share the same rules they publish identical snapshots
//! for identical cluster state (MaxResources aside, see [`AccountingIndex::upsert_node`]).

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use clusterinfo_resource::{Quantity, ResourceError, ResourceVector, GIGABYTE};

use crate::snapshot::{IdleHistogram, ResourcesInfo};
use crate::view::{NodeView, WorkloadId, WorkloadView};

/// Name of the node registered by virtual kubelets.
pub const DEFAULT_VIRTUAL_NODE: &str = "virtual-kubelet";

/// A histogram threshold, published under the text it was configured with
/// (`"20"`, `"10Gi"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Threshold {
    label: String,
    quantity: Quantity,
}

impl Threshold {
    pub fn new(label: impl Into<String>, quantity: Quantity) -> Self {
        Self {
            label: label.into(),
            quantity,
        }
    }

    /// A whole-unit threshold labelled by its number.
    pub fn units(units: u64) -> Self {
        Self::new(units.to_string(), Quantity::from_units(units))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }
}

impl FromStr for Threshold {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim();
        Ok(Self::new(label, label.parse()?))
    }
}

/// Aggregation rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingPolicy {
    /// Nodes with this name never contribute capacity.
    pub virtual_node: String,

    /// Ascending idle CPU thresholds for the histogram.
    pub cpu_thresholds: Vec<Threshold>,

    /// Ascending idle memory thresholds for the histogram.
    pub memory_thresholds: Vec<Threshold>,

    /// Published memory totals are floored to a multiple of this.
    pub memory_granularity: Quantity,
}

impl Default for AccountingPolicy {
    fn default() -> Self {
        const GI: u64 = 1 << 30;
        Self {
            virtual_node: DEFAULT_VIRTUAL_NODE.to_string(),
            cpu_thresholds: [20, 40, 60].map(Threshold::units).to_vec(),
            memory_thresholds: vec![
                Threshold::new("10Gi", Quantity::from_units(10 * GI)),
                Threshold::new("40Gi", Quantity::from_units(40 * GI)),
                Threshold::new("80Gi", Quantity::from_units(80 * GI)),
            ],
            memory_granularity: GIGABYTE,
        }
    }
}

impl AccountingPolicy {
    /// Whether `node` adds to Allocatable, ReadyNodes and MaxResources.
    pub fn contributes(&self, node: &NodeView) -> bool {
        node.is_ready() && node.name != self.virtual_node
    }
}

#[derive(Debug, Clone)]
struct NodeEntry {
    allocatable: ResourceVector,
    contributing: bool,
}

#[derive(Debug, Clone)]
struct WorkloadEntry {
    node: String,
    request: ResourceVector,
}

/// Running per-node and cluster-wide resource totals.
#[derive(Debug, Clone)]
pub struct AccountingIndex {
    policy: AccountingPolicy,
    nodes: BTreeMap<String, NodeEntry>,
    workloads: HashMap<WorkloadId, WorkloadEntry>,

    /// Requests of live workloads per node name, including nodes that are not
    /// (or not yet) contributing.
    used_by_node: HashMap<String, ResourceVector>,

    allocatable: ResourceVector,
    used: ResourceVector,
    ready_nodes: u32,
    max_resources: ResourceVector,
}

impl AccountingIndex {
    pub fn new(policy: AccountingPolicy) -> Self {
        Self {
            policy,
            nodes: BTreeMap::new(),
            workloads: HashMap::new(),
            used_by_node: HashMap::new(),
            allocatable: ResourceVector::empty(),
            used: ResourceVector::empty(),
            ready_nodes: 0,
            max_resources: ResourceVector::empty(),
        }
    }

    pub fn policy(&self) -> &AccountingPolicy {
        &self.policy
    }

    /// Build an index from complete node and workload lists.
    pub fn from_lists(
        policy: AccountingPolicy,
        nodes: &[NodeView],
        workloads: &[WorkloadView],
    ) -> Result<Self, ResourceError> {
        let mut index = Self::new(policy);
        for node in nodes {
            index.upsert_node(node)?;
        }
        for workload in workloads {
            index.upsert_workload(workload)?;
        }
        Ok(index)
    }

    /// Replace the whole index with one built from complete lists.
    pub fn rebuild(
        &mut self,
        nodes: &[NodeView],
        workloads: &[WorkloadView],
    ) -> Result<(), ResourceError> {
        *self = Self::from_lists(self.policy.clone(), nodes, workloads)?;
        Ok(())
    }

    pub fn total_nodes(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn ready_nodes(&self) -> u32 {
        self.ready_nodes
    }

    pub fn allocatable(&self) -> &ResourceVector {
        &self.allocatable
    }

    pub fn used(&self) -> &ResourceVector {
        &self.used
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn contains_workload(&self, id: &WorkloadId) -> bool {
        self.workloads.contains_key(id)
    }

    /// Record the current state of a node.
    ///
    /// MaxResources only ever grows here; shrinking it requires a rebuild.
    pub fn upsert_node(&mut self, node: &NodeView) -> Result<(), ResourceError> {
        self.withdraw_node(&node.name)?;

        let entry = NodeEntry {
            allocatable: node.allocatable.clone(),
            contributing: self.policy.contributes(node),
        };
        if entry.contributing {
            let allocatable = self.allocatable.add(&entry.allocatable)?;
            let used = match self.used_by_node.get(&node.name) {
                Some(node_used) => self.used.add(node_used)?,
                None => self.used.clone(),
            };
            self.allocatable = allocatable;
            self.used = used;
            self.ready_nodes += 1;
            self.max_resources = self.max_resources.max(&entry.allocatable);
        }
        self.nodes.insert(node.name.clone(), entry);
        Ok(())
    }

    /// Forget a node. Returns false if it was not known.
    pub fn remove_node(&mut self, name: &str) -> Result<bool, ResourceError> {
        self.withdraw_node(name)?;
        Ok(self.nodes.remove(name).is_some())
    }

    /// Take a node's contribution out of the aggregates, leaving the entry
    /// in place but non-contributing.
    fn withdraw_node(&mut self, name: &str) -> Result<(), ResourceError> {
        let Some(entry) = self.nodes.get(name) else {
            return Ok(());
        };
        if !entry.contributing {
            return Ok(());
        }

        let allocatable = self.allocatable.subtract(&entry.allocatable)?;
        let used = match self.used_by_node.get(name) {
            Some(node_used) => self.used.subtract(node_used)?,
            None => self.used.clone(),
        };

        self.allocatable = allocatable;
        self.used = used;
        self.ready_nodes = self.ready_nodes.saturating_sub(1);
        if let Some(entry) = self.nodes.get_mut(name) {
            entry.contributing = false;
        }
        Ok(())
    }

    fn is_contributing(&self, node: &str) -> bool {
        self.nodes.get(node).is_some_and(|entry| entry.contributing)
    }

    /// Record the current state of a workload.
    pub fn upsert_workload(&mut self, workload: &WorkloadView) -> Result<(), ResourceError> {
        let id = workload.id();
        self.remove_workload(&id)?;

        let Some(node) = workload.consuming_node() else {
            return Ok(());
        };
        let request = workload.resource_request()?;

        let node_used = self
            .used_by_node
            .get(node)
            .cloned()
            .unwrap_or_default()
            .add(&request)?;
        let used = if self.is_contributing(node) {
            self.used.add(&request)?
        } else {
            self.used.clone()
        };

        self.used_by_node.insert(node.to_string(), node_used);
        self.used = used;
        self.workloads.insert(
            id,
            WorkloadEntry {
                node: node.to_string(),
                request,
            },
        );
        Ok(())
    }

    /// Forget a workload. Returns false if it was not known.
    pub fn remove_workload(&mut self, id: &WorkloadId) -> Result<bool, ResourceError> {
        let Some(entry) = self.workloads.get(id) else {
            return Ok(false);
        };

        let node_used = self
            .used_by_node
            .get(&entry.node)
            .cloned()
            .unwrap_or_default()
            .subtract(&entry.request)?;
        let used = if self.is_contributing(&entry.node) {
            self.used.subtract(&entry.request)?
        } else {
            self.used.clone()
        };

        if node_used.is_empty() {
            self.used_by_node.remove(&entry.node);
        } else {
            self.used_by_node.insert(entry.node.clone(), node_used);
        }
        self.used = used;
        self.workloads.remove(id);
        Ok(true)
    }

    /// Derive the publishable snapshot.
    ///
    /// Fails if any contributing node is over-committed or the cluster-wide
    /// idle computation would go negative.
    pub fn snapshot(&self) -> Result<ResourcesInfo, ResourceError> {
        let mut nodes_with_idle_cpu = empty_histogram(&self.policy.cpu_thresholds);
        let mut nodes_with_idle_memory = empty_histogram(&self.policy.memory_thresholds);
        let no_usage = ResourceVector::empty();

        for (name, entry) in self.nodes.iter().filter(|(_, e)| e.contributing) {
            let node_used = self.used_by_node.get(name).unwrap_or(&no_usage);
            let node_idle = entry.allocatable.subtract(node_used)?;
            count_above(
                &mut nodes_with_idle_cpu,
                &self.policy.cpu_thresholds,
                node_idle.cpu(),
            );
            count_above(
                &mut nodes_with_idle_memory,
                &self.policy.memory_thresholds,
                node_idle.memory(),
            );
        }

        let idle = self.allocatable.subtract(&self.used)?;
        let average_per_node = if self.ready_nodes == 0 {
            ResourceVector::empty()
        } else {
            self.allocatable.divide_by(u64::from(self.ready_nodes))
        };

        let granularity = self.policy.memory_granularity;
        Ok(ResourcesInfo {
            allocatable: self.allocatable.floor_memory(granularity),
            used: self.used.floor_memory(granularity),
            idle: idle.floor_memory(granularity),
            total_nodes: self.total_nodes(),
            ready_nodes: self.ready_nodes,
            average_per_node,
            max_resources: self.max_resources.clone(),
            nodes_with_idle_cpu,
            nodes_with_idle_memory,
        })
    }
}

fn empty_histogram(thresholds: &[Threshold]) -> IdleHistogram {
    thresholds.iter().map(|t| (t.label.clone(), 0)).collect()
}

/// Non-exclusive buckets: a value is counted under every threshold it
/// strictly exceeds.
fn count_above(histogram: &mut IdleHistogram, thresholds: &[Threshold], value: Quantity) {
    for threshold in thresholds.iter().filter(|t| value > t.quantity) {
        *histogram.entry(threshold.label.clone()).or_default() += 1;
    }
}
