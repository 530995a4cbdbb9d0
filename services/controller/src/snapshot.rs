//! The persisted cluster resource snapshot.
//!
//! There is exactly one snapshot per cluster. Consumers should expect memory
//! totals floored to whole gigabytes and non-exclusive histogram buckets: a
//! node with 50 idle cores is counted under both the 20 and 40 thresholds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use clusterinfo_resource::ResourceVector;
use serde::{Deserialize, Serialize};

/// Default name of the singleton snapshot.
pub const DEFAULT_CLUSTER_ID: &str = "cluster-resources-info";

/// Threshold histogram: configured threshold text (`"20"`, `"10Gi"`) ->
/// number of nodes whose idle amount strictly exceeds it.
pub type IdleHistogram = BTreeMap<String, u32>;

/// Aggregate resource information for a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesInfo {
    /// Sum of allocatable resources over ready nodes.
    pub allocatable: ResourceVector,

    /// Resources requested by live workloads on ready nodes.
    pub used: ResourceVector,

    /// Allocatable minus used.
    pub idle: ResourceVector,

    /// Number of nodes known to the cluster.
    pub total_nodes: u32,

    /// Number of nodes contributing capacity.
    pub ready_nodes: u32,

    /// Allocatable divided by the number of ready nodes.
    pub average_per_node: ResourceVector,

    /// Per-dimension maximum allocatable over ready nodes.
    pub max_resources: ResourceVector,

    #[serde(rename = "nodesWithIdleCPU")]
    pub nodes_with_idle_cpu: IdleHistogram,

    #[serde(rename = "nodesWithIdleMem")]
    pub nodes_with_idle_memory: IdleHistogram,
}

/// The persisted singleton record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub cluster_id: String,

    /// Optimistic concurrency token; bumped by the store on every update.
    pub resource_version: i64,

    pub updated_at: Option<DateTime<Utc>>,

    pub resources: ResourcesInfo,
}

impl ClusterSnapshot {
    /// A zero-valued snapshot, as created on first start.
    pub fn zero(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            resource_version: 0,
            updated_at: None,
            resources: ResourcesInfo::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterinfo_resource::{Quantity, CPU};

    #[test]
    fn test_resources_info_json_field_names() {
        let mut info = ResourcesInfo {
            allocatable: ResourceVector::empty().with(CPU, Quantity::from_units(8)),
            total_nodes: 2,
            ready_nodes: 2,
            ..Default::default()
        };
        info.nodes_with_idle_cpu.insert("20".to_string(), 1);
        info.nodes_with_idle_memory.insert("10Gi".to_string(), 0);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["allocatable"]["cpu"], "8");
        assert_eq!(json["totalNodes"], 2);
        assert_eq!(json["readyNodes"], 2);
        assert_eq!(json["nodesWithIdleCPU"]["20"], 1);
        assert_eq!(json["nodesWithIdleMem"]["10Gi"], 0);

        let back: ResourcesInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_zero_snapshot() {
        let snapshot = ClusterSnapshot::zero(DEFAULT_CLUSTER_ID);
        assert_eq!(snapshot.resource_version, 0);
        assert_eq!(snapshot.resources, ResourcesInfo::default());
    }
}
