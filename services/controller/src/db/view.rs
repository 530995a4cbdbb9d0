//! Postgres-backed cluster view over `cluster_nodes` and `cluster_workloads`.

use async_trait::async_trait;
use clusterinfo_resource::ResourceVector;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;

use super::DbError;
use crate::error::ViewError;
use crate::view::{ClusterView, NodeCondition, NodeView, WorkloadId, WorkloadPhase, WorkloadView};

struct NodeRow {
    name: String,
    allocatable: serde_json::Value,
    conditions: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            allocatable: row.try_get("allocatable")?,
            conditions: row.try_get("conditions")?,
        })
    }
}

impl TryFrom<NodeRow> for NodeView {
    type Error = ViewError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let malformed = |reason: serde_json::Error| ViewError::Malformed {
            kind: "node",
            key: row.name.clone(),
            reason: reason.to_string(),
        };
        let allocatable: ResourceVector =
            serde_json::from_value(row.allocatable).map_err(malformed)?;
        let conditions: Vec<NodeCondition> =
            serde_json::from_value(row.conditions).map_err(malformed)?;

        Ok(NodeView {
            name: row.name,
            allocatable,
            conditions,
        })
    }
}

struct WorkloadRow {
    namespace: String,
    name: String,
    node_name: Option<String>,
    phase: String,
    containers: serde_json::Value,
    init_containers: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, PgRow> for WorkloadRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            namespace: row.try_get("namespace")?,
            name: row.try_get("name")?,
            node_name: row.try_get("node_name")?,
            phase: row.try_get("phase")?,
            containers: row.try_get("containers")?,
            init_containers: row.try_get("init_containers")?,
        })
    }
}

impl TryFrom<WorkloadRow> for WorkloadView {
    type Error = ViewError;

    fn try_from(row: WorkloadRow) -> Result<Self, Self::Error> {
        let key = format!("{}/{}", row.namespace, row.name);
        let malformed = |reason: String| ViewError::Malformed {
            kind: "workload",
            key: key.clone(),
            reason,
        };

        let phase = row
            .phase
            .parse::<WorkloadPhase>()
            .map_err(|e| malformed(e.to_string()))?;
        let containers: Vec<ResourceVector> = serde_json::from_value(row.containers)
            .map_err(|e| malformed(e.to_string()))?;
        let init_containers: Vec<ResourceVector> = serde_json::from_value(row.init_containers)
            .map_err(|e| malformed(e.to_string()))?;

        Ok(WorkloadView {
            namespace: row.namespace,
            name: row.name,
            node_name: row.node_name,
            phase,
            containers,
            init_containers,
        })
    }
}

/// Rows that fail to decode are skipped in listings so that one bad row
/// cannot block a full recompute.
fn decode_all<R, T>(rows: Vec<R>) -> Vec<T>
where
    T: TryFrom<R, Error = ViewError>,
{
    rows.into_iter()
        .filter_map(|row| match T::try_from(row) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Skipping malformed row");
                None
            }
        })
        .collect()
}

/// Cluster view backed by Postgres tables.
#[derive(Clone)]
pub struct PgClusterView {
    pool: PgPool,
}

impl PgClusterView {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClusterView for PgClusterView {
    async fn list_nodes(&self) -> Result<Vec<NodeView>, ViewError> {
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT name, allocatable, conditions FROM cluster_nodes ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(decode_all(rows))
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeView>, ViewError> {
        let row = sqlx::query_as::<_, NodeRow>(
            "SELECT name, allocatable, conditions FROM cluster_nodes WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        row.map(NodeView::try_from).transpose()
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadView>, ViewError> {
        let rows = sqlx::query_as::<_, WorkloadRow>(
            r#"
            SELECT namespace, name, node_name, phase, containers, init_containers
            FROM cluster_workloads
            ORDER BY namespace, name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(decode_all(rows))
    }

    async fn get_workload(&self, id: &WorkloadId) -> Result<Option<WorkloadView>, ViewError> {
        let row = sqlx::query_as::<_, WorkloadRow>(
            r#"
            SELECT namespace, name, node_name, phase, containers, init_containers
            FROM cluster_workloads
            WHERE namespace = $1 AND name = $2
            "#,
        )
        .bind(&id.namespace)
        .bind(&id.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        row.map(WorkloadView::try_from).transpose()
    }
}
