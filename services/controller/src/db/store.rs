//! Postgres-backed snapshot store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

use super::DbError;
use crate::ledger::{ObjectStore, StoreError};
use crate::snapshot::{ClusterSnapshot, ResourcesInfo};

struct SnapshotRow {
    cluster_id: String,
    resource_version: i64,
    resources: Json<ResourcesInfo>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for SnapshotRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            cluster_id: row.try_get("cluster_id")?,
            resource_version: row.try_get("resource_version")?,
            resources: row.try_get("resources")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<SnapshotRow> for ClusterSnapshot {
    fn from(row: SnapshotRow) -> Self {
        Self {
            cluster_id: row.cluster_id,
            resource_version: row.resource_version,
            updated_at: Some(row.updated_at),
            resources: row.resources.0,
        }
    }
}

/// Snapshot store over the `cluster_info` table.
#[derive(Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_version(&self, cluster_id: &str) -> Result<Option<i64>, DbError> {
        sqlx::query_scalar("SELECT resource_version FROM cluster_info WHERE cluster_id = $1")
            .bind(cluster_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)
    }
}

#[async_trait]
impl ObjectStore for PgSnapshotStore {
    async fn get(&self, cluster_id: &str) -> Result<ClusterSnapshot, StoreError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT cluster_id, resource_version, resources, updated_at
            FROM cluster_info
            WHERE cluster_id = $1
            "#,
        )
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        row.map(ClusterSnapshot::from)
            .ok_or_else(|| StoreError::NotFound(cluster_id.to_string()))
    }

    async fn create(&self, snapshot: &ClusterSnapshot) -> Result<ClusterSnapshot, StoreError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            INSERT INTO cluster_info (cluster_id, resource_version, resources, updated_at)
            VALUES ($1, 1, $2, now())
            ON CONFLICT (cluster_id) DO NOTHING
            RETURNING cluster_id, resource_version, resources, updated_at
            "#,
        )
        .bind(&snapshot.cluster_id)
        .bind(Json(&snapshot.resources))
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        row.map(ClusterSnapshot::from)
            .ok_or_else(|| StoreError::AlreadyExists(snapshot.cluster_id.clone()))
    }

    async fn update(&self, snapshot: &ClusterSnapshot) -> Result<ClusterSnapshot, StoreError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            UPDATE cluster_info
            SET resources = $3,
                resource_version = resource_version + 1,
                updated_at = now()
            WHERE cluster_id = $1 AND resource_version = $2
            RETURNING cluster_id, resource_version, resources, updated_at
            "#,
        )
        .bind(&snapshot.cluster_id)
        .bind(snapshot.resource_version)
        .bind(Json(&snapshot.resources))
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        if let Some(row) = row {
            return Ok(row.into());
        }

        // Nothing matched: either the row is gone or its version moved on.
        match self.current_version(&snapshot.cluster_id).await? {
            Some(actual) => {
                debug!(
                    cluster_id = %snapshot.cluster_id,
                    expected = snapshot.resource_version,
                    actual,
                    "Snapshot version conflict"
                );
                Err(StoreError::Conflict {
                    cluster_id: snapshot.cluster_id.clone(),
                    expected: snapshot.resource_version,
                    actual,
                })
            }
            None => Err(StoreError::NotFound(snapshot.cluster_id.clone())),
        }
    }
}
