//! The cluster ledger: access to the persisted singleton snapshot.
//!
//! The ledger owns no storage. It is a handle over an [`ObjectStore`]
//! injected at construction, and adds the get-or-create and
//! fetch-then-compare-and-replace protocols on top of it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use clusterinfo_reconcile::BackoffPolicy;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::snapshot::{ClusterSnapshot, ResourcesInfo};

/// Errors returned by an [`ObjectStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("snapshot '{0}' not found")]
    NotFound(String),

    #[error("snapshot '{0}' already exists")]
    AlreadyExists(String),

    /// The stored version differs from the one the caller read.
    #[error("conflict on '{cluster_id}': expected version {expected}, found {actual}")]
    Conflict {
        cluster_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors returned by the [`ClusterLedger`].
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Someone else updated the snapshot since it was read.
    #[error("snapshot '{cluster_id}' changed concurrently (expected version {expected}, found {actual})")]
    Conflict {
        cluster_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("snapshot '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Store(StoreError),

    /// The store could not be reached within the startup retry budget.
    #[error("store unreachable after {attempts} attempts: {last_error}")]
    Unreachable { attempts: u32, last_error: StoreError },
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                cluster_id,
                expected,
                actual,
            } => LedgerError::Conflict {
                cluster_id,
                expected,
                actual,
            },
            StoreError::NotFound(id) => LedgerError::NotFound(id),
            other => LedgerError::Store(other),
        }
    }
}

/// Persistent storage for cluster snapshots.
///
/// `update` is an optimistic compare-and-replace on `resource_version`: it
/// succeeds only if the stored version equals the snapshot's, and returns the
/// stored record with the bumped version.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, cluster_id: &str) -> Result<ClusterSnapshot, StoreError>;

    async fn create(&self, snapshot: &ClusterSnapshot) -> Result<ClusterSnapshot, StoreError>;

    async fn update(&self, snapshot: &ClusterSnapshot) -> Result<ClusterSnapshot, StoreError>;
}

/// In-process [`ObjectStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, ClusterSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, cluster_id: &str) -> Result<ClusterSnapshot, StoreError> {
        self.snapshots
            .lock()
            .await
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(cluster_id.to_string()))
    }

    async fn create(&self, snapshot: &ClusterSnapshot) -> Result<ClusterSnapshot, StoreError> {
        let mut snapshots = self.snapshots.lock().await;
        if snapshots.contains_key(&snapshot.cluster_id) {
            return Err(StoreError::AlreadyExists(snapshot.cluster_id.clone()));
        }
        let mut created = snapshot.clone();
        created.resource_version = 1;
        created.updated_at = Some(Utc::now());
        snapshots.insert(created.cluster_id.clone(), created.clone());
        Ok(created)
    }

    async fn update(&self, snapshot: &ClusterSnapshot) -> Result<ClusterSnapshot, StoreError> {
        let mut snapshots = self.snapshots.lock().await;
        let stored = snapshots
            .get_mut(&snapshot.cluster_id)
            .ok_or_else(|| StoreError::NotFound(snapshot.cluster_id.clone()))?;

        if stored.resource_version != snapshot.resource_version {
            return Err(StoreError::Conflict {
                cluster_id: snapshot.cluster_id.clone(),
                expected: snapshot.resource_version,
                actual: stored.resource_version,
            });
        }

        stored.resources = snapshot.resources.clone();
        stored.resource_version += 1;
        stored.updated_at = Some(Utc::now());
        Ok(stored.clone())
    }
}

/// Handle to one cluster's snapshot.
#[derive(Clone)]
pub struct ClusterLedger {
    store: Arc<dyn ObjectStore>,
    cluster_id: String,
}

impl ClusterLedger {
    pub fn new(store: Arc<dyn ObjectStore>, cluster_id: impl Into<String>) -> Self {
        Self {
            store,
            cluster_id: cluster_id.into(),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Return the snapshot, creating a zero-valued one if absent.
    ///
    /// Losing a creation race to another controller is not an error: the
    /// winner's record is fetched and returned.
    pub async fn get_or_create(&self) -> Result<ClusterSnapshot, LedgerError> {
        match self.store.get(&self.cluster_id).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let zero = ClusterSnapshot::zero(&self.cluster_id);
        match self.store.create(&zero).await {
            Ok(created) => {
                info!(cluster_id = %self.cluster_id, "Created cluster snapshot");
                Ok(created)
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!(cluster_id = %self.cluster_id, "Snapshot created concurrently");
                Ok(self.store.get(&self.cluster_id).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Compare-and-replace the snapshot.
    pub async fn update(&self, snapshot: &ClusterSnapshot) -> Result<ClusterSnapshot, LedgerError> {
        Ok(self.store.update(snapshot).await?)
    }

    /// Replace the stored resources with `resources`.
    ///
    /// Re-fetches the current record first so the update is made against the
    /// latest version. A conflict is returned to the caller, never retried
    /// here.
    pub async fn publish(&self, resources: ResourcesInfo) -> Result<ClusterSnapshot, LedgerError> {
        let mut snapshot = self.get_or_create().await?;
        snapshot.resources = resources;
        self.update(&snapshot).await
    }

    /// Get or create the snapshot at startup, retrying with backoff.
    #[instrument(skip(self, backoff), fields(cluster_id = %self.cluster_id))]
    pub async fn initialize(
        &self,
        attempts: u32,
        backoff: &BackoffPolicy,
    ) -> Result<ClusterSnapshot, LedgerError> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.get_or_create().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(LedgerError::Store(err)) => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(LedgerError::Unreachable {
                            attempts,
                            last_error: err,
                        });
                    }
                    let delay = backoff.delay(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Snapshot store unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl std::fmt::Debug for ClusterLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLedger")
            .field("cluster_id", &self.cluster_id)
            .finish_non_exhaustive()
    }
}
