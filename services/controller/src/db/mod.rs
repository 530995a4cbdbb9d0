//! Postgres adapters.
//!
//! This module provides:
//! - Connection pool management and migrations
//! - [`PgSnapshotStore`], the snapshot [`ObjectStore`](crate::ledger::ObjectStore)
//! - [`PgClusterView`], a [`ClusterView`](crate::view::ClusterView) over
//!   node and workload tables
//! - [`ChangeFeed`], which turns the change log into queue events

mod error;
mod feed;
mod store;
mod view;

pub use error::DbError;
pub use feed::{events_from_row, ChangeFeed, ChangeRow};
pub use store::PgSnapshotStore;
pub use view::PgClusterView;

use anyhow::Context;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/clusterinfo";

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Read `DATABASE_URL`, `DB_MAX_CONNECTIONS` and `DB_MIN_CONNECTIONS`.
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL").unwrap_or(defaults.database_url.clone());

        let max_connections = match lookup("DB_MAX_CONNECTIONS") {
            Some(v) => v.parse().context("invalid DB_MAX_CONNECTIONS")?,
            None => defaults.max_connections,
        };

        let min_connections = match lookup("DB_MIN_CONNECTIONS") {
            Some(v) => v.parse().context("invalid DB_MIN_CONNECTIONS")?,
            None => defaults.min_connections,
        };

        Ok(Self {
            database_url,
            max_connections,
            min_connections,
            ..defaults
        })
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the first migrations directory found.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/controller/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(&self.pool).await.map_err(DbError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(DbError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Get a snapshot store handle.
    pub fn snapshot_store(&self) -> PgSnapshotStore {
        PgSnapshotStore::new(self.pool.clone())
    }

    /// Get a cluster view handle.
    pub fn cluster_view(&self) -> PgClusterView {
        PgClusterView::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.min_connections, 1);
    }

    #[test]
    fn test_db_config_overrides() {
        let config = DbConfig::from_lookup(|key| match key {
            "DB_MAX_CONNECTIONS" => Some("20".to_string()),
            "DB_MIN_CONNECTIONS" => Some("2".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.min_connections, 2);
    }

    #[test]
    fn test_db_config_rejects_malformed_numbers() {
        let result = DbConfig::from_lookup(|key| match key {
            "DB_MIN_CONNECTIONS" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert!(result.is_err());
    }
}
