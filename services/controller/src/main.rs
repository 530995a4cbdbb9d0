//! clusterinfo controller
//!
//! Keeps the cluster resource snapshot up to date. Node and workload state
//! is read from Postgres, changes arrive through the change log, and the
//! aggregate is written back to the `cluster_info` table every period.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clusterinfo_controller::{
    config::Config,
    db::{ChangeFeed, Database},
    ChangeQueues, ClusterLedger, LedgerReconciler, LedgerWorker,
};
use clusterinfo_reconcile::BackoffPolicy;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CLUSTERINFO_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        cluster_id = %config.cluster_id,
        period_ms = config.period.as_millis() as u64,
        strategy = ?config.strategy,
        "Starting clusterinfo controller"
    );

    let db = match Database::connect(&config.database).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    // The snapshot must exist before the first cycle; failing to reach the
    // store here is the only fatal condition.
    let ledger = ClusterLedger::new(Arc::new(db.snapshot_store()), &config.cluster_id);
    let startup_backoff = BackoffPolicy {
        base: Duration::from_millis(500),
        max: Duration::from_secs(30),
        jitter: 0.1,
    };
    let snapshot = match ledger
        .initialize(config.startup_attempts, &startup_backoff)
        .await
    {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "Failed to initialize cluster snapshot");
            return Err(e.into());
        }
    };
    info!(
        resource_version = snapshot.resource_version,
        "Cluster snapshot ready"
    );

    let queues = ChangeQueues::new(BackoffPolicy::default(), config.max_retries);
    let feed = ChangeFeed::at_head(db.pool().clone(), queues.clone(), config.feed_poll_interval)
        .await?;
    let reconciler = LedgerReconciler::new(
        ledger,
        Arc::new(db.cluster_view()),
        queues.clone(),
        config.strategy,
        config.accounting_policy(),
    );
    let worker = LedgerWorker::new(reconciler, config.period);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let feed_handle = tokio::spawn(feed.run(shutdown_rx.clone()));
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    queues.shut_down().await;

    let shutdown_timeout = Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, feed_handle).await.is_err() {
        warn!("Change feed did not shut down in time");
    }
    if tokio::time::timeout(shutdown_timeout, worker_handle).await.is_err() {
        warn!("Ledger worker did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}
