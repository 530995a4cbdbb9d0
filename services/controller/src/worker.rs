//! Ledger background worker.
//!
//! Runs accounting cycles on a fixed period. Cycles never overlap: the
//! worker owns the reconciler and awaits each cycle before the next tick.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

use crate::reconciler::LedgerReconciler;

/// Worker that drives a [`LedgerReconciler`].
pub struct LedgerWorker {
    reconciler: LedgerReconciler,
    period: Duration,
}

impl LedgerWorker {
    pub fn new(reconciler: LedgerReconciler, period: Duration) -> Self {
        Self { reconciler, period }
    }

    /// Run cycles until shutdown is signaled. Returns the reconciler so
    /// callers can inspect it after shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> LedgerReconciler {
        info!(
            period_ms = self.period.as_millis() as u64,
            strategy = ?self.reconciler.strategy(),
            "Starting ledger worker"
        );

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Ledger worker shutting down");
                        break;
                    }
                }
            }
        }

        self.reconciler
    }

    async fn tick(&mut self) {
        match self.reconciler.run_cycle().await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                warn!(error = %e, "Snapshot changed concurrently, retrying next period");
            }
            Err(e) => {
                error!(error = %e, "Accounting cycle failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::accounting::AccountingPolicy;
    use crate::events::ChangeQueues;
    use crate::ledger::{ClusterLedger, MemoryStore, ObjectStore};
    use crate::reconciler::Strategy;
    use crate::view::{MemoryClusterView, NodeView};
    use clusterinfo_reconcile::BackoffPolicy;
    use clusterinfo_resource::{Quantity, ResourceVector, CPU};

    #[tokio::test]
    async fn test_worker_publishes_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let view = Arc::new(MemoryClusterView::new());
        view.upsert_node(NodeView::new(
            "a",
            ResourceVector::empty().with(CPU, Quantity::from_units(2)),
            true,
        ))
        .await;

        let reconciler = LedgerReconciler::new(
            ClusterLedger::new(store.clone(), "test"),
            view,
            ChangeQueues::new(BackoffPolicy::immediate(), 3),
            Strategy::Full,
            AccountingPolicy::default(),
        );
        let worker = LedgerWorker::new(reconciler, Duration::from_millis(10));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let snapshot = store.get("test").await.unwrap();
        assert!(snapshot.resource_version >= 2);
        assert_eq!(snapshot.resources.ready_nodes, 1);
    }
}
