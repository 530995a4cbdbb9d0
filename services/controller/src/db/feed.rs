//! Change feed over the `cluster_change_log` table.
//!
//! The feed polls for rows after its checkpoint and translates each into
//! queue events. Rows are consumed once; malformed rows are logged and
//! skipped so that they never block the feed.
//!
//! `event_id` is assigned when a row is inserted, not when it commits, so a
//! row can become visible after a higher id was already consumed. Each poll
//! therefore also re-reads a trailing window of ids below the checkpoint and
//! picks up any it has not seen. A row that commits later than that window
//! is only reflected by the reconciler's next full resync.

use std::collections::BTreeSet;
use std::time::Duration;

use clusterinfo_reconcile::Checkpoint;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::DbError;
use crate::error::EventError;
use crate::events::{ChangeEvent, ChangeQueues, EventOp};
use crate::view::WorkloadId;

/// Maximum rows read per poll.
const DEFAULT_BATCH_SIZE: i64 = 500;

/// Ids below the checkpoint re-read on every poll.
const DEFAULT_LOOKBACK: i64 = 1_000;

/// Ids already consumed inside the trailing window.
#[derive(Debug, Clone)]
struct RecentIds {
    /// Ids at or below this predate the feed and are never read.
    start: i64,
    lookback: i64,
    ids: BTreeSet<i64>,
}

impl RecentIds {
    fn new(start: i64, lookback: i64) -> Self {
        Self {
            start,
            lookback,
            ids: BTreeSet::new(),
        }
    }

    /// Exclusive lower bound of the next read.
    fn floor(&self, checkpoint: i64) -> i64 {
        checkpoint.saturating_sub(self.lookback).max(self.start)
    }

    fn contains(&self, event_id: i64) -> bool {
        self.ids.contains(&event_id)
    }

    fn record(&mut self, event_id: i64) {
        self.ids.insert(event_id);
    }

    /// Forget ids that have fallen out of the window.
    fn prune(&mut self, checkpoint: i64) {
        let floor = self.floor(checkpoint);
        self.ids = self.ids.split_off(&floor.saturating_add(1));
    }

    fn to_vec(&self) -> Vec<i64> {
        self.ids.iter().copied().collect()
    }
}

/// One row of the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRow {
    pub event_id: i64,
    pub kind: String,
    pub entity_key: String,
    pub op: String,
    pub ready: Option<bool>,
    pub was_ready: Option<bool>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ChangeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            kind: row.try_get("kind")?,
            entity_key: row.try_get("entity_key")?,
            op: row.try_get("op")?,
            ready: row.try_get("ready")?,
            was_ready: row.try_get("was_ready")?,
        })
    }
}

/// Translate a change log row into the events it stands for.
///
/// An `update` becomes a delete of the old state followed by an add of the
/// new one.
pub fn events_from_row(row: &ChangeRow) -> Result<Vec<ChangeEvent>, EventError> {
    if row.entity_key.is_empty() {
        return Err(EventError::InvalidEvent(format!(
            "change {} has an empty entity key",
            row.event_id
        )));
    }

    let ops: &[EventOp] = match row.op.as_str() {
        "add" => &[EventOp::Add],
        "delete" => &[EventOp::Delete],
        "update" => &[EventOp::Delete, EventOp::Add],
        other => {
            return Err(EventError::InvalidEvent(format!(
                "change {} has unknown op '{other}'",
                row.event_id
            )))
        }
    };

    match row.kind.as_str() {
        "node" => {
            let ready = row.ready.unwrap_or(false);
            let was_ready = row.was_ready.unwrap_or(ready);
            Ok(ops
                .iter()
                .map(|op| {
                    let readiness = match (row.op.as_str(), op) {
                        ("update", EventOp::Delete) => was_ready,
                        _ => ready,
                    };
                    ChangeEvent::node(&row.entity_key, readiness, *op)
                })
                .collect())
        }
        "workload" => {
            let id: WorkloadId = row.entity_key.parse()?;
            Ok(ops
                .iter()
                .map(|op| ChangeEvent::workload(id.clone(), *op))
                .collect())
        }
        other => Err(EventError::InvalidEvent(format!(
            "change {} has unknown kind '{other}'",
            row.event_id
        ))),
    }
}

/// Polls the change log and feeds the change queues.
pub struct ChangeFeed {
    pool: PgPool,
    queues: ChangeQueues,
    checkpoint: Checkpoint,
    recent: RecentIds,
    poll_interval: Duration,
    batch_size: i64,
}

impl ChangeFeed {
    /// Create a feed that starts after `last_event_id`.
    pub fn new(
        pool: PgPool,
        queues: ChangeQueues,
        last_event_id: i64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            queues,
            checkpoint: Checkpoint::new(last_event_id),
            recent: RecentIds::new(last_event_id, DEFAULT_LOOKBACK),
            poll_interval,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Create a feed positioned at the current end of the log.
    ///
    /// Earlier changes are covered by the reconciler's initial full rebuild.
    pub async fn at_head(
        pool: PgPool,
        queues: ChangeQueues,
        poll_interval: Duration,
    ) -> Result<Self, DbError> {
        let head: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(event_id), 0) FROM cluster_change_log")
                .fetch_one(&pool)
                .await
                .map_err(DbError::Query)?;
        info!(head, "Change feed positioned at log head");
        Ok(Self::new(pool, queues, head, poll_interval))
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Read and enqueue one batch. Returns the number of rows consumed.
    pub async fn poll_once(&mut self) -> Result<usize, DbError> {
        let rows = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT event_id, kind, entity_key, op, ready, was_ready
            FROM cluster_change_log
            WHERE event_id > $1 AND NOT (event_id = ANY($2))
            ORDER BY event_id
            LIMIT $3
            "#,
        )
        .bind(self.recent.floor(self.checkpoint.last_event_id))
        .bind(self.recent.to_vec())
        .bind(self.batch_size)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let mut consumed = 0;
        for row in rows {
            if self.recent.contains(row.event_id) {
                continue;
            }
            if self.checkpoint.is_processed(row.event_id) {
                info!(
                    event_id = row.event_id,
                    last_event_id = self.checkpoint.last_event_id,
                    "Consuming late-committed change"
                );
            }
            match events_from_row(&row) {
                Ok(events) => self.queues.push_batch(events).await,
                Err(e) => warn!(event_id = row.event_id, error = %e, "Skipping change"),
            }
            self.recent.record(row.event_id);
            self.checkpoint.advance(row.event_id);
            consumed += 1;
        }
        self.recent.prune(self.checkpoint.last_event_id);

        if consumed > 0 {
            debug!(
                consumed,
                last_event_id = self.checkpoint.last_event_id,
                "Consumed change log rows"
            );
        }
        Ok(consumed)
    }

    /// Poll until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            last_event_id = self.checkpoint.last_event_id,
            "Starting change feed"
        );

        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Keep reading while full batches come back.
                    loop {
                        match self.poll_once().await {
                            Ok(n) if n as i64 >= self.batch_size => continue,
                            Ok(_) => break,
                            Err(e) => {
                                error!(error = %e, "Failed to poll change log");
                                break;
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Change feed shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NodeEvent, WorkloadEvent};

    fn row(kind: &str, key: &str, op: &str) -> ChangeRow {
        ChangeRow {
            event_id: 1,
            kind: kind.into(),
            entity_key: key.into(),
            op: op.into(),
            ready: Some(true),
            was_ready: None,
        }
    }

    #[test]
    fn test_node_add() {
        let events = events_from_row(&row("node", "a", "add")).unwrap();
        assert_eq!(events, vec![ChangeEvent::node("a", true, EventOp::Add)]);
    }

    #[test]
    fn test_node_update_carries_previous_readiness() {
        let mut update = row("node", "a", "update");
        update.was_ready = Some(true);
        update.ready = Some(false);

        let events = events_from_row(&update).unwrap();
        assert_eq!(
            events,
            vec![
                ChangeEvent::Node(NodeEvent {
                    name: "a".into(),
                    ready: true,
                    op: EventOp::Delete
                }),
                ChangeEvent::Node(NodeEvent {
                    name: "a".into(),
                    ready: false,
                    op: EventOp::Add
                }),
            ]
        );
    }

    #[test]
    fn test_workload_update() {
        let events = events_from_row(&row("workload", "default/web", "update")).unwrap();
        let id = WorkloadId::new("default", "web");
        assert_eq!(
            events,
            vec![
                ChangeEvent::Workload(WorkloadEvent {
                    id: id.clone(),
                    op: EventOp::Delete
                }),
                ChangeEvent::Workload(WorkloadEvent {
                    id,
                    op: EventOp::Add
                }),
            ]
        );
    }

    #[test]
    fn test_window_floor_never_reaches_before_start() {
        let recent = RecentIds::new(100, 10);
        assert_eq!(recent.floor(100), 100);
        assert_eq!(recent.floor(105), 100);
        assert_eq!(recent.floor(150), 140);
    }

    #[test]
    fn test_window_prunes_old_ids() {
        let mut recent = RecentIds::new(0, 10);
        for id in [1, 5, 12, 20] {
            recent.record(id);
        }
        recent.prune(20);
        // Floor is 10: ids above it are kept so they are not read again.
        assert_eq!(recent.to_vec(), vec![12, 20]);
        assert!(recent.contains(12));
        assert!(!recent.contains(5));
    }

    #[test]
    fn test_invalid_rows() {
        for bad in [
            row("node", "a", "upsert"),
            row("pod", "a", "add"),
            row("workload", "no-namespace", "add"),
            row("node", "", "add"),
        ] {
            assert!(matches!(
                events_from_row(&bad),
                Err(EventError::InvalidEvent(_))
            ));
        }
    }
}
