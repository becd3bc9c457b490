//! # Initial Snapshot
//!
//! Loads the existing rows of each table from a consistent read view and
//! hands off to the binlog without gaps or duplicates.
//!
//! ## Handoff
//!
//! ```text
//! begin()  ── read view opened, watermark W = binlog position of the view
//!   │
//!   ├── table A rows ── synthetic inserts, position = W
//!   ├── table B rows ── ...
//!   │
//! end()    ── Transitioning: W recorded per table
//!   │
//! stream from min(resume positions) ── HandoffFilter drops events < W
//! ```
//!
//! Every row in the read view reflects exactly the transactions before W,
//! and every streamed event at or after W is newer than the view.

use crate::common::{
    retry_with_backoff, CdcError, CdcEvent, LogPosition, Result, RetryConfig, SchemaTracker,
    SchemaVersion, TableId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Phase of the snapshot/stream handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPhase {
    #[default]
    NotStarted,
    Snapshotting,
    Transitioning,
    Streaming,
}

impl SnapshotPhase {
    /// Legal transitions. Re-entering `Snapshotting` restarts a table;
    /// `Streaming` is terminal.
    pub fn can_advance(self, to: SnapshotPhase) -> bool {
        use SnapshotPhase::*;
        matches!(
            (self, to),
            (NotStarted, Snapshotting)
                | (NotStarted, Streaming)
                | (Snapshotting, Snapshotting)
                | (Snapshotting, Transitioning)
                | (Transitioning, Streaming)
                | (Streaming, Streaming)
        )
    }
}

impl fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotPhase::NotStarted => "not_started",
            SnapshotPhase::Snapshotting => "snapshotting",
            SnapshotPhase::Transitioning => "transitioning",
            SnapshotPhase::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

/// Configuration for snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Rows per page
    pub batch_size: usize,
    /// Full restarts of one table before it is reported failed
    pub max_table_attempts: u32,
    /// Retry budget for a single page fetch
    pub retry: RetryConfig,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            max_table_attempts: 3,
            retry: RetryConfig::default(),
        }
    }
}

impl SnapshotConfig {
    pub fn builder() -> SnapshotConfigBuilder {
        SnapshotConfigBuilder::default()
    }
}

/// Builder for SnapshotConfig.
#[derive(Debug, Clone, Default)]
pub struct SnapshotConfigBuilder {
    config: SnapshotConfig,
}

impl SnapshotConfigBuilder {
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size.max(1);
        self
    }

    pub fn max_table_attempts(mut self, attempts: u32) -> Self {
        self.config.max_table_attempts = attempts.max(1);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn build(self) -> SnapshotConfig {
        self.config
    }
}

/// Source of consistent snapshot reads.
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Open a consistent read view and return the log position it reflects.
    async fn begin(&self) -> Result<LogPosition>;

    /// Column layout of `table`.
    async fn describe(&self, table: &TableId) -> Result<SchemaVersion>;

    /// Next page of rows ordered by `key_columns`, strictly after `last_key`.
    /// Rows are JSON objects with normalized values.
    async fn fetch_batch(
        &self,
        table: &TableId,
        key_columns: &[String],
        last_key: Option<&[Value]>,
        batch_size: usize,
    ) -> Result<Vec<Value>>;

    /// Close the read view.
    async fn end(&self) -> Result<()>;

    /// Current end of the binlog, without a read view.
    async fn current_position(&self) -> Result<LogPosition>;
}

/// Receiver of snapshot output.
#[async_trait::async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Deliver one synthetic insert. Blocks while the table's queue is full.
    async fn emit(&self, event: CdcEvent) -> Result<()>;

    /// All rows of `table` were emitted.
    async fn completed(&self, table: &TableId, watermark: &LogPosition) -> Result<()>;
}

/// Snapshot statistics.
#[derive(Debug, Default)]
pub struct SnapshotStats {
    rows: AtomicU64,
    tables_completed: AtomicU64,
    tables_failed: AtomicU64,
    restarts: AtomicU64,
}

impl SnapshotStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SnapshotStatsSnapshot {
        SnapshotStatsSnapshot {
            rows: self.rows.load(Ordering::Relaxed),
            tables_completed: self.tables_completed.load(Ordering::Relaxed),
            tables_failed: self.tables_failed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot for stats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotStatsSnapshot {
    pub rows: u64,
    pub tables_completed: u64,
    pub tables_failed: u64,
    pub restarts: u64,
}

/// Result of a snapshot run.
#[derive(Debug, Default)]
pub struct SnapshotOutcome {
    pub watermark: Option<LogPosition>,
    pub completed: Vec<TableId>,
    pub failed: Vec<(TableId, CdcError)>,
    /// Cancelled before finishing
    pub cancelled: bool,
}

/// Drops stream events the snapshot or an earlier load already covered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffFilter {
    watermark: Option<LogPosition>,
    committed: Option<LogPosition>,
}

impl HandoffFilter {
    pub fn new(watermark: Option<LogPosition>, committed: Option<LogPosition>) -> Self {
        Self {
            watermark,
            committed,
        }
    }

    /// True when `event` is neither older than the watermark nor already loaded.
    pub fn admit(&self, event: &CdcEvent) -> bool {
        if event.snapshot {
            return true;
        }
        self.admits_position(&event.position)
    }

    pub fn admits_position(&self, position: &LogPosition) -> bool {
        if self.watermark.as_ref().is_some_and(|w| position < w) {
            return false;
        }
        if self.committed.as_ref().is_some_and(|c| position <= c) {
            return false;
        }
        true
    }

    /// Earliest position this filter can admit.
    pub fn lower_bound(&self) -> Option<&LogPosition> {
        match (&self.watermark, &self.committed) {
            (Some(w), Some(c)) => Some(if c > w { c } else { w }),
            (Some(w), None) => Some(w),
            (None, c) => c.as_ref(),
        }
    }
}

/// Coordinator for multi-table snapshots.
pub struct SnapshotCoordinator {
    config: SnapshotConfig,
    source: Arc<dyn SnapshotSource>,
    tracker: Arc<SchemaTracker>,
    phase: Mutex<SnapshotPhase>,
    stats: Arc<SnapshotStats>,
    cancelled: AtomicBool,
}

impl SnapshotCoordinator {
    pub fn new(
        config: SnapshotConfig,
        source: Arc<dyn SnapshotSource>,
        tracker: Arc<SchemaTracker>,
    ) -> Self {
        Self {
            config,
            source,
            tracker,
            phase: Mutex::new(SnapshotPhase::NotStarted),
            stats: Arc::new(SnapshotStats::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> SnapshotPhase {
        self.phase
            .lock()
            .map(|p| *p)
            .unwrap_or(SnapshotPhase::NotStarted)
    }

    /// Move to `to`, rejecting illegal transitions.
    pub fn advance(&self, to: SnapshotPhase) -> Result<()> {
        let mut phase = self
            .phase
            .lock()
            .map_err(|_| CdcError::invalid_state("snapshot phase lock poisoned"))?;
        if !phase.can_advance(to) {
            return Err(CdcError::invalid_state(format!(
                "snapshot phase cannot move from {} to {}",
                *phase, to
            )));
        }
        if *phase != to {
            debug!(from = %*phase, to = %to, "Snapshot phase change");
        }
        *phase = to;
        Ok(())
    }

    /// Cancel a running snapshot after the current page.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SnapshotStatsSnapshot {
        self.stats.snapshot()
    }

    /// Snapshot `tables` inside one read view.
    ///
    /// Per-table failures are collected in the outcome; other tables keep
    /// going. The coordinator ends in `Transitioning`.
    pub async fn run(&self, tables: &[TableId], sink: &dyn SnapshotSink) -> Result<SnapshotOutcome> {
        self.advance(SnapshotPhase::Snapshotting)?;
        let watermark = self.source.begin().await?;
        info!(watermark = %watermark, tables = tables.len(), "Snapshot read view opened");

        let mut outcome = SnapshotOutcome {
            watermark: Some(watermark.clone()),
            ..Default::default()
        };

        for table in tables {
            if self.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            match self.snapshot_table(table, &watermark, sink).await {
                Ok(true) => {
                    sink.completed(table, &watermark).await?;
                    self.stats.tables_completed.fetch_add(1, Ordering::Relaxed);
                    outcome.completed.push(table.clone());
                }
                Ok(false) => {
                    outcome.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(table = %table, error = %e, "Snapshot of table failed");
                    self.stats.tables_failed.fetch_add(1, Ordering::Relaxed);
                    outcome.failed.push((table.clone(), e));
                }
            }
        }

        if let Err(e) = self.source.end().await {
            warn!(error = %e, "Failed to close snapshot read view");
        }
        self.advance(SnapshotPhase::Transitioning)?;

        let stats = self.stats();
        info!(
            rows = stats.rows,
            completed = outcome.completed.len(),
            failed = outcome.failed.len(),
            restarts = stats.restarts,
            "Snapshot finished"
        );
        Ok(outcome)
    }

    /// Returns `Ok(false)` when cancelled part way.
    async fn snapshot_table(
        &self,
        table: &TableId,
        watermark: &LogPosition,
        sink: &dyn SnapshotSink,
    ) -> Result<bool> {
        let mut attempt = 1;
        loop {
            match self.copy_table(table, watermark, sink).await {
                Ok(done) => return Ok(done),
                Err(e @ CdcError::SnapshotFailure { .. }) => return Err(e),
                Err(e) if attempt < self.config.max_table_attempts => {
                    warn!(
                        table = %table,
                        attempt,
                        error = %e,
                        "Restarting table snapshot from the first row"
                    );
                    self.stats.restarts.fetch_add(1, Ordering::Relaxed);
                    self.advance(SnapshotPhase::Snapshotting)?;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(CdcError::snapshot_failure(
                        table.clone(),
                        format!("gave up after {} attempts: {}", attempt, e),
                    ))
                }
            }
        }
    }

    async fn copy_table(
        &self,
        table: &TableId,
        watermark: &LogPosition,
        sink: &dyn SnapshotSink,
    ) -> Result<bool> {
        let schema = retry_with_backoff(&self.config.retry, "snapshot.describe", || {
            self.source.describe(table)
        })
        .await?;
        let key_columns = schema.key_columns();
        if key_columns.is_empty() {
            return Err(CdcError::snapshot_failure(
                table.clone(),
                "table has no primary key",
            ));
        }
        self.tracker.register(schema).await;

        let mut last_key: Option<Vec<Value>> = None;
        let mut rows_copied = 0u64;
        loop {
            if self.is_cancelled() {
                return Ok(false);
            }
            let page = retry_with_backoff(&self.config.retry, "snapshot.fetch", || {
                self.source.fetch_batch(
                    table,
                    &key_columns,
                    last_key.as_deref(),
                    self.config.batch_size,
                )
            })
            .await?;

            let page_len = page.len();
            for row in page {
                let event = CdcEvent::snapshot_row(table.clone(), row, watermark.clone());
                let key = event.key_values(&key_columns).ok_or_else(|| {
                    CdcError::snapshot_failure(table.clone(), "row is missing a key column")
                })?;
                sink.emit(event).await?;
                last_key = Some(key);
            }
            rows_copied += page_len as u64;
            self.stats.rows.fetch_add(page_len as u64, Ordering::Relaxed);
            metrics::counter!("binlake.snapshot.rows", "table" => table.to_string())
                .increment(page_len as u64);

            if page_len < self.config.batch_size {
                info!(table = %table, rows = rows_copied, "Table snapshot complete");
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ColumnDef, SqlType};
    use crate::testing::MemorySnapshotSource;
    use serde_json::json;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct CollectSink {
        events: AsyncMutex<Vec<CdcEvent>>,
        completed: AsyncMutex<Vec<TableId>>,
    }

    #[async_trait::async_trait]
    impl SnapshotSink for CollectSink {
        async fn emit(&self, event: CdcEvent) -> Result<()> {
            self.events.lock().await.push(event);
            Ok(())
        }

        async fn completed(&self, table: &TableId, _watermark: &LogPosition) -> Result<()> {
            self.completed.lock().await.push(table.clone());
            Ok(())
        }
    }

    fn schema(table: &TableId) -> SchemaVersion {
        SchemaVersion::new(
            table.clone(),
            vec![
                ColumnDef::new("id", SqlType::parse("int").unwrap()).primary_key(),
                ColumnDef::new("v", SqlType::parse("varchar(10)").unwrap()),
            ],
        )
    }

    fn fast_config(batch: usize) -> SnapshotConfig {
        SnapshotConfig::builder()
            .batch_size(batch)
            .max_table_attempts(2)
            .retry(RetryConfig::disabled())
            .build()
    }

    #[test]
    fn test_phase_transitions() {
        use SnapshotPhase::*;
        assert!(NotStarted.can_advance(Snapshotting));
        assert!(Snapshotting.can_advance(Snapshotting));
        assert!(Snapshotting.can_advance(Transitioning));
        assert!(Transitioning.can_advance(Streaming));
        assert!(Streaming.can_advance(Streaming));
        assert!(!Streaming.can_advance(Snapshotting));
        assert!(!Transitioning.can_advance(Snapshotting));
        assert!(!NotStarted.can_advance(Transitioning));
    }

    #[test]
    fn test_handoff_filter() {
        let t = TableId::new("shop", "orders");
        let w = LogPosition::new("mysql-bin.000002", 500);
        let filter = HandoffFilter::new(Some(w.clone()), None);

        let before = CdcEvent::insert(t.clone(), json!({"id": 1}), LogPosition::at("mysql-bin.000002", 300, 1, 0), 0);
        let after = CdcEvent::insert(t.clone(), json!({"id": 1}), LogPosition::at("mysql-bin.000002", 500, 2, 0), 0);
        let snap = CdcEvent::snapshot_row(t.clone(), json!({"id": 1}), w.clone());
        assert!(!filter.admit(&before));
        assert!(filter.admit(&after));
        assert!(filter.admit(&snap));

        let committed = HandoffFilter::new(Some(w), Some(after.position.clone()));
        assert!(!committed.admit(&after));
        assert_eq!(committed.lower_bound(), Some(&after.position));
    }

    #[tokio::test]
    async fn test_snapshot_pages_all_rows() {
        let t = TableId::new("shop", "orders");
        let source = Arc::new(MemorySnapshotSource::new(LogPosition::new("mysql-bin.000001", 4)));
        source.add_table(schema(&t), (1..=5).map(|i| json!({"id": i, "v": format!("r{}", i)})).collect());

        let tracker = Arc::new(SchemaTracker::new());
        let coordinator = SnapshotCoordinator::new(fast_config(2), source, tracker.clone());
        let sink = CollectSink::default();
        let outcome = coordinator.run(&[t.clone()], &sink).await.unwrap();

        assert_eq!(outcome.completed, vec![t.clone()]);
        assert!(outcome.failed.is_empty());
        let events = sink.events.lock().await;
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.snapshot && e.position == LogPosition::new("mysql-bin.000001", 4)));
        assert_eq!(coordinator.phase(), SnapshotPhase::Transitioning);
        assert!(tracker.is_tracked(&t).await);
        assert_eq!(coordinator.stats().rows, 5);
    }

    #[tokio::test]
    async fn test_table_restart_then_failure_is_isolated() {
        let bad = TableId::new("shop", "bad");
        let good = TableId::new("shop", "good");
        let source = Arc::new(MemorySnapshotSource::new(LogPosition::new("mysql-bin.000001", 4)));
        source.add_table(schema(&bad), vec![json!({"id": 1, "v": "a"})]);
        source.add_table(schema(&good), vec![json!({"id": 1, "v": "a"})]);
        source.fail_fetches(&bad, 10);

        let coordinator = SnapshotCoordinator::new(fast_config(10), source, Arc::new(SchemaTracker::new()));
        let sink = CollectSink::default();
        let outcome = coordinator.run(&[bad.clone(), good.clone()], &sink).await.unwrap();

        assert_eq!(outcome.completed, vec![good]);
        assert_eq!(outcome.failed.len(), 1);
        assert!(matches!(&outcome.failed[0].1, CdcError::SnapshotFailure { table, .. } if *table == bad));
        assert_eq!(coordinator.stats().restarts, 1);
    }

    #[tokio::test]
    async fn test_table_without_key_fails() {
        let t = TableId::new("shop", "log");
        let source = Arc::new(MemorySnapshotSource::new(LogPosition::new("mysql-bin.000001", 4)));
        source.add_table(
            SchemaVersion::new(t.clone(), vec![ColumnDef::new("msg", SqlType::parse("text").unwrap())]),
            vec![],
        );
        let coordinator = SnapshotCoordinator::new(fast_config(10), source, Arc::new(SchemaTracker::new()));
        let outcome = coordinator.run(&[t], &CollectSink::default()).await.unwrap();
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(coordinator.stats().restarts, 0);
    }

    #[test]
    fn test_illegal_advance_is_rejected() {
        let source = Arc::new(MemorySnapshotSource::new(LogPosition::new("f.000001", 4)));
        let c = SnapshotCoordinator::new(SnapshotConfig::default(), source, Arc::new(SchemaTracker::new()));
        assert!(matches!(
            c.advance(SnapshotPhase::Transitioning),
            Err(CdcError::InvalidState(_))
        ));
        c.advance(SnapshotPhase::Streaming).unwrap();
        assert!(c.advance(SnapshotPhase::Snapshotting).is_err());
    }
}
