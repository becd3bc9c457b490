//! Per-table loader worker.

use super::{BatchConfig, LoadBatch};
use crate::destination::{LoadStatus, SharedDestination};
use crate::error::LoadError;
use crate::types::{DestinationTable, TableStatus};
use binlake_cdc::common::{retry_with_attempts, PendingBatch, SharedCheckpointBackend};
use binlake_cdc::{
    CdcError, CdcEvent, CdcOp, LogPosition, SchemaEvolution, SchemaTracker, SchemaVersion,
    TableCheckpoint, TableId,
};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Input of a table's worker.
#[derive(Debug)]
pub enum TableMessage {
    Event(CdcEvent),
    /// Every snapshot row of the table has been sent
    SnapshotComplete(LogPosition),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub batches: u64,
    pub events: u64,
    pub already_applied: u64,
    pub retries: u64,
    pub alters: u64,
}

/// How a worker ended.
#[derive(Debug)]
pub struct TableReport {
    pub source: TableId,
    pub table: DestinationTable,
    pub status: TableStatus,
    pub checkpoint: TableCheckpoint,
    pub stats: LoaderStats,
    pub load_error: Option<LoadError>,
    pub schema_error: Option<CdcError>,
}

enum Stop {
    Paused(CdcError),
    LoadFailed(LoadError),
    Failed(String),
}

/// Loads the events of one source table into one destination table.
pub struct TableLoader {
    source: TableId,
    table: DestinationTable,
    config: BatchConfig,
    max_events: usize,
    destination: SharedDestination,
    checkpoints: SharedCheckpointBackend,
    checkpoint: TableCheckpoint,
    tracker: Arc<SchemaTracker>,
    schema: Option<SchemaVersion>,
    permits: Arc<Semaphore>,
    buffer: Vec<CdcEvent>,
    buffer_bytes: usize,
    /// Batch recorded before a restart, rebuilt from the replay
    restore: Option<PendingBatch>,
    stats: LoaderStats,
}

impl TableLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: TableId,
        table: DestinationTable,
        config: BatchConfig,
        destination: SharedDestination,
        checkpoints: SharedCheckpointBackend,
        checkpoint: TableCheckpoint,
        tracker: Arc<SchemaTracker>,
        permits: Arc<Semaphore>,
    ) -> Self {
        let max_events = config.effective_max_events(destination.capabilities().max_batch_rows);
        let restore = checkpoint
            .pending
            .clone()
            .filter(|_| checkpoint.is_streaming());
        let schema = checkpoint.schema.clone();
        Self {
            source,
            table,
            config,
            max_events,
            destination,
            checkpoints,
            checkpoint,
            tracker,
            schema,
            permits,
            buffer: Vec::new(),
            buffer_bytes: 0,
            restore,
            stats: LoaderStats::default(),
        }
    }

    /// Run until the channel closes or `shutdown` fires.
    ///
    /// A closed channel flushes what is buffered; shutdown leaves it for
    /// replay. A submission in flight always completes.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<TableMessage>,
        shutdown: CancellationToken,
    ) -> TableReport {
        if let Some(pending) = &self.restore {
            info!(
                table = %self.source,
                label = %pending.label,
                first = %pending.first,
                last = %pending.last,
                "Rebuilding pending batch from replay"
            );
        }

        let mut ticker = tokio::time::interval(self.config.max_delay.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    if !self.buffer.is_empty() {
                        debug!(
                            table = %self.source,
                            events = self.buffer.len(),
                            "Leaving buffered events for replay"
                        );
                    }
                    break Ok(TableStatus::Stopped);
                }

                message = rx.recv() => match message {
                    Some(TableMessage::Event(event)) => {
                        if let Err(stop) = self.on_event(event).await {
                            break Err(stop);
                        }
                    }
                    Some(TableMessage::SnapshotComplete(watermark)) => {
                        if let Err(stop) = self.on_snapshot_complete(watermark).await {
                            break Err(stop);
                        }
                    }
                    None => {
                        break self.flush().await.map(|()| TableStatus::Streaming);
                    }
                },

                _ = ticker.tick() => {
                    if !self.buffer.is_empty() && self.restore.is_none() {
                        debug!(table = %self.source, events = self.buffer.len(), "Timer-triggered flush of partial batch");
                        if let Err(stop) = self.flush().await {
                            break Err(stop);
                        }
                    }
                }
            }
        };
        // later events are re-read from the log
        rx.close();

        let mut load_error = None;
        let mut schema_error = None;
        let status = match result {
            Ok(status) => status,
            Err(Stop::Paused(e)) => {
                let status = match &e {
                    CdcError::UnsupportedSchemaChange {
                        position, detail, ..
                    } => TableStatus::Paused {
                        position: position.to_string(),
                        detail: detail.clone(),
                    },
                    other => TableStatus::Failed {
                        reason: other.to_string(),
                    },
                };
                schema_error = Some(e);
                status
            }
            Err(Stop::LoadFailed(e)) => {
                let status = TableStatus::Failed {
                    reason: e.to_string(),
                };
                load_error = Some(e);
                status
            }
            Err(Stop::Failed(reason)) => TableStatus::Failed { reason },
        };
        info!(
            table = %self.source,
            destination = %self.table,
            status = %status,
            batches = self.stats.batches,
            events = self.stats.events,
            "Table loader finished"
        );
        TableReport {
            source: self.source,
            table: self.table,
            status,
            checkpoint: self.checkpoint,
            stats: self.stats,
            load_error,
            schema_error,
        }
    }

    async fn on_event(&mut self, event: CdcEvent) -> Result<(), Stop> {
        if event.op == CdcOp::SchemaChange {
            return match event.schema_change {
                Some(evolution) => self.on_schema_change(*evolution).await,
                None => Ok(()),
            };
        }

        if event.snapshot
            && !self.checkpoint.is_streaming()
            && self.checkpoint.watermark.as_ref() != Some(&event.position)
        {
            self.checkpoint.start_snapshot(event.position.clone());
            self.save().await?;
        }

        self.buffer_bytes += event
            .row_image()
            .and_then(|image| serde_json::to_vec(image).ok())
            .map_or(0, |bytes| bytes.len());
        let position = event.position.clone();
        self.buffer.push(event);

        if let Some(pending) = &self.restore {
            if position >= pending.last {
                self.flush().await?;
            }
            return Ok(());
        }
        if self.buffer.len() >= self.max_events || self.buffer_bytes >= self.config.max_bytes {
            self.flush().await?;
        }
        Ok(())
    }

    async fn on_snapshot_complete(&mut self, watermark: LogPosition) -> Result<(), Stop> {
        self.flush().await?;
        if self.checkpoint.watermark.as_ref() != Some(&watermark) {
            self.checkpoint.start_snapshot(watermark.clone());
        }
        if self.schema.is_none() {
            self.schema = self.tracker.current(&self.source).await;
        }
        self.checkpoint.finish_snapshot();
        self.checkpoint.schema = self.schema.clone();
        self.save().await?;
        info!(table = %self.source, watermark = %watermark, "Snapshot loaded, table is streaming");
        Ok(())
    }

    async fn on_schema_change(&mut self, evolution: SchemaEvolution) -> Result<(), Stop> {
        // events before the DDL reference the old layout
        self.flush().await?;

        if evolution.resolved {
            info!(
                table = %self.source,
                position = %evolution.position,
                "Schema change accepted by operator; destination left as is"
            );
        } else if evolution.is_compatible() {
            let (result, attempts) =
                retry_with_attempts(&self.config.retry, "destination.alter_table", |_| {
                    self.destination
                        .alter_table(&self.table, &evolution.changes)
                })
                .await;
            self.stats.retries += u64::from(attempts.saturating_sub(1));
            if let Err(e) = result {
                error!(
                    table = %self.source,
                    position = %evolution.position,
                    error = %e,
                    "Failed to apply schema change to destination"
                );
                return Err(Stop::Failed(format!(
                    "schema change at {} failed: {}",
                    evolution.position, e
                )));
            }
            self.stats.alters += 1;
            counter!("binlake.loader.alters", "table" => self.source.to_string()).increment(1);
            info!(
                table = %self.source,
                position = %evolution.position,
                to_version = evolution.to_version,
                "Destination schema updated"
            );
        } else {
            let detail = evolution.unsupported_detail().unwrap_or_default();
            let e = CdcError::unsupported_schema_change(
                self.source.clone(),
                evolution.position.clone(),
                detail.clone(),
            );
            error!(
                table = %self.source,
                position = %evolution.position,
                ddl = %evolution.ddl,
                error = %e,
                "Pausing table; resolve with `binlake resolve --table {} --position {}`",
                self.source,
                evolution.position
            );
            self.checkpoint.pause(evolution.position.clone(), detail);
            self.save().await?;
            counter!("binlake.loader.paused", "table" => self.source.to_string()).increment(1);
            return Err(Stop::Paused(e));
        }

        self.schema = Some(evolution.schema.clone());
        self.checkpoint.commit(evolution.position.clone());
        self.checkpoint.schema = self.schema.clone();
        self.save().await
    }

    async fn flush(&mut self) -> Result<(), Stop> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let events = std::mem::take(&mut self.buffer);
        self.buffer_bytes = 0;

        if self.schema.is_none() {
            self.schema = self.tracker.current(&self.source).await;
        }
        let key_columns = self
            .schema
            .as_ref()
            .map(|s| s.key_columns())
            .unwrap_or_default();

        let batch = LoadBatch::new(
            self.table.clone(),
            key_columns,
            events,
            &self.config.label_prefix,
        )
        .map_err(|e| Stop::Failed(format!("cannot encode batch: {}", e)))?;
        let Some(mut batch) = batch else {
            return Ok(());
        };

        if let Some(pending) = self.restore.take() {
            if batch.first == pending.first && batch.last == pending.last && batch.len() == pending.events {
                info!(table = %self.source, label = %pending.label, "Re-submitting pending batch");
                batch = batch.with_label(pending.label);
            } else {
                warn!(
                    table = %self.source,
                    label = %pending.label,
                    expected_last = %pending.last,
                    rebuilt_last = %batch.last,
                    "Replay did not rebuild the pending batch; submitting under a new label"
                );
            }
        }
        self.submit(batch).await
    }

    async fn submit(&mut self, batch: LoadBatch) -> Result<(), Stop> {
        self.checkpoint.begin_batch(PendingBatch {
            label: batch.label.clone(),
            first: batch.first.clone(),
            last: batch.last.clone(),
            events: batch.len(),
        });
        self.save().await?;

        let permits = self.permits.clone();
        let _permit = permits
            .acquire()
            .await
            .map_err(|_| Stop::Failed("load permits closed".to_string()))?;

        debug!(
            table = %self.source,
            label = %batch.label,
            events = batch.len(),
            "Submitting batch"
        );
        let (result, attempts) = retry_with_attempts(&self.config.retry, "destination.load", |_| {
            self.destination.load(&batch)
        })
        .await;
        self.stats.retries += u64::from(attempts.saturating_sub(1));

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = LoadError {
                    table: self.source.clone(),
                    label: batch.label.clone(),
                    first: batch.first.clone(),
                    last: batch.last.clone(),
                    attempts,
                    reason: e.to_string(),
                };
                error!(
                    table = %self.source,
                    position = %batch.first,
                    label = %batch.label,
                    attempts,
                    error = %e,
                    "Batch load failed; stopping table"
                );
                counter!("binlake.loader.failed", "table" => self.source.to_string()).increment(1);
                return Err(Stop::LoadFailed(err));
            }
        };

        if outcome.status == LoadStatus::AlreadyApplied {
            self.stats.already_applied += 1;
            info!(table = %self.source, label = %batch.label, "Batch was already applied");
        }
        if outcome.rows_filtered > 0 {
            warn!(
                table = %self.source,
                label = %batch.label,
                filtered = outcome.rows_filtered,
                rejections = ?outcome.rejections,
                "Destination filtered rows"
            );
        }
        self.stats.batches += 1;
        self.stats.events += batch.len() as u64;
        counter!("binlake.loader.batches", "table" => self.source.to_string()).increment(1);
        counter!("binlake.loader.events", "table" => self.source.to_string())
            .increment(batch.len() as u64);

        self.checkpoint.commit(batch.last.clone());
        self.checkpoint.schema = self.schema.clone();
        self.save().await
    }

    async fn save(&mut self) -> Result<(), Stop> {
        self.checkpoints
            .save_table(&self.checkpoint)
            .await
            .map_err(|e| {
                error!(table = %self.source, error = %e, "Failed to write checkpoint");
                Stop::Failed(format!("checkpoint write failed: {}", e))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{DestinationOp, MemoryDestination};
    use binlake_cdc::{
        ColumnChange, ColumnDef, MemoryCheckpointStore, RetryConfig, SqlType,
    };
    use serde_json::json;

    fn orders() -> TableId {
        TableId::new("shop", "orders")
    }

    fn dest_table() -> DestinationTable {
        DestinationTable::new("dw", "orders")
    }

    fn schema() -> SchemaVersion {
        SchemaVersion::new(
            orders(),
            vec![
                ColumnDef::new("id", SqlType::parse("int").unwrap()).primary_key(),
                ColumnDef::new("qty", SqlType::parse("int").unwrap()),
            ],
        )
    }

    fn pos(offset: u64) -> LogPosition {
        LogPosition::at("mysql-bin.000001", offset, 2, 0)
    }

    fn insert(id: i64, offset: u64) -> CdcEvent {
        CdcEvent::insert(orders(), json!({"id": id, "qty": id}), pos(offset), 0)
    }

    fn fast_retry(n: i32) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(n)
            .retry_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .jitter(0.0)
            .build()
    }

    struct Harness {
        destination: MemoryDestination,
        checkpoints: Arc<MemoryCheckpointStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                destination: MemoryDestination::new(),
                checkpoints: Arc::new(MemoryCheckpointStore::new()),
            }
        }

        async fn loader(&self, config: BatchConfig, checkpoint: TableCheckpoint) -> TableLoader {
            let tracker = Arc::new(SchemaTracker::new());
            tracker.register(schema()).await;
            TableLoader::new(
                orders(),
                dest_table(),
                config,
                Arc::new(self.destination.clone()),
                self.checkpoints.clone(),
                checkpoint,
                tracker,
                Arc::new(Semaphore::new(2)),
            )
        }
    }

    fn streaming() -> TableCheckpoint {
        TableCheckpoint::streaming_from(orders(), LogPosition::new("mysql-bin.000001", 4))
    }

    async fn drive(loader: TableLoader, messages: Vec<TableMessage>) -> TableReport {
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(loader.run(rx, CancellationToken::new()));
        for m in messages {
            if tx.send(m).await.is_err() {
                break;
            }
        }
        drop(tx);
        handle.await.unwrap()
    }

    #[tokio::test]
    async fn test_size_threshold_and_final_flush() {
        let h = Harness::new();
        let config = BatchConfig::builder().max_events(2).retry(fast_retry(1)).build();
        let loader = h.loader(config, streaming()).await;
        let events = (1..=5).map(|i| TableMessage::Event(insert(i, i as u64 * 100))).collect();
        let report = drive(loader, events).await;

        assert_eq!(report.status, TableStatus::Streaming);
        assert_eq!(report.stats.batches, 3);
        assert_eq!(h.destination.row_count(&dest_table()), 5);
        assert_eq!(report.checkpoint.committed, Some(pos(500)));
        assert!(report.checkpoint.pending.is_none());
    }

    #[tokio::test]
    async fn test_schema_change_flushes_then_alters() {
        let h = Harness::new();
        let loader = h.loader(BatchConfig::default(), streaming()).await;
        let mut v2 = schema().next(schema().columns.clone());
        v2.columns.push(ColumnDef::new("c", SqlType::parse("int").unwrap()));
        let evolution = SchemaEvolution {
            table: orders(),
            position: LogPosition::at("mysql-bin.000001", 300, 1, 0),
            ddl: "ALTER TABLE orders ADD COLUMN c INT".into(),
            from_version: 1,
            to_version: 2,
            changes: vec![ColumnChange::Add {
                column: ColumnDef::new("c", SqlType::parse("int").unwrap()),
            }],
            schema: v2.clone(),
            resolved: false,
        };
        let report = drive(
            loader,
            vec![
                TableMessage::Event(insert(1, 100)),
                TableMessage::Event(CdcEvent::schema_change(evolution, 0)),
                TableMessage::Event(CdcEvent::insert(
                    orders(),
                    json!({"id": 2, "qty": 1, "c": 9}),
                    pos(400),
                    0,
                )),
            ],
        )
        .await;

        let ops = h.destination.operations();
        assert!(matches!(ops[0], DestinationOp::Load { rows: 1, .. }));
        assert!(matches!(ops[1], DestinationOp::Alter { .. }));
        assert!(matches!(ops[2], DestinationOp::Load { rows: 1, .. }));
        assert_eq!(report.checkpoint.schema, Some(v2));
    }

    #[tokio::test]
    async fn test_unsupported_change_pauses() {
        let h = Harness::new();
        let loader = h.loader(BatchConfig::default(), streaming()).await;
        let at = LogPosition::at("mysql-bin.000001", 300, 1, 0);
        let evolution = SchemaEvolution {
            table: orders(),
            position: at.clone(),
            ddl: "ALTER TABLE orders DROP COLUMN qty".into(),
            from_version: 1,
            to_version: 2,
            changes: vec![ColumnChange::Drop {
                column: ColumnDef::new("qty", SqlType::parse("int").unwrap()),
            }],
            schema: schema(),
            resolved: false,
        };
        let report = drive(
            loader,
            vec![
                TableMessage::Event(insert(1, 100)),
                TableMessage::Event(CdcEvent::schema_change(evolution, 0)),
                TableMessage::Event(insert(2, 400)),
            ],
        )
        .await;

        assert!(matches!(report.status, TableStatus::Paused { .. }));
        assert!(matches!(
            report.schema_error,
            Some(CdcError::UnsupportedSchemaChange { .. })
        ));
        assert_eq!(report.checkpoint.committed, Some(pos(100)));
        assert_eq!(report.checkpoint.paused.map(|p| p.position), Some(at));
        assert_eq!(h.destination.row_count(&dest_table()), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_spent_reports_label() {
        let h = Harness::new();
        h.destination.fail_next_loads(10);
        let config = BatchConfig::builder().retry(fast_retry(2)).build();
        let loader = h.loader(config, streaming()).await;
        let report = drive(loader, vec![TableMessage::Event(insert(1, 100))]).await;

        let err = report.load_error.expect("load error");
        assert_eq!(err.attempts, 3);
        assert_eq!(h.destination.load_attempts(), 3);
        assert_eq!(
            report.checkpoint.pending.as_ref().map(|p| p.label.clone()),
            Some(err.label)
        );
        assert_eq!(
            report.checkpoint.resume_position(),
            Some(&LogPosition::new("mysql-bin.000001", 4))
        );
    }

    #[tokio::test]
    async fn test_pending_batch_is_rebuilt_with_its_label() {
        let h = Harness::new();
        let mut checkpoint = streaming();
        checkpoint.begin_batch(PendingBatch {
            label: "recorded_label".into(),
            first: pos(100),
            last: pos(200),
            events: 2,
        });
        let config = BatchConfig::builder().max_events(1).build();
        let loader = h.loader(config, checkpoint).await;
        drive(
            loader,
            vec![
                TableMessage::Event(insert(1, 100)),
                TableMessage::Event(insert(2, 200)),
                TableMessage::Event(insert(3, 300)),
            ],
        )
        .await;

        assert!(h.destination.has_label("recorded_label"));
        let ops = h.destination.operations();
        assert!(matches!(&ops[0], DestinationOp::Load { label, rows: 2, .. } if label == "recorded_label"));
        assert_eq!(ops.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_buffer() {
        let h = Harness::new();
        let loader = h.loader(BatchConfig::default(), streaming()).await;
        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(loader.run(rx, shutdown.clone()));
        tx.send(TableMessage::Event(insert(1, 100))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        let report = handle.await.unwrap();

        assert_eq!(report.status, TableStatus::Stopped);
        assert_eq!(h.destination.row_count(&dest_table()), 0);
        assert_eq!(
            report.checkpoint.resume_position(),
            Some(&LogPosition::new("mysql-bin.000001", 4))
        );
    }

    #[tokio::test]
    async fn test_snapshot_completion_moves_to_streaming() {
        let h = Harness::new();
        let loader = h
            .loader(BatchConfig::default(), TableCheckpoint::new(orders()))
            .await;
        let watermark = LogPosition::new("mysql-bin.000001", 900);
        let report = drive(
            loader,
            vec![
                TableMessage::Event(CdcEvent::snapshot_row(orders(), json!({"id": 1, "qty": 1}), watermark.clone())),
                TableMessage::SnapshotComplete(watermark.clone()),
            ],
        )
        .await;

        assert!(report.checkpoint.is_streaming());
        assert_eq!(report.checkpoint.committed, Some(watermark.clone()));
        assert_eq!(report.checkpoint.watermark, Some(watermark));
        assert_eq!(report.checkpoint.schema, Some(schema()));
        assert_eq!(h.destination.row_count(&dest_table()), 1);
    }
}
