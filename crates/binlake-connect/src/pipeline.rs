//! Pipeline orchestration
//!
//! One source task reads the snapshot and then the binlog and routes every
//! event to the bounded queue of its table's [`TableLoader`]:
//!
//! ```text
//!                          ┌────────────────────┐    mpsc     ┌─────────────┐
//!  SnapshotCoordinator ──▶ │                    │ ──────────▶ │ TableLoader │──▶ Destination
//!                          │ router (per-table  │             └─────────────┘
//!  ChangeStream ─────────▶ │ handoff filters)   │ ──────────▶ ┌─────────────┐
//!                          └────────────────────┘             │ TableLoader │──▶ Destination
//!                                                             └─────────────┘
//! ```
//!
//! A table that pauses or fails closes its queue; the router drops that
//! table's events and the others keep flowing.

use crate::destination::SharedDestination;
use crate::error::{ConnectError, Result};
use crate::loader::{BatchConfig, LoaderStats, TableLoader, TableMessage, TableReport};
use crate::types::{DestinationTable, TableStatus};
use async_trait::async_trait;
use binlake_cdc::common::{SharedCheckpointBackend, SnapshotSink, StreamStatsSnapshot};
use binlake_cdc::{
    CdcError, CdcEvent, ChangeStream, HandoffFilter, LogConnector, LogPosition, SchemaTracker,
    SnapshotConfig, SnapshotCoordinator, SnapshotPhase, SnapshotSource, StreamConfig, TableCheckpoint, TableId,
};
use futures::future::join_all;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where tables without a streaming checkpoint start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StartupMode {
    /// Snapshot, then stream from the snapshot's watermark
    #[default]
    Initial,
    /// No snapshot; stream from the server's current position
    Latest,
    /// No snapshot; stream from the given position
    Position(LogPosition),
}

impl fmt::Display for StartupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => f.write_str("initial"),
            Self::Latest => f.write_str("latest"),
            Self::Position(pos) => write!(f, "position {}", pos),
        }
    }
}

/// A captured table and where it lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapping {
    pub source: TableId,
    pub destination: DestinationTable,
}

impl TableMapping {
    pub fn new(source: TableId, destination: DestinationTable) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Same database and table name on both sides.
    pub fn identity(source: TableId) -> Self {
        let destination = DestinationTable::from(&source);
        Self::new(source, destination)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub tables: Vec<TableMapping>,
    pub startup: StartupMode,
    pub batch: BatchConfig,
    pub snapshot: SnapshotConfig,
    /// Reconnect budget, time zone and event size; the table list is filled in
    pub stream: StreamConfig,
    /// Loads in flight across all tables
    pub max_concurrent_loads: usize,
    /// Events queued per table before the source waits
    pub queue_capacity: usize,
}

impl PipelineConfig {
    pub fn new(tables: Vec<TableMapping>) -> Self {
        Self {
            tables,
            startup: StartupMode::Initial,
            batch: BatchConfig::default(),
            snapshot: SnapshotConfig::default(),
            stream: StreamConfig::default(),
            max_concurrent_loads: 4,
            queue_capacity: 1024,
        }
    }

    pub fn with_startup(mut self, startup: StartupMode) -> Self {
        self.startup = startup;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotConfig) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_max_concurrent_loads(mut self, n: usize) -> Self {
        self.max_concurrent_loads = n;
        self
    }

    pub fn with_queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }
}

/// Source side of a pipeline.
#[derive(Clone)]
pub struct PipelineSource {
    pub connector: Arc<dyn LogConnector>,
    pub snapshot: Arc<dyn SnapshotSource>,
}

impl PipelineSource {
    pub fn new(connector: Arc<dyn LogConnector>, snapshot: Arc<dyn SnapshotSource>) -> Self {
        Self {
            connector,
            snapshot,
        }
    }
}

/// Final state of every table.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub tables: Vec<TableReport>,
    /// Rows read by the snapshot
    pub snapshot_rows: u64,
    /// Where the snapshot handoff ended; `None` when nothing was snapshotted
    pub snapshot_phase: Option<SnapshotPhase>,
    pub stream: Option<StreamStatsSnapshot>,
    /// Source failure that ended the run early
    pub source_error: Option<CdcError>,
}

impl PipelineReport {
    pub fn table(&self, table: &TableId) -> Option<&TableReport> {
        self.tables.iter().find(|r| &r.source == table)
    }

    /// Any table paused or failed, or the source gave up.
    pub fn needs_attention(&self) -> bool {
        self.source_error.is_some() || self.tables.iter().any(|r| r.status.needs_attention())
    }
}

/// Per-table state the router needs.
struct Route {
    destination: DestinationTable,
    checkpoint: TableCheckpoint,
    snapshot: bool,
}

/// Sends snapshot rows into the table queues.
struct SnapshotRouter {
    senders: HashMap<TableId, mpsc::Sender<TableMessage>>,
}

#[async_trait]
impl SnapshotSink for SnapshotRouter {
    async fn emit(&self, event: CdcEvent) -> binlake_cdc::Result<()> {
        let Some(tx) = self.senders.get(&event.table) else {
            return Ok(());
        };
        let table = event.table.clone();
        tx.send(TableMessage::Event(event))
            .await
            .map_err(|_| CdcError::snapshot_failure(table, "table loader stopped"))
    }

    async fn completed(&self, table: &TableId, watermark: &LogPosition) -> binlake_cdc::Result<()> {
        if let Some(tx) = self.senders.get(table) {
            if tx
                .send(TableMessage::SnapshotComplete(watermark.clone()))
                .await
                .is_err()
            {
                debug!(table = %table, "Table loader stopped before snapshot completion");
            }
        }
        Ok(())
    }
}

/// Snapshot-then-stream pipeline from one MySQL server to one destination.
pub struct Pipeline {
    config: PipelineConfig,
    source: PipelineSource,
    destination: SharedDestination,
    checkpoints: SharedCheckpointBackend,
    tracker: Arc<SchemaTracker>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: PipelineSource,
        destination: SharedDestination,
        checkpoints: SharedCheckpointBackend,
    ) -> Self {
        Self {
            config,
            source,
            destination,
            checkpoints,
            tracker: Arc::new(SchemaTracker::new()),
        }
    }

    pub fn tracker(&self) -> Arc<SchemaTracker> {
        self.tracker.clone()
    }

    /// Run until the source ends or `shutdown` fires.
    ///
    /// Only checkpoint and startup failures are returned as errors; a source
    /// that gives up mid-run ends the run with `source_error` set.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<PipelineReport> {
        let (mut routes, mut report) = self.prepare().await?;
        let stop = shutdown.child_token();
        gauge!("binlake.pipeline.tables").set(routes.len() as f64);

        // workers
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_loads.max(1)));
        let mut senders = HashMap::new();
        let mut workers: Vec<(TableId, JoinHandle<TableReport>)> = Vec::new();
        for (table, route) in &routes {
            let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
            let loader = TableLoader::new(
                table.clone(),
                route.destination.clone(),
                self.config.batch.clone(),
                self.destination.clone(),
                self.checkpoints.clone(),
                route.checkpoint.clone(),
                self.tracker.clone(),
                permits.clone(),
            );
            senders.insert(table.clone(), tx);
            workers.push((table.clone(), tokio::spawn(loader.run(rx, stop.clone()))));
        }

        // snapshot
        let mut failed: HashMap<TableId, String> = HashMap::new();
        let to_snapshot: Vec<TableId> = routes
            .iter()
            .filter(|(_, r)| r.snapshot)
            .map(|(t, _)| t.clone())
            .collect();
        let mut snapshot_ok = true;
        if !to_snapshot.is_empty() && !stop.is_cancelled() {
            let coordinator = SnapshotCoordinator::new(
                self.config.snapshot.clone(),
                self.source.snapshot.clone(),
                self.tracker.clone(),
            );
            // the router's senders must be gone before the workers are joined
            let result = {
                let router = SnapshotRouter {
                    senders: to_snapshot
                        .iter()
                        .filter_map(|t| senders.get(t).map(|tx| (t.clone(), tx.clone())))
                        .collect(),
                };
                let run = coordinator.run(&to_snapshot, &router);
                tokio::pin!(run);
                tokio::select! {
                    result = &mut run => result,
                    _ = stop.cancelled() => {
                        coordinator.cancel();
                        run.await
                    }
                }
            };
            report.snapshot_rows = coordinator.stats().rows;

            match result {
                Ok(outcome) => {
                    for (table, e) in outcome.failed {
                        error!(table = %table, error = %e, "Table snapshot failed; table stopped");
                        senders.remove(&table);
                        failed.insert(table, e.to_string());
                    }
                    if let Some(watermark) = outcome.watermark {
                        for table in &outcome.completed {
                            if let Some(route) = routes.get_mut(table) {
                                route.checkpoint.start_snapshot(watermark.clone());
                                route.checkpoint.finish_snapshot();
                            }
                        }
                        info!(watermark = %watermark, tables = outcome.completed.len(), "Snapshot handed off to streaming");
                    }
                    snapshot_ok = !outcome.cancelled;
                    if snapshot_ok {
                        if let Err(e) = coordinator.advance(SnapshotPhase::Streaming) {
                            warn!(error = %e, "Snapshot coordinator refused the streaming phase");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Snapshot failed");
                    report.source_error = Some(e);
                    snapshot_ok = false;
                }
            }
            report.snapshot_phase = Some(coordinator.phase());
        }

        // stream
        if snapshot_ok && !stop.is_cancelled() {
            let filters: HashMap<TableId, HandoffFilter> = routes
                .iter()
                .filter(|(t, _)| senders.contains_key(*t))
                .map(|(t, r)| {
                    (
                        t.clone(),
                        HandoffFilter::new(r.checkpoint.watermark.clone(), r.checkpoint.committed.clone()),
                    )
                })
                .collect();
            let start = filters
                .values()
                .filter_map(|f| f.lower_bound())
                .min()
                .map(LogPosition::transaction_start);
            match start {
                Some(start) => {
                    let (stats, err) = self.stream(start, filters, &mut senders, &mut failed, &stop).await;
                    report.stream = Some(stats);
                    report.source_error = err;
                }
                None if !filters.is_empty() => {
                    warn!("No table has a position to stream from");
                }
                None => {}
            }
        }

        // a cancelled snapshot or a failed source leaves buffered events for replay
        if !snapshot_ok || report.source_error.is_some() {
            stop.cancel();
        }
        drop(senders);
        let handles: Vec<_> = workers.into_iter().map(|(t, h)| async move { (t, h.await) }).collect();
        for (table, joined) in join_all(handles).await {
            let mut table_report = match joined {
                Ok(r) => r,
                Err(e) => {
                    error!(table = %table, error = %e, "Table loader panicked");
                    let Some(route) = routes.remove(&table) else {
                        continue;
                    };
                    TableReport {
                        source: table.clone(),
                        table: route.destination,
                        status: TableStatus::Failed {
                            reason: format!("loader task failed: {}", e),
                        },
                        checkpoint: route.checkpoint,
                        stats: LoaderStats::default(),
                        load_error: None,
                        schema_error: None,
                    }
                }
            };
            if let Some(reason) = failed.remove(&table) {
                table_report.status = TableStatus::Failed { reason };
            }
            report.tables.push(table_report);
        }
        report.tables.sort_by(|a, b| a.source.cmp(&b.source));

        for t in &report.tables {
            if t.status.needs_attention() {
                warn!(table = %t.source, status = %t.status, "Table needs attention");
            }
        }
        Ok(report)
    }

    /// Load checkpoints and decide, per table, between snapshot and resume.
    async fn prepare(&self) -> Result<(HashMap<TableId, Route>, PipelineReport)> {
        let mut routes = HashMap::new();
        let mut report = PipelineReport::default();
        let mut latest: Option<LogPosition> = None;

        for mapping in &self.config.tables {
            let table = &mapping.source;
            let stored = self.checkpoints.load_table(table).await?;

            let (checkpoint, snapshot) = match stored {
                Some(cp) if cp.is_streaming() => {
                    info!(
                        table = %table,
                        resume = ?cp.resume_position().map(ToString::to_string),
                        "Resuming from checkpoint"
                    );
                    (cp, false)
                }
                stored => match &self.config.startup {
                    StartupMode::Initial => {
                        (stored.unwrap_or_else(|| TableCheckpoint::new(table.clone())), true)
                    }
                    StartupMode::Latest => {
                        let position = match &latest {
                            Some(p) => p.clone(),
                            None => {
                                let p = self.source.snapshot.current_position().await?;
                                latest = Some(p.clone());
                                p
                            }
                        };
                        (self.start_streaming(table, position).await?, false)
                    }
                    StartupMode::Position(position) => {
                        (self.start_streaming(table, position.clone()).await?, false)
                    }
                },
            };

            for position in &checkpoint.resolved {
                self.tracker.resolve(table, position.clone()).await;
            }

            if let Some(pause) = &checkpoint.paused {
                if !checkpoint.is_resolved(&pause.position) {
                    warn!(
                        table = %table,
                        position = %pause.position,
                        detail = %pause.detail,
                        "Table is paused on a schema change; skipping"
                    );
                    report.tables.push(TableReport {
                        source: table.clone(),
                        table: mapping.destination.clone(),
                        status: TableStatus::Paused {
                            position: pause.position.to_string(),
                            detail: pause.detail.clone(),
                        },
                        checkpoint: checkpoint.clone(),
                        stats: LoaderStats::default(),
                        load_error: None,
                        schema_error: None,
                    });
                    continue;
                }
            }

            if !snapshot {
                match &checkpoint.schema {
                    Some(schema) => self.tracker.register(schema.clone()).await,
                    None => {
                        let schema = self.source.snapshot.describe(table).await?;
                        self.tracker.register(schema).await;
                    }
                }
            }

            routes.insert(
                table.clone(),
                Route {
                    destination: mapping.destination.clone(),
                    checkpoint,
                    snapshot,
                },
            );
        }
        Ok((routes, report))
    }

    async fn start_streaming(&self, table: &TableId, position: LogPosition) -> Result<TableCheckpoint> {
        info!(table = %table, position = %position, mode = %self.config.startup, "Streaming without snapshot");
        let checkpoint = TableCheckpoint::streaming_from(table.clone(), position);
        self.checkpoints.save_table(&checkpoint).await?;
        Ok(checkpoint)
    }

    async fn stream(
        &self,
        start: LogPosition,
        filters: HashMap<TableId, HandoffFilter>,
        senders: &mut HashMap<TableId, mpsc::Sender<TableMessage>>,
        failed: &mut HashMap<TableId, String>,
        shutdown: &CancellationToken,
    ) -> (StreamStatsSnapshot, Option<CdcError>) {
        let mut tables: Vec<TableId> = filters.keys().cloned().collect();
        tables.sort();
        let config = StreamConfig {
            tables,
            ..self.config.stream.clone()
        };
        let mut stream = ChangeStream::new(
            self.source.connector.clone(),
            self.tracker.clone(),
            config,
            start.clone(),
        )
        .with_filters(filters);
        info!(start = %start, tables = senders.len(), "Streaming binlog");

        let mut source_error = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping change stream");
                    break;
                }
                next = stream.next() => next,
            };
            for (table, e) in stream.take_table_failures() {
                counter!("binlake.pipeline.table_failures", "table" => table.to_string()).increment(1);
                // dropping the sender lets the loader flush what it has and finish
                senders.remove(&table);
                failed.insert(table, e.to_string());
            }
            if senders.is_empty() {
                warn!("Every table stopped; ending change stream");
                break;
            }
            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    error!(
                        position = ?stream.position().map(ToString::to_string),
                        error = %e,
                        "Change stream failed"
                    );
                    counter!("binlake.pipeline.source_errors", "code" => e.error_code()).increment(1);
                    source_error = Some(e);
                    break;
                }
            };

            let table = event.table.clone();
            let Some(tx) = senders.get(&table) else {
                continue;
            };
            if tx.send(TableMessage::Event(event)).await.is_err() {
                info!(table = %table, "Table loader stopped; dropping its events");
                senders.remove(&table);
                if senders.is_empty() {
                    warn!("Every table stopped; ending change stream");
                    break;
                }
                continue;
            }
            counter!("binlake.pipeline.routed", "table" => table.to_string()).increment(1);
        }
        (stream.stats(), source_error)
    }
}

/// Fail early when the configured tables cannot be loaded side by side.
pub fn check_mappings(tables: &[TableMapping]) -> Result<()> {
    if tables.is_empty() {
        return Err(ConnectError::config("no tables configured"));
    }
    let mut seen: HashMap<&DestinationTable, &TableId> = HashMap::new();
    for mapping in tables {
        if let Some(other) = seen.insert(&mapping.destination, &mapping.source) {
            return Err(ConnectError::config(format!(
                "{} and {} both load into {}",
                other, mapping.source, mapping.destination
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_destination_rejected() {
        let tables = vec![
            TableMapping::new(TableId::new("a", "t"), DestinationTable::new("dw", "t")),
            TableMapping::new(TableId::new("b", "t"), DestinationTable::new("dw", "t")),
        ];
        let err = check_mappings(&tables).unwrap_err();
        assert!(err.to_string().contains("dw.t"));
        assert!(check_mappings(&tables[..1]).is_ok());
        assert!(check_mappings(&[]).is_err());
    }

    #[test]
    fn test_report_attention() {
        let mut report = PipelineReport::default();
        assert!(!report.needs_attention());
        report.tables.push(TableReport {
            source: TableId::new("shop", "orders"),
            table: DestinationTable::new("dw", "orders"),
            status: TableStatus::Stopped,
            checkpoint: TableCheckpoint::new(TableId::new("shop", "orders")),
            stats: LoaderStats::default(),
            load_error: None,
            schema_error: None,
        });
        assert!(!report.needs_attention());
        report.tables[0].status = TableStatus::Failed { reason: "x".into() };
        assert!(report.needs_attention());
        assert!(report.table(&TableId::new("shop", "orders")).is_some());
    }
}
