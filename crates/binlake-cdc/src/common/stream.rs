//! Ordered, reconnecting change stream
//!
//! [`ChangeStream`] turns raw binlog chunks into [`CdcEvent`]s:
//!
//! ```text
//! LogReader ──chunks──▶ EventFramer ──frames──▶ BinlogDecoder
//!                                                   │
//!                       transaction position ◀──────┘
//!                                │
//!            rows ──▶ row_to_json (tracker schema) ──▶ Insert/Update/Delete
//!            DDL  ──▶ SchemaTracker::evolve        ──▶ SchemaChange
//! ```
//!
//! Every delivered event carries a [`LogPosition`] anchored at the start of
//! its transaction. A dropped connection is reopened at that anchor and
//! everything up to the last delivered position is skipped, so the stream
//! neither loses nor repeats events.

use crate::common::{
    ddl, CdcError, CdcEvent, HandoffFilter, LogPosition, Result, RetryConfig, SchemaTracker,
    TableId,
};
use crate::mysql::convert::{row_to_json, ServerTimeZone};
use crate::mysql::decoder::{
    BinlogDecoder, BinlogEvent, EventFramer, EventHeader, QueryEvent, RowImage, RowsEvent,
    DEFAULT_MAX_EVENT_SIZE,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Opens a binlog reader at a position.
#[async_trait]
pub trait LogConnector: Send + Sync {
    /// Start reading at `from` (its transaction start; the caller skips
    /// whatever precedes `from` itself).
    async fn open(&self, from: &LogPosition) -> Result<Box<dyn LogReader>>;
}

/// Raw binlog bytes from one connection.
#[async_trait]
pub trait LogReader: Send {
    /// Next chunk of event bytes. `Ok(None)` when the source closed
    /// gracefully; `Err(ConnectionLost)` when the transport failed.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Change stream settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Tables to capture; empty captures every table the tracker knows
    pub tables: Vec<TableId>,
    /// Reconnect budget
    pub retry: RetryConfig,
    pub max_event_size: usize,
    /// Zone TIMESTAMP values are rendered in
    pub server_time_zone: ServerTimeZone,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            retry: RetryConfig::default(),
            max_event_size: DEFAULT_MAX_EVENT_SIZE,
            server_time_zone: ServerTimeZone::Utc,
        }
    }
}

impl StreamConfig {
    pub fn new(tables: Vec<TableId>) -> Self {
        Self {
            tables,
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_server_time_zone(mut self, tz: ServerTimeZone) -> Self {
        self.server_time_zone = tz;
        self
    }

    pub fn with_max_event_size(mut self, size: usize) -> Self {
        self.max_event_size = size;
        self
    }
}

/// Stream statistics.
#[derive(Debug, Default)]
pub struct StreamStats {
    /// Binlog events decoded
    pub events: AtomicU64,
    pub bytes: AtomicU64,
    pub reconnects: AtomicU64,
    /// Events dropped as already delivered or below a table's floor
    pub skipped: AtomicU64,
    /// Change events produced
    pub changes: AtomicU64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            changes: self.changes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatsSnapshot {
    pub events: u64,
    pub bytes: u64,
    pub reconnects: u64,
    pub skipped: u64,
    pub changes: u64,
}

/// Open transaction: start offset and index of the last event seen.
#[derive(Debug, Clone, Copy)]
struct Txn {
    offset: u64,
    event: u32,
}

/// Lazy, ordered stream of change events.
pub struct ChangeStream {
    connector: Arc<dyn LogConnector>,
    tracker: Arc<SchemaTracker>,
    config: StreamConfig,
    selected: HashSet<TableId>,
    filters: HashMap<TableId, HandoffFilter>,
    /// Tables whose rows can no longer be decoded: an unsupported schema
    /// change was handed out for them, or conversion failed
    halted: HashSet<TableId>,
    table_failures: Vec<(TableId, CdcError)>,

    reader: Option<Box<dyn LogReader>>,
    framer: EventFramer,
    decoder: BinlogDecoder,

    /// Current binlog file
    file: String,
    /// Offset of the event after the last one seen
    next_offset: u64,
    txn: Option<Txn>,

    /// Events ordered before this are not delivered
    start: LogPosition,
    /// Last position handed out (or skipped as out of scope)
    delivered: Option<LogPosition>,
    pending: VecDeque<CdcEvent>,
    failures: u32,
    finished: bool,
    stats: Arc<StreamStats>,
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("file", &self.file)
            .field("next_offset", &self.next_offset)
            .field("start", &self.start)
            .field("delivered", &self.delivered)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ChangeStream {
    /// Stream delivering events at or after `start`. Nothing is read until
    /// the first call to [`next`](Self::next).
    pub fn new(
        connector: Arc<dyn LogConnector>,
        tracker: Arc<SchemaTracker>,
        config: StreamConfig,
        start: LogPosition,
    ) -> Self {
        let selected = config.tables.iter().cloned().collect();
        let framer = EventFramer::new(config.max_event_size);
        Self {
            connector,
            tracker,
            config,
            selected,
            filters: HashMap::new(),
            halted: HashSet::new(),
            table_failures: Vec::new(),
            reader: None,
            framer,
            decoder: BinlogDecoder::new(),
            file: start.file.clone(),
            next_offset: start.offset,
            txn: None,
            start,
            delivered: None,
            pending: VecDeque::new(),
            failures: 0,
            finished: false,
            stats: Arc::new(StreamStats::default()),
        }
    }

    /// Per-table floors: events a table's filter rejects are dropped before
    /// conversion, so replayed DDL is not evolved twice.
    pub fn with_filters(mut self, filters: HashMap<TableId, HandoffFilter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn set_filter(&mut self, table: TableId, filter: HandoffFilter) {
        self.filters.insert(table, filter);
    }

    /// Reposition the stream; the next read reconnects at `position`.
    pub fn restart_from(&mut self, position: LogPosition) {
        info!(position = %position, "Restarting change stream");
        self.reader = None;
        self.framer.clear();
        self.pending.clear();
        self.txn = None;
        self.file = position.file.clone();
        self.next_offset = position.offset;
        self.start = position;
        self.delivered = None;
        self.finished = false;
    }

    /// Tables that stopped since the last call, with the error that stopped
    /// them. The stream itself keeps going for every other table.
    pub fn take_table_failures(&mut self) -> Vec<(TableId, CdcError)> {
        std::mem::take(&mut self.table_failures)
    }

    pub fn is_halted(&self, table: &TableId) -> bool {
        self.halted.contains(table)
    }

    /// Last position delivered.
    pub fn position(&self) -> Option<&LogPosition> {
        self.delivered.as_ref()
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn shared_stats(&self) -> Arc<StreamStats> {
        self.stats.clone()
    }

    /// Next change event; `None` once the source closed.
    pub async fn next(&mut self) -> Result<Option<CdcEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.stats.changes.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(event));
            }
            if let Some(frame) = self.framer.next_frame()? {
                self.handle_frame(&frame).await?;
                continue;
            }
            if self.finished {
                return Ok(None);
            }

            if self.reader.is_none() {
                self.connect(None).await?;
            }
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };
            match reader.next_chunk().await {
                Ok(Some(chunk)) => {
                    self.failures = 0;
                    self.stats
                        .bytes
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    self.framer.push(&chunk);
                }
                Ok(None) => {
                    info!(file = %self.file, offset = self.next_offset, "Binlog source closed");
                    self.reader = None;
                    self.finished = true;
                }
                Err(e) if e.is_retriable() => {
                    warn!(file = %self.file, offset = self.next_offset, error = %e, "Binlog connection lost");
                    self.reader = None;
                    self.connect(Some(e)).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Where a fresh connection must start to miss nothing.
    fn resume_point(&self) -> LogPosition {
        match self.txn {
            Some(txn) => LogPosition::new(self.file.clone(), txn.offset),
            None => LogPosition::new(self.file.clone(), self.next_offset.max(4)),
        }
    }

    async fn connect(&mut self, cause: Option<CdcError>) -> Result<()> {
        let mut last_error = cause;
        let mut backoff = self.config.retry.backoff();
        loop {
            if let Some(e) = last_error.take() {
                if !self.config.retry.should_retry(self.failures) {
                    warn!(attempts = self.failures, error = %e, "Reconnect budget spent");
                    return Err(e);
                }
                let delay = backoff.next_backoff();
                debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                tokio::time::sleep(delay).await;
                self.failures += 1;
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("binlake.stream.reconnects").increment(1);
            }

            let from = self.resume_point();
            self.framer.clear();
            self.txn = None;
            self.file = from.file.clone();
            self.next_offset = from.offset;
            match self.connector.open(&from).await {
                Ok(reader) => {
                    info!(position = %from, "Binlog stream opened");
                    self.reader = Some(reader);
                    return Ok(());
                }
                Err(e) if e.is_retriable() => {
                    warn!(position = %from, error = %e, "Failed to open binlog stream");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> Result<()> {
        let (event, header) = self.decoder.decode(frame)?;
        self.stats.events.fetch_add(1, Ordering::Relaxed);
        trace!(event_type = ?header.event_type, next = header.next_position, "binlog event");

        match event {
            BinlogEvent::Rotate(rotate) => {
                debug!(
                    file = %rotate.next_binlog,
                    position = rotate.position,
                    artificial = header.is_artificial(),
                    "Rotate"
                );
                self.file = rotate.next_binlog;
                self.next_offset = rotate.position;
                self.txn = None;
                return Ok(());
            }
            BinlogEvent::Heartbeat => return Ok(()),
            _ if header.is_artificial() => return Ok(()),
            _ => {}
        }

        let start = header.start_position();
        let timestamp = i64::from(header.timestamp);
        match event {
            BinlogEvent::Gtid(_) => {
                self.txn = Some(Txn {
                    offset: start,
                    event: 0,
                });
            }
            BinlogEvent::Query(query) => self.on_query(query, start, timestamp).await?,
            BinlogEvent::Xid(_) => {
                self.txn = None;
            }
            BinlogEvent::WriteRows(rows) => {
                let event = self.bump(start);
                self.on_rows(RowsKind::Insert, rows, event, timestamp).await?;
            }
            BinlogEvent::UpdateRows(rows) => {
                let event = self.bump(start);
                self.on_rows(RowsKind::Update, rows, event, timestamp).await?;
            }
            BinlogEvent::DeleteRows(rows) => {
                let event = self.bump(start);
                self.on_rows(RowsKind::Delete, rows, event, timestamp).await?;
            }
            BinlogEvent::TableMap(_) => {
                self.bump(start);
            }
            BinlogEvent::FormatDescription(_) | BinlogEvent::Unknown(_) => {
                if self.txn.is_some() {
                    self.bump(start);
                }
            }
            BinlogEvent::Rotate(_) | BinlogEvent::Heartbeat => {}
        }
        self.advance_offset(&header);
        Ok(())
    }

    fn advance_offset(&mut self, header: &EventHeader) {
        if header.next_position > 0 {
            self.next_offset = u64::from(header.next_position);
        }
    }

    /// Count one more event in the open transaction, opening one at
    /// `start` if rows arrive without BEGIN.
    fn bump(&mut self, start: u64) -> (u64, u32) {
        let txn = self.txn.get_or_insert(Txn {
            offset: start,
            event: 0,
        });
        txn.event += 1;
        (txn.offset, txn.event)
    }

    fn is_delivered(&self, position: &LogPosition) -> bool {
        *position < self.start || self.delivered.as_ref().is_some_and(|d| position <= d)
    }

    fn mark(&mut self, position: &LogPosition) {
        if self.delivered.as_ref().map_or(true, |d| position > d) {
            self.delivered = Some(position.clone());
        }
    }

    fn admits(&self, table: &TableId, position: &LogPosition) -> bool {
        self.filters
            .get(table)
            .map_or(true, |f| f.admits_position(position))
    }

    fn is_selected(&self, table: &TableId) -> bool {
        (self.selected.is_empty() || self.selected.contains(table)) && !self.halted.contains(table)
    }

    fn halt(&mut self, table: &TableId, error: CdcError) {
        if self.halted.insert(table.clone()) {
            error!(table = %table, error = %error, "Table stopped; stream continues for the others");
            self.table_failures.push((table.clone(), error));
        }
    }

    async fn on_query(&mut self, query: QueryEvent, start: u64, timestamp: i64) -> Result<()> {
        let sql = query.query.trim();
        if ddl::is_transaction_control(sql) {
            let head = sql.get(..6).unwrap_or(sql).to_ascii_uppercase();
            if head.starts_with("BEGIN") {
                match self.txn.as_mut() {
                    Some(txn) => txn.event += 1,
                    None => {
                        self.txn = Some(Txn {
                            offset: start,
                            event: 0,
                        })
                    }
                }
            } else if head.starts_with("COMMIT") || head.starts_with("ROLLBA") {
                self.txn = None;
            } else if self.txn.is_some() {
                self.bump(start);
            }
            return Ok(());
        }

        let parsed = ddl::parse(sql);
        if matches!(parsed, Ok(ddl::DdlStatement::Other)) {
            // statement-based DML, SET, FLUSH ...
            if self.txn.is_some() {
                self.bump(start);
            }
            return Ok(());
        }

        // DDL commits implicitly
        let position = match self.txn.take() {
            Some(txn) => LogPosition::at(self.file.clone(), txn.offset, txn.event + 1, 0),
            None => LogPosition::new(self.file.clone(), start),
        };
        if self.is_delivered(&position) {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.mark(&position);

        let tables: Vec<TableId> = match &parsed {
            Ok(statement) => statement.tables(&query.schema),
            Err(e) => {
                // Route to whichever captured table the text names; the
                // tracker turns it into an unsupported change.
                let lower = sql.to_ascii_lowercase();
                let named: Vec<TableId> = self
                    .selected
                    .iter()
                    .filter(|t| lower.contains(&t.table.to_ascii_lowercase()))
                    .cloned()
                    .collect();
                warn!(position = %position, error = %e, tables = named.len(), "Could not parse DDL");
                named
            }
        };

        for table in tables {
            if !self.is_selected(&table) {
                continue;
            }
            if !self.admits(&table, &position) {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Some(evolution) = self.tracker.evolve(&table, sql, &position).await? {
                if !evolution.is_compatible() && !evolution.resolved {
                    // the tracked layout no longer describes the table's rows
                    info!(table = %table, position = %position, "Skipping further events of table until resolved");
                    self.halted.insert(table.clone());
                }
                self.pending
                    .push_back(CdcEvent::schema_change(evolution, timestamp));
            }
        }
        Ok(())
    }

    async fn on_rows(
        &mut self,
        kind: RowsKind,
        rows: RowsEvent,
        (txn_offset, event): (u64, u32),
        timestamp: i64,
    ) -> Result<()> {
        let Some(map) = self.decoder.table(rows.table_id) else {
            return Err(crate::common::DecodeError::UnknownTable(rows.table_id).into());
        };
        let table = TableId::new(map.schema_name.clone(), map.table_name.clone());

        let selected = if self.halted.contains(&table) {
            false
        } else if self.selected.is_empty() {
            self.tracker.is_tracked(&table).await
        } else {
            self.selected.contains(&table)
        };
        let last = LogPosition::at(
            self.file.clone(),
            txn_offset,
            event,
            rows.rows.len().saturating_sub(1) as u32,
        );
        if !selected {
            trace!(table = %table, "Skipping rows of uncaptured table");
            self.mark(&last);
            return Ok(());
        }

        let Some(schema) = self.tracker.current(&table).await else {
            self.mark(&last);
            self.halt(
                &table,
                CdcError::schema(format!("no schema registered for captured table {}", table)),
            );
            return Ok(());
        };
        let tz = self.config.server_time_zone;
        let to_json = |image: &RowImage| -> Result<Value> {
            Ok(Value::Object(row_to_json(&schema, image, &tz)?))
        };

        let mut changes = Vec::with_capacity(rows.rows.len());
        let mut converted = None;
        for (idx, row) in rows.rows.iter().enumerate() {
            let position = LogPosition::at(self.file.clone(), txn_offset, event, idx as u32);
            if self.is_delivered(&position) || !self.admits(&table, &position) {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let change = match kind {
                RowsKind::Insert => {
                    let after = row.after.as_ref().ok_or_else(|| missing_image(&table, "after"))?;
                    to_json(after).map(|after| {
                        CdcEvent::insert(table.clone(), after, position.clone(), timestamp)
                    })
                }
                RowsKind::Update => {
                    let after = row.after.as_ref().ok_or_else(|| missing_image(&table, "after"))?;
                    row.before
                        .as_ref()
                        .map(&to_json)
                        .transpose()
                        .and_then(|before| Ok((before, to_json(after)?)))
                        .map(|(before, after)| {
                            CdcEvent::update(table.clone(), before, after, position.clone(), timestamp)
                        })
                }
                RowsKind::Delete => {
                    let before = row.before.as_ref().ok_or_else(|| missing_image(&table, "before"))?;
                    to_json(before).map(|before| {
                        CdcEvent::delete(table.clone(), before, position.clone(), timestamp)
                    })
                }
            };
            match change {
                Ok(change) => changes.push((position, change)),
                Err(e) => {
                    converted = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = converted {
            // nothing of this event is handed out for the table
            self.mark(&last);
            self.halt(&table, e);
            return Ok(());
        }
        for (position, change) in changes {
            self.mark(&position);
            self.pending.push_back(change);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum RowsKind {
    Insert,
    Update,
    Delete,
}

fn missing_image(table: &TableId, which: &str) -> CdcError {
    crate::common::DecodeError::corrupt(format!("rows event for {} without {} image", table, which))
        .into()
}
