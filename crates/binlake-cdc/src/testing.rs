//! Test doubles for the change pipeline
//!
//! - [`BinlogBuilder`] writes binlog events the way a MySQL 8.0 server does
//! - [`MemoryBinlog`] serves those files through [`LogConnector`], with
//!   chunk splitting and one-shot disconnects
//! - [`MemorySnapshotSource`] answers snapshot reads from in-memory rows
//!
//! Enabled for unit tests and behind the `testing` feature for the other
//! crates in the workspace.

use crate::common::{
    CdcError, LogConnector, LogPosition, LogReader, Result, SchemaVersion, SnapshotSource,
    TableId,
};
use crate::mysql::decoder::{ColumnType, EventHeader, EventType, ARTIFICIAL_FLAG};
use async_trait::async_trait;
use bytes::{BufMut, Bytes};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

const SERVER_VERSION: &str = "8.0.36-binlake";
const SERVER_ID: u32 = 1;
/// Post-header lengths of a MySQL 8.0 FORMAT_DESCRIPTION
const POST_HEADER_LENGTHS: usize = 41;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Event encoding
// ============================================================================

/// Column as declared in a TABLE_MAP event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinlogColumn {
    pub column_type: ColumnType,
    pub metadata: u16,
}

impl BinlogColumn {
    pub fn new(column_type: ColumnType, metadata: u16) -> Self {
        Self {
            column_type,
            metadata,
        }
    }

    pub fn tiny() -> Self {
        Self::new(ColumnType::Tiny, 0)
    }

    pub fn short() -> Self {
        Self::new(ColumnType::Short, 0)
    }

    pub fn long() -> Self {
        Self::new(ColumnType::Long, 0)
    }

    pub fn longlong() -> Self {
        Self::new(ColumnType::LongLong, 0)
    }

    pub fn double() -> Self {
        Self::new(ColumnType::Double, 8)
    }

    /// DECIMAL(precision, scale); values go in as [`BinlogValue::Raw`].
    pub fn decimal(precision: u8, scale: u8) -> Self {
        Self::new(
            ColumnType::NewDecimal,
            (u16::from(precision) << 8) | u16::from(scale),
        )
    }

    /// VARCHAR with a maximum length in bytes.
    pub fn varchar(max_bytes: u16) -> Self {
        Self::new(ColumnType::Varchar, max_bytes)
    }

    pub fn blob() -> Self {
        Self::new(ColumnType::Blob, 2)
    }

    pub fn json() -> Self {
        Self::new(ColumnType::Json, 4)
    }

    pub fn date() -> Self {
        Self::new(ColumnType::Date, 0)
    }

    pub fn datetime2(fsp: u8) -> Self {
        Self::new(ColumnType::DateTime2, u16::from(fsp))
    }

    pub fn timestamp2(fsp: u8) -> Self {
        Self::new(ColumnType::Timestamp2, u16::from(fsp))
    }

    pub fn year() -> Self {
        Self::new(ColumnType::Year, 0)
    }

    fn write_metadata(&self, out: &mut Vec<u8>) {
        match self.column_type {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Json
            | ColumnType::Geometry
            | ColumnType::Time2
            | ColumnType::DateTime2
            | ColumnType::Timestamp2 => out.put_u8(self.metadata as u8),
            ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit => {
                out.put_u16_le(self.metadata)
            }
            ColumnType::NewDecimal | ColumnType::String | ColumnType::Enum | ColumnType::Set => {
                out.put_u16(self.metadata)
            }
            _ => {}
        }
    }
}

/// One cell of a row image.
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogValue {
    Null,
    /// Any integer column; YEAR takes the offset from 1900
    Int(i64),
    Double(f64),
    Bytes(Vec<u8>),
    Date(u16, u8, u8),
    /// year, month, day, hour, minute, second, microsecond
    DateTime(u16, u8, u8, u8, u8, u8, u32),
    /// epoch seconds, microsecond
    Timestamp(u32, u32),
    /// Pre-encoded cell
    Raw(Vec<u8>),
}

impl BinlogValue {
    pub fn text(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }

    fn encode(&self, column: &BinlogColumn, out: &mut Vec<u8>) {
        match (self, column.column_type) {
            (BinlogValue::Null, _) => {}
            (BinlogValue::Raw(bytes), _) => out.extend_from_slice(bytes),
            (BinlogValue::Int(v), ColumnType::Tiny | ColumnType::Year) => out.put_u8(*v as u8),
            (BinlogValue::Int(v), ColumnType::Short) => out.put_u16_le(*v as u16),
            (BinlogValue::Int(v), ColumnType::Int24) => out.put_uint_le(*v as u64 & 0xFF_FFFF, 3),
            (BinlogValue::Int(v), ColumnType::Long) => out.put_u32_le(*v as u32),
            (BinlogValue::Int(v), _) => out.put_u64_le(*v as u64),
            (BinlogValue::Double(v), _) => out.put_f64_le(*v),
            (BinlogValue::Bytes(b), ColumnType::Blob | ColumnType::Json) => {
                let width = usize::from(column.metadata).clamp(1, 4);
                out.put_uint_le(b.len() as u64, width);
                out.extend_from_slice(b);
            }
            (BinlogValue::Bytes(b), _) => {
                if column.metadata < 256 {
                    out.put_u8(b.len() as u8);
                } else {
                    out.put_u16_le(b.len() as u16);
                }
                out.extend_from_slice(b);
            }
            (BinlogValue::Date(y, m, d), _) => {
                let packed = (u32::from(*y) << 9) | (u32::from(*m) << 5) | u32::from(*d);
                out.put_uint_le(u64::from(packed), 3);
            }
            (BinlogValue::DateTime(y, mo, d, h, mi, s, micros), _) => {
                let ym = u64::from(*y) * 13 + u64::from(*mo);
                let ymd = (ym << 5) | u64::from(*d);
                let hms = (u64::from(*h) << 12) | (u64::from(*mi) << 6) | u64::from(*s);
                out.put_uint((ymd << 17 | hms) + 0x80_0000_0000, 5);
                put_fraction(out, *micros, column.metadata as u8);
            }
            (BinlogValue::Timestamp(secs, micros), _) => {
                out.put_u32(*secs);
                put_fraction(out, *micros, column.metadata as u8);
            }
        }
    }
}

fn put_fraction(out: &mut Vec<u8>, micros: u32, fsp: u8) {
    let bytes = usize::from(fsp.min(6)).div_ceil(2);
    if bytes > 0 {
        let raw = micros / 10u32.pow(6 - 2 * bytes as u32);
        out.put_uint(u64::from(raw), bytes);
    }
}

fn put_packed_int(out: &mut Vec<u8>, v: u64) {
    match v {
        0..=250 => out.put_u8(v as u8),
        251..=0xFFFF => {
            out.put_u8(0xFC);
            out.put_u16_le(v as u16);
        }
        0x1_0000..=0xFF_FFFF => {
            out.put_u8(0xFD);
            out.put_uint_le(v, 3);
        }
        _ => {
            out.put_u8(0xFE);
            out.put_u64_le(v);
        }
    }
}

/// Header + payload (+ CRC32 trailer).
fn encode_event(
    event_type: EventType,
    timestamp: u32,
    next_position: u32,
    flags: u16,
    payload: &[u8],
    checksum: bool,
) -> Vec<u8> {
    let trailer = if checksum { 4 } else { 0 };
    let length = EventHeader::SIZE + payload.len() + trailer;
    let mut out = Vec::with_capacity(length);
    out.put_u32_le(timestamp);
    out.put_u8(event_type as u8);
    out.put_u32_le(SERVER_ID);
    out.put_u32_le(length as u32);
    out.put_u32_le(next_position);
    out.put_u16_le(flags);
    out.extend_from_slice(payload);
    if checksum {
        let crc = crc32fast::hash(&out);
        out.put_u32_le(crc);
    }
    out
}

fn present_bitmap(columns: usize) -> Vec<u8> {
    let mut bitmap = vec![0xFFu8; columns.div_ceil(8)];
    if columns % 8 != 0 {
        if let Some(last) = bitmap.last_mut() {
            *last = (1u8 << (columns % 8)) - 1;
        }
    }
    bitmap
}

/// Writes one binlog file, event by event.
///
/// Event methods return the offset the event starts at, which is what a
/// [`LogPosition`] anchors on.
#[derive(Debug, Clone)]
pub struct BinlogBuilder {
    file: String,
    bytes: Vec<u8>,
    checksum: bool,
    timestamp: u32,
}

impl BinlogBuilder {
    /// Empty file with CRC32 checksums on.
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            bytes: Vec::new(),
            checksum: true,
            timestamp: 1_700_000_000,
        }
    }

    pub fn without_checksum(mut self) -> Self {
        self.checksum = false;
        self
    }

    /// Header timestamp of the following events.
    pub fn at_time(&mut self, timestamp: u32) -> &mut Self {
        self.timestamp = timestamp;
        self
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn has_checksum(&self) -> bool {
        self.checksum
    }

    /// Events written so far; the file's magic header is not included.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Offset the next event will start at.
    pub fn offset(&self) -> u64 {
        4 + self.bytes.len() as u64
    }

    /// Position of a transaction starting at `offset` in this file.
    pub fn position(&self, offset: u64) -> LogPosition {
        LogPosition::new(self.file.clone(), offset)
    }

    fn push(&mut self, event_type: EventType, payload: &[u8], checksum: bool) -> u64 {
        let start = self.offset();
        let length = EventHeader::SIZE + payload.len() + if checksum { 4 } else { 0 };
        let next = (start + length as u64) as u32;
        let event = encode_event(event_type, self.timestamp, next, 0, payload, checksum);
        self.bytes.extend_from_slice(&event);
        start
    }

    pub fn format_description(&mut self) -> u64 {
        let mut p = Vec::with_capacity(100);
        p.put_u16_le(4);
        let mut version = [0u8; 50];
        version[..SERVER_VERSION.len()].copy_from_slice(SERVER_VERSION.as_bytes());
        p.extend_from_slice(&version);
        p.put_u32_le(self.timestamp);
        p.put_u8(EventHeader::SIZE as u8);
        p.extend_from_slice(&[0u8; POST_HEADER_LENGTHS]);
        if self.checksum {
            p.put_u8(1);
            self.push(EventType::FormatDescriptionEvent, &p, true)
        } else {
            p.put_u8(0);
            p.put_u32_le(0);
            self.push(EventType::FormatDescriptionEvent, &p, false)
        }
    }

    pub fn table_map(&mut self, table_id: u64, db: &str, table: &str, columns: &[BinlogColumn]) -> u64 {
        let mut p = Vec::new();
        p.put_uint_le(table_id, 6);
        p.put_u16_le(1);
        p.put_u8(db.len() as u8);
        p.extend_from_slice(db.as_bytes());
        p.put_u8(0);
        p.put_u8(table.len() as u8);
        p.extend_from_slice(table.as_bytes());
        p.put_u8(0);
        put_packed_int(&mut p, columns.len() as u64);
        p.extend(columns.iter().map(|c| c.column_type as u8));
        let mut metadata = Vec::new();
        for c in columns {
            c.write_metadata(&mut metadata);
        }
        put_packed_int(&mut p, metadata.len() as u64);
        p.extend_from_slice(&metadata);
        p.extend_from_slice(&present_bitmap(columns.len()));
        let checksum = self.checksum;
        self.push(EventType::TableMapEvent, &p, checksum)
    }

    fn rows_header(table_id: u64, columns: usize, images: usize) -> Vec<u8> {
        let mut p = Vec::new();
        p.put_uint_le(table_id, 6);
        p.put_u16_le(0x0001); // end of statement
        p.put_u16_le(2); // v2 extra data: length only
        put_packed_int(&mut p, columns as u64);
        for _ in 0..images {
            p.extend_from_slice(&present_bitmap(columns));
        }
        p
    }

    fn write_image(p: &mut Vec<u8>, columns: &[BinlogColumn], row: &[BinlogValue]) {
        let mut nulls = vec![0u8; columns.len().div_ceil(8)];
        for (i, v) in row.iter().enumerate() {
            if *v == BinlogValue::Null {
                nulls[i / 8] |= 1 << (i % 8);
            }
        }
        p.extend_from_slice(&nulls);
        for (value, column) in row.iter().zip(columns) {
            value.encode(column, p);
        }
    }

    pub fn write_rows(&mut self, table_id: u64, columns: &[BinlogColumn], rows: &[Vec<BinlogValue>]) -> u64 {
        let mut p = Self::rows_header(table_id, columns.len(), 1);
        for row in rows {
            Self::write_image(&mut p, columns, row);
        }
        let checksum = self.checksum;
        self.push(EventType::WriteRowsEventV2, &p, checksum)
    }

    pub fn update_rows(
        &mut self,
        table_id: u64,
        columns: &[BinlogColumn],
        rows: &[(Vec<BinlogValue>, Vec<BinlogValue>)],
    ) -> u64 {
        let mut p = Self::rows_header(table_id, columns.len(), 2);
        for (before, after) in rows {
            Self::write_image(&mut p, columns, before);
            Self::write_image(&mut p, columns, after);
        }
        let checksum = self.checksum;
        self.push(EventType::UpdateRowsEventV2, &p, checksum)
    }

    pub fn delete_rows(&mut self, table_id: u64, columns: &[BinlogColumn], rows: &[Vec<BinlogValue>]) -> u64 {
        let mut p = Self::rows_header(table_id, columns.len(), 1);
        for row in rows {
            Self::write_image(&mut p, columns, row);
        }
        let checksum = self.checksum;
        self.push(EventType::DeleteRowsEventV2, &p, checksum)
    }

    pub fn query(&mut self, schema: &str, sql: &str) -> u64 {
        let mut p = Vec::new();
        p.put_u32_le(11); // thread id
        p.put_u32_le(0); // exec time
        p.put_u8(schema.len() as u8);
        p.put_u16_le(0); // error code
        p.put_u16_le(0); // status vars
        p.extend_from_slice(schema.as_bytes());
        p.put_u8(0);
        p.extend_from_slice(sql.as_bytes());
        let checksum = self.checksum;
        self.push(EventType::QueryEvent, &p, checksum)
    }

    pub fn xid(&mut self, xid: u64) -> u64 {
        let checksum = self.checksum;
        self.push(EventType::XidEvent, &xid.to_le_bytes(), checksum)
    }

    pub fn gtid(&mut self, gno: u64) -> u64 {
        let mut p = Vec::new();
        p.put_u8(1);
        p.extend_from_slice(&[0x3E; 16]);
        p.put_u64_le(gno);
        let checksum = self.checksum;
        self.push(EventType::GtidLogEvent, &p, checksum)
    }

    pub fn rotate(&mut self, next_file: &str, position: u64) -> u64 {
        let mut p = Vec::new();
        p.put_u64_le(position);
        p.extend_from_slice(next_file.as_bytes());
        let checksum = self.checksum;
        self.push(EventType::RotateEvent, &p, checksum)
    }

    pub fn heartbeat(&mut self) -> u64 {
        let file = self.file.clone();
        let checksum = self.checksum;
        self.push(EventType::HeartbeatLogEvent, file.as_bytes(), checksum)
    }

    /// Insert-only transaction: `GTID, BEGIN, TABLE_MAP, WRITE_ROWS, XID`.
    /// Returns the transaction's position.
    pub fn insert_txn(
        &mut self,
        table_id: u64,
        table: &TableId,
        columns: &[BinlogColumn],
        rows: &[Vec<BinlogValue>],
    ) -> LogPosition {
        let start = self.begin_txn(table_id, table, columns);
        self.write_rows(table_id, columns, rows);
        self.xid(start);
        self.position(start)
    }

    /// `GTID, BEGIN, TABLE_MAP`; the caller adds rows events and the XID.
    pub fn begin_txn(&mut self, table_id: u64, table: &TableId, columns: &[BinlogColumn]) -> u64 {
        let start = self.gtid(self.offset());
        self.query(&table.database, "BEGIN");
        self.table_map(table_id, &table.database, &table.table, columns);
        start
    }
}

// ============================================================================
// In-memory binlog
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryFile {
    name: String,
    checksum: bool,
    /// (start offset, event bytes)
    events: Vec<(u64, Bytes)>,
}

#[derive(Debug, Default)]
struct BinlogState {
    files: Vec<MemoryFile>,
    split_chunks: bool,
    disconnect_before: Option<(String, u64)>,
    fail_opens: u32,
    opens: Vec<LogPosition>,
}

/// Binlog server in memory.
///
/// `open(pos)` replays what MySQL sends after COM_BINLOG_DUMP: a fake
/// ROTATE to `pos`, the file's FORMAT_DESCRIPTION, then every event from
/// `pos.offset` on, continuing through later files. The reader ends
/// (`Ok(None)`) once the last file is exhausted.
#[derive(Debug, Clone, Default)]
pub struct MemoryBinlog {
    state: Arc<Mutex<BinlogState>>,
}

impl MemoryBinlog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the builder's file, replacing an earlier copy of the same name.
    pub fn add(&self, builder: &BinlogBuilder) {
        let mut events = Vec::new();
        let bytes = builder.bytes();
        let mut at = 0usize;
        while at + EventHeader::SIZE <= bytes.len() {
            let len = u32::from_le_bytes([bytes[at + 9], bytes[at + 10], bytes[at + 11], bytes[at + 12]])
                as usize;
            let end = (at + len).min(bytes.len());
            events.push((4 + at as u64, Bytes::copy_from_slice(&bytes[at..end])));
            at = end;
        }
        let file = MemoryFile {
            name: builder.file().to_string(),
            checksum: builder.has_checksum(),
            events,
        };
        let mut state = lock(&self.state);
        match state.files.iter_mut().find(|f| f.name == file.name) {
            Some(existing) => *existing = file,
            None => state.files.push(file),
        }
    }

    /// Deliver every event in two chunks, split inside the header.
    pub fn split_chunks(&self, split: bool) {
        lock(&self.state).split_chunks = split;
    }

    /// Drop the connection once, just before the event at `offset` of `file`.
    pub fn disconnect_before(&self, file: &str, offset: u64) {
        lock(&self.state).disconnect_before = Some((file.to_string(), offset));
    }

    /// Fail the next `n` opens with a lost connection.
    pub fn fail_opens(&self, n: u32) {
        lock(&self.state).fail_opens = n;
    }

    /// Positions passed to `open`, oldest first.
    pub fn opens(&self) -> Vec<LogPosition> {
        lock(&self.state).opens.clone()
    }

    /// Position just past the last event of the last file.
    pub fn end_position(&self) -> Option<LogPosition> {
        let state = lock(&self.state);
        let file = state.files.last()?;
        let end = file
            .events
            .last()
            .map(|(offset, bytes)| offset + bytes.len() as u64)
            .unwrap_or(4);
        Some(LogPosition::new(file.name.clone(), end))
    }
}

fn fake_rotate(file: &str, offset: u64, checksum: bool) -> Bytes {
    let mut p = Vec::new();
    p.put_u64_le(offset);
    p.extend_from_slice(file.as_bytes());
    Bytes::from(encode_event(EventType::RotateEvent, 0, 0, ARTIFICIAL_FLAG, &p, checksum))
}

/// FDE replayed ahead of a mid-file start carries `log_pos = 0`.
fn replayed_fde(fde: &[u8], checksum: bool) -> Bytes {
    let mut event = fde.to_vec();
    event[13..17].copy_from_slice(&0u32.to_le_bytes());
    if checksum {
        let end = event.len() - 4;
        let crc = crc32fast::hash(&event[..end]);
        event[end..].copy_from_slice(&crc.to_le_bytes());
    }
    Bytes::from(event)
}

#[async_trait]
impl LogConnector for MemoryBinlog {
    async fn open(&self, from: &LogPosition) -> Result<Box<dyn LogReader>> {
        let mut state = lock(&self.state);
        state.opens.push(from.clone());
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(CdcError::connection_lost("connection refused by memory binlog"));
        }

        let first = state
            .files
            .iter()
            .position(|f| f.name == from.file)
            .ok_or_else(|| {
                CdcError::mysql(format!(
                    "1236 - Could not find first log file name in binary log index file ({})",
                    from.file
                ))
            })?;

        let mut queue = VecDeque::new();
        let head = &state.files[first];
        queue.push_back((None, fake_rotate(&head.name, from.offset.max(4), head.checksum)));
        for (i, file) in state.files[first..].iter().enumerate() {
            let Some((_, fde)) = file.events.first() else {
                continue;
            };
            let resume_mid_file = i == 0 && from.offset > 4;
            if resume_mid_file {
                queue.push_back((None, replayed_fde(fde, file.checksum)));
            } else {
                queue.push_back((Some((file.name.clone(), 4)), fde.clone()));
            }
            let start = if i == 0 { from.offset.max(4) } else { 4 };
            for (offset, event) in file.events.iter().skip(1) {
                if *offset >= start {
                    queue.push_back((Some((file.name.clone(), *offset)), event.clone()));
                }
            }
        }

        Ok(Box::new(MemoryLogReader {
            state: self.state.clone(),
            queue,
            split: state.split_chunks,
            tail: None,
        }))
    }
}

struct MemoryLogReader {
    state: Arc<Mutex<BinlogState>>,
    /// (file, offset) of real events, the bytes to deliver
    queue: VecDeque<(Option<(String, u64)>, Bytes)>,
    split: bool,
    tail: Option<Bytes>,
}

#[async_trait]
impl LogReader for MemoryLogReader {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(tail) = self.tail.take() {
            return Ok(Some(tail));
        }
        let Some((at, event)) = self.queue.pop_front() else {
            return Ok(None);
        };
        if let Some(at) = at {
            let mut state = lock(&self.state);
            if state.disconnect_before.as_ref() == Some(&at) {
                state.disconnect_before = None;
                self.queue.clear();
                return Err(CdcError::connection_lost(format!(
                    "memory binlog disconnected before {}:{}",
                    at.0, at.1
                )));
            }
        }
        if self.split && event.len() > 7 {
            self.tail = Some(event.slice(7..));
            return Ok(Some(event.slice(..7)));
        }
        Ok(Some(event))
    }
}

// ============================================================================
// In-memory snapshot source
// ============================================================================

#[derive(Debug, Default)]
struct SnapshotState {
    watermark: Option<LogPosition>,
    schemas: HashMap<TableId, SchemaVersion>,
    rows: HashMap<TableId, Vec<Value>>,
    failing: HashMap<TableId, u32>,
    open: bool,
    begins: u32,
}

/// Snapshot reads served from rows held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotSource {
    state: Arc<Mutex<SnapshotState>>,
}

impl MemorySnapshotSource {
    /// Source whose read view reflects `watermark`.
    pub fn new(watermark: LogPosition) -> Self {
        let source = Self::default();
        lock(&source.state).watermark = Some(watermark);
        source
    }

    pub fn add_table(&self, schema: SchemaVersion, rows: Vec<Value>) {
        let mut state = lock(&self.state);
        state.rows.insert(schema.table.clone(), rows);
        state.schemas.insert(schema.table.clone(), schema);
    }

    pub fn set_watermark(&self, watermark: LogPosition) {
        lock(&self.state).watermark = Some(watermark);
    }

    /// Fail the next `n` fetches of `table` with a lost connection.
    pub fn fail_fetches(&self, table: &TableId, n: u32) {
        lock(&self.state).failing.insert(table.clone(), n);
    }

    /// Read views opened so far.
    pub fn begins(&self) -> u32 {
        lock(&self.state).begins
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }
}

fn compare_json(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| compare_json(x, y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn key_of(row: &Value, key_columns: &[String]) -> Vec<Value> {
    key_columns
        .iter()
        .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
        .collect()
}

#[async_trait]
impl SnapshotSource for MemorySnapshotSource {
    async fn begin(&self) -> Result<LogPosition> {
        let mut state = lock(&self.state);
        state.open = true;
        state.begins += 1;
        state
            .watermark
            .clone()
            .ok_or_else(|| CdcError::invalid_state("memory snapshot source has no watermark"))
    }

    async fn describe(&self, table: &TableId) -> Result<SchemaVersion> {
        lock(&self.state)
            .schemas
            .get(table)
            .cloned()
            .ok_or_else(|| CdcError::schema(format!("table {} does not exist", table)))
    }

    async fn fetch_batch(
        &self,
        table: &TableId,
        key_columns: &[String],
        last_key: Option<&[Value]>,
        batch_size: usize,
    ) -> Result<Vec<Value>> {
        let mut state = lock(&self.state);
        if let Some(remaining) = state.failing.get_mut(table) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CdcError::connection_lost(format!(
                    "injected fetch failure on {}",
                    table
                )));
            }
        }
        let mut rows: Vec<Value> = state.rows.get(table).cloned().unwrap_or_default();
        rows.sort_by(|a, b| compare_keys(&key_of(a, key_columns), &key_of(b, key_columns)));
        Ok(rows
            .into_iter()
            .filter(|row| {
                last_key.map_or(true, |last| {
                    compare_keys(&key_of(row, key_columns), last) == Ordering::Greater
                })
            })
            .take(batch_size)
            .collect())
    }

    async fn end(&self) -> Result<()> {
        lock(&self.state).open = false;
        Ok(())
    }

    async fn current_position(&self) -> Result<LogPosition> {
        lock(&self.state)
            .watermark
            .clone()
            .ok_or_else(|| CdcError::invalid_state("memory snapshot source has no watermark"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql::decoder::{BinlogDecoder, BinlogEvent, EventFramer};

    #[tokio::test]
    async fn test_memory_binlog_replays_from_position() {
        let mut b = BinlogBuilder::new("mysql-bin.000001");
        b.format_description();
        b.xid(1);
        let second = b.xid(2);
        let binlog = MemoryBinlog::new();
        binlog.add(&b);

        let mut reader = binlog.open(&b.position(second)).await.unwrap();
        let mut framer = EventFramer::default();
        let mut decoder = BinlogDecoder::new();
        let mut events = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            framer.push(&chunk);
            while let Some(frame) = framer.next_frame().unwrap() {
                events.push(decoder.decode(&frame).unwrap());
            }
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0].0, BinlogEvent::Rotate(r) if r.position == second));
        assert!(events[0].1.is_artificial());
        assert!(events[1].1.is_artificial());
        assert!(matches!(&events[2].0, BinlogEvent::Xid(x) if x.xid == 2));
        assert_eq!(binlog.opens(), vec![b.position(second)]);
    }

    #[tokio::test]
    async fn test_memory_binlog_unknown_file() {
        let binlog = MemoryBinlog::new();
        let err = binlog
            .open(&LogPosition::new("mysql-bin.000009", 4))
            .await
            .err()
            .unwrap();
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_memory_snapshot_keyset_pages() {
        use crate::common::{ColumnDef, SqlType};
        use serde_json::json;

        let t = TableId::new("db", "t");
        let source = MemorySnapshotSource::new(LogPosition::new("mysql-bin.000001", 4));
        source.add_table(
            SchemaVersion::new(t.clone(), vec![ColumnDef::new("id", SqlType::parse("int").unwrap()).primary_key()]),
            vec![json!({"id": 3}), json!({"id": 1}), json!({"id": 2})],
        );
        let keys = vec!["id".to_string()];
        let page = source.fetch_batch(&t, &keys, None, 2).await.unwrap();
        assert_eq!(page, vec![json!({"id": 1}), json!({"id": 2})]);
        let page = source
            .fetch_batch(&t, &keys, Some(&[json!(2)]), 2)
            .await
            .unwrap();
        assert_eq!(page, vec![json!({"id": 3})]);
    }
}
