//! MySQL binlog event decoder
//!
//! Decodes MySQL binary log events:
//! - FORMAT_DESCRIPTION_EVENT (checksum algorithm detection)
//! - TABLE_MAP_EVENT
//! - WRITE_ROWS_EVENT (v1 and v2)
//! - UPDATE_ROWS_EVENT (v1 and v2)
//! - DELETE_ROWS_EVENT (v1 and v2)
//! - ROTATE_EVENT
//! - GTID_LOG_EVENT / ANONYMOUS_GTID_LOG_EVENT
//! - XID_EVENT (transaction commit)
//! - QUERY_EVENT (BEGIN, COMMIT, DDL)
//! - HEARTBEAT_LOG_EVENT
//!
//! Every read goes through [`Reader`], which reports truncation as
//! [`DecodeError::Incomplete`] instead of panicking.

use crate::common::DecodeError;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use tracing::{debug, trace};

type Result<T> = std::result::Result<T, DecodeError>;

/// Default upper bound for a single event (MySQL `max_allowed_packet` ceiling).
pub const DEFAULT_MAX_EVENT_SIZE: usize = 1 << 30;

/// `LOG_EVENT_ARTIFICIAL_F`: event generated by the server, not read from the file.
pub const ARTIFICIAL_FLAG: u16 = 0x0020;

/// Binlog event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    StartEventV3 = 1,
    QueryEvent = 2,
    StopEvent = 3,
    RotateEvent = 4,
    IntvarEvent = 5,
    RandEvent = 13,
    UserVarEvent = 14,
    FormatDescriptionEvent = 15,
    XidEvent = 16,
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    IncidentEvent = 26,
    HeartbeatLogEvent = 27,
    IgnorableLogEvent = 28,
    RowsQueryLogEvent = 29,
    WriteRowsEventV2 = 30,
    UpdateRowsEventV2 = 31,
    DeleteRowsEventV2 = 32,
    GtidLogEvent = 33,
    AnonymousGtidLogEvent = 34,
    PreviousGtidsLogEvent = 35,
    TransactionPayloadEvent = 40,
}

impl EventType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => EventType::StartEventV3,
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            5 => EventType::IntvarEvent,
            13 => EventType::RandEvent,
            14 => EventType::UserVarEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            26 => EventType::IncidentEvent,
            27 => EventType::HeartbeatLogEvent,
            28 => EventType::IgnorableLogEvent,
            29 => EventType::RowsQueryLogEvent,
            30 => EventType::WriteRowsEventV2,
            31 => EventType::UpdateRowsEventV2,
            32 => EventType::DeleteRowsEventV2,
            33 => EventType::GtidLogEvent,
            34 => EventType::AnonymousGtidLogEvent,
            35 => EventType::PreviousGtidsLogEvent,
            40 => EventType::TransactionPayloadEvent,
            _ => EventType::Unknown,
        }
    }

    pub fn is_row_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV1
                | EventType::WriteRowsEventV2
                | EventType::UpdateRowsEventV1
                | EventType::UpdateRowsEventV2
                | EventType::DeleteRowsEventV1
                | EventType::DeleteRowsEventV2
        )
    }

    fn is_v2_rows(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV2 | EventType::UpdateRowsEventV2 | EventType::DeleteRowsEventV2
        )
    }
}

/// MySQL column types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            other => return Err(DecodeError::corrupt(format!("unknown column type {}", other))),
        })
    }
}

/// Bounds-checked little-endian reader over an event body.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(DecodeError::Incomplete {
                needed: self.pos + n,
                available: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(self.uint_le(2)? as u16)
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(self.uint_le(4)? as u32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.uint_le(8)
    }

    /// Little-endian unsigned integer of `n` (at most 8) bytes.
    pub fn uint_le(&mut self, n: usize) -> Result<u64> {
        let bytes = self.take(n)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Big-endian unsigned integer of `n` (at most 8) bytes.
    pub fn uint_be(&mut self, n: usize) -> Result<u64> {
        let bytes = self.take(n)?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    pub fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    /// Length-encoded integer.
    pub fn packed_int(&mut self) -> Result<u64> {
        let first = self.u8()?;
        match first {
            0..=250 => Ok(u64::from(first)),
            252 => self.uint_le(2),
            253 => self.uint_le(3),
            254 => self.uint_le(8),
            _ => Err(DecodeError::corrupt(format!("invalid packed int prefix {}", first))),
        }
    }

    fn lossy_string(&mut self, n: usize) -> Result<String> {
        Ok(String::from_utf8_lossy(self.take(n)?).into_owned())
    }
}

/// Binlog event header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_length: u32,
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        Ok(Self {
            timestamp: r.u32()?,
            event_type: EventType::from_u8(r.u8()?),
            server_id: r.u32()?,
            event_length: r.u32()?,
            next_position: r.u32()?,
            flags: r.u16()?,
        })
    }

    /// Generated by the server on connect (fake ROTATE, replayed FDE).
    pub fn is_artificial(&self) -> bool {
        self.flags & ARTIFICIAL_FLAG != 0 || self.next_position == 0
    }

    /// Offset of this event inside its binlog file.
    pub fn start_position(&self) -> u64 {
        u64::from(self.next_position).saturating_sub(u64::from(self.event_length))
    }
}

/// Splits a byte stream into whole binlog events.
///
/// The replication protocol may deliver an event across several chunks;
/// the framer accumulates them and releases one event at a time.
#[derive(Debug)]
pub struct EventFramer {
    buf: BytesMut,
    max_event_size: usize,
}

impl Default for EventFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENT_SIZE)
    }
}

impl EventFramer {
    pub fn new(max_event_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_event_size,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Next complete event, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < EventHeader::SIZE {
            return Ok(None);
        }
        let len = (&self.buf[9..13]).get_u32_le() as usize;
        if len < EventHeader::SIZE {
            return Err(DecodeError::corrupt(format!(
                "event length {} shorter than header",
                len
            )));
        }
        if len > self.max_event_size {
            return Err(DecodeError::corrupt(format!(
                "event length {} exceeds maximum {}",
                len, self.max_event_size
            )));
        }
        if self.buf.len() < len {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Decoded binlog event
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogEvent {
    /// Format description - contains binlog format info
    FormatDescription(FormatDescriptionEvent),

    /// Table map - maps table ID to schema
    TableMap(TableMapEvent),

    /// Row insert
    WriteRows(RowsEvent),

    /// Row update
    UpdateRows(RowsEvent),

    /// Row delete
    DeleteRows(RowsEvent),

    /// Transaction commit
    Xid(XidEvent),

    /// Query (BEGIN, COMMIT, DDL)
    Query(QueryEvent),

    /// Rotate to new binlog file
    Rotate(RotateEvent),

    /// GTID (or anonymous GTID) opening a transaction
    Gtid(GtidEvent),

    /// Heartbeat
    Heartbeat,

    /// Unknown or unhandled event
    Unknown(EventType),
}

/// Format description event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    pub checksum: ChecksumAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgorithm {
    #[default]
    None,
    Crc32,
}

/// Table map event - describes table structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub flags: u16,
    pub schema_name: String,
    pub table_name: String,
    pub column_count: usize,
    pub column_types: Vec<ColumnType>,
    pub column_metadata: Vec<u16>,
    pub null_bitmap: Vec<u8>,
}

/// Rows event (INSERT/UPDATE/DELETE)
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub table_id: u64,
    pub flags: u16,
    pub column_count: usize,
    pub rows: Vec<RowData>,
}

/// One row image, indexed by column ordinal. `None` marks a column left
/// out of the image (`binlog_row_image=MINIMAL`).
pub type RowImage = Vec<Option<ColumnValue>>;

/// Row data
#[derive(Debug, Clone, PartialEq)]
pub struct RowData {
    pub before: Option<RowImage>, // For UPDATE/DELETE
    pub after: Option<RowImage>,  // For INSERT/UPDATE
}

/// Column value as stored in the row image.
///
/// Integers are decoded signed; the schema decides whether to reinterpret
/// them as unsigned. Strings stay raw bytes until the schema says whether
/// the column is text or binary.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    SignedInt(i64),
    Float(f32),
    Double(f64),
    Decimal(String),
    Bytes(Vec<u8>),
    Date {
        year: u16,
        month: u8,
        day: u8,
    },
    Time {
        negative: bool,
        hours: u32,
        minutes: u8,
        seconds: u8,
        microseconds: u32,
    },
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        microsecond: u32,
    },
    /// UTC epoch seconds
    Timestamp { seconds: u32, microsecond: u32 },
    Year(u16),
    Json(serde_json::Value),
    Enum(u16),
    Set(u64),
    Bit(u64),
}

/// XID event (transaction commit)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XidEvent {
    pub xid: u64,
}

/// Query event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub schema: String,
    pub query: String,
}

/// Rotate event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEvent {
    pub position: u64,
    pub next_binlog: String,
}

/// GTID event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidEvent {
    pub flags: u8,
    pub uuid: [u8; 16],
    pub gno: u64,
}

impl GtidEvent {
    pub fn uuid_string(&self) -> String {
        let h = hex::encode(self.uuid);
        format!(
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        )
    }

    pub fn gtid_string(&self) -> String {
        format!("{}:{}", self.uuid_string(), self.gno)
    }
}

/// Binlog decoder with table cache
#[derive(Debug, Default)]
pub struct BinlogDecoder {
    /// Table map cache (table_id -> TableMapEvent)
    table_cache: HashMap<u64, TableMapEvent>,
    /// Format description for current binlog
    format: Option<FormatDescriptionEvent>,
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get table info from cache
    pub fn table(&self, table_id: u64) -> Option<&TableMapEvent> {
        self.table_cache.get(&table_id)
    }

    pub fn checksum(&self) -> ChecksumAlgorithm {
        self.format.as_ref().map(|f| f.checksum).unwrap_or_default()
    }

    /// Decode one complete event.
    ///
    /// Returns the event with its header; `header.next_position` is the
    /// offset of the following event in the current binlog file.
    pub fn decode(&mut self, data: &[u8]) -> Result<(BinlogEvent, EventHeader)> {
        let header = EventHeader::parse(data)?;
        let declared = header.event_length as usize;
        if data.len() < declared {
            return Err(DecodeError::Incomplete {
                needed: declared,
                available: data.len(),
            });
        }
        if data.len() > declared || declared < EventHeader::SIZE {
            return Err(DecodeError::corrupt(format!(
                "event length {} does not match {} bytes",
                declared,
                data.len()
            )));
        }

        // The FDE announces its own checksum algorithm; every later event
        // follows the last FDE seen.
        // The fake ROTATE sent ahead of the first FDE carries a trailer
        // only when the server checksums; a matching CRC is the only hint.
        let checksum = if header.event_type == EventType::FormatDescriptionEvent {
            fde_checksum(&data[EventHeader::SIZE..])?
        } else if self.format.is_none() && has_valid_crc(data) {
            ChecksumAlgorithm::Crc32
        } else {
            self.checksum()
        };

        let body_end = match checksum {
            ChecksumAlgorithm::Crc32 => {
                let end = data
                    .len()
                    .checked_sub(4)
                    .filter(|end| *end >= EventHeader::SIZE)
                    .ok_or_else(|| DecodeError::corrupt("event too short for checksum"))?;
                let stored = (&data[end..]).get_u32_le();
                let computed = crc32fast::hash(&data[..end]);
                if stored != computed {
                    return Err(DecodeError::Checksum { stored, computed });
                }
                end
            }
            ChecksumAlgorithm::None => data.len(),
        };
        let payload = &data[EventHeader::SIZE..body_end];

        trace!(
            event_type = ?header.event_type,
            len = data.len(),
            "decoding binlog event"
        );

        let event = match header.event_type {
            EventType::FormatDescriptionEvent => {
                let event = decode_format_description(payload, checksum)?;
                debug!(
                    server_version = %event.server_version,
                    checksum = ?event.checksum,
                    "format description"
                );
                self.format = Some(event.clone());
                BinlogEvent::FormatDescription(event)
            }
            EventType::TableMapEvent => {
                let event = decode_table_map(payload)?;
                self.table_cache.insert(event.table_id, event.clone());
                BinlogEvent::TableMap(event)
            }
            t @ (EventType::WriteRowsEventV1 | EventType::WriteRowsEventV2) => {
                BinlogEvent::WriteRows(self.decode_rows(payload, t, RowsKind::Write)?)
            }
            t @ (EventType::UpdateRowsEventV1 | EventType::UpdateRowsEventV2) => {
                BinlogEvent::UpdateRows(self.decode_rows(payload, t, RowsKind::Update)?)
            }
            t @ (EventType::DeleteRowsEventV1 | EventType::DeleteRowsEventV2) => {
                BinlogEvent::DeleteRows(self.decode_rows(payload, t, RowsKind::Delete)?)
            }
            EventType::XidEvent => BinlogEvent::Xid(XidEvent {
                xid: Reader::new(payload).u64()?,
            }),
            EventType::QueryEvent => BinlogEvent::Query(decode_query(payload)?),
            EventType::RotateEvent => BinlogEvent::Rotate(decode_rotate(payload)?),
            EventType::GtidLogEvent | EventType::AnonymousGtidLogEvent => {
                BinlogEvent::Gtid(decode_gtid(payload)?)
            }
            EventType::HeartbeatLogEvent => BinlogEvent::Heartbeat,
            other => {
                trace!(event_type = ?other, "unhandled event type");
                BinlogEvent::Unknown(other)
            }
        };
        Ok((event, header))
    }

    fn decode_rows(&self, data: &[u8], event_type: EventType, kind: RowsKind) -> Result<RowsEvent> {
        let mut r = Reader::new(data);
        let table_id = r.uint_le(6)?;
        let flags = r.u16()?;

        if event_type.is_v2_rows() {
            let extra_len = r.u16()? as usize;
            r.skip(extra_len.saturating_sub(2))?;
        }

        let column_count = r.packed_int()? as usize;
        let bitmap_len = column_count.div_ceil(8);
        let present = r.take(bitmap_len)?.to_vec();
        let present_after = match kind {
            RowsKind::Update => r.take(bitmap_len)?.to_vec(),
            _ => present.clone(),
        };

        let table = self
            .table_cache
            .get(&table_id)
            .ok_or(DecodeError::UnknownTable(table_id))?;
        if table.column_count != column_count {
            return Err(DecodeError::corrupt(format!(
                "rows event has {} columns, table map for {}.{} has {}",
                column_count, table.schema_name, table.table_name, table.column_count
            )));
        }

        let mut rows = Vec::new();
        while !r.is_empty() {
            let row = match kind {
                RowsKind::Write => RowData {
                    before: None,
                    after: Some(decode_image(&mut r, table, &present)?),
                },
                RowsKind::Delete => RowData {
                    before: Some(decode_image(&mut r, table, &present)?),
                    after: None,
                },
                RowsKind::Update => {
                    let before = decode_image(&mut r, table, &present)?;
                    let after = decode_image(&mut r, table, &present_after)?;
                    RowData {
                        before: Some(before),
                        after: Some(after),
                    }
                }
            };
            rows.push(row);
        }

        Ok(RowsEvent {
            table_id,
            flags,
            column_count,
            rows,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum RowsKind {
    Write,
    Update,
    Delete,
}

/// Locate the checksum algorithm byte of a FORMAT_DESCRIPTION payload.
///
/// ```text
/// [binlog_version: 2] [server_version: 50] [create_timestamp: 4]
/// [header_length: 1] [post_header_lengths: N] [checksum_alg: 1] [crc32: 4]
/// ```
///
/// Servers from 5.6.1 on always write `checksum_alg` and the four trailer
/// bytes; older servers write neither.
fn fde_checksum(payload: &[u8]) -> Result<ChecksumAlgorithm> {
    if payload.len() < 57 {
        return Err(DecodeError::Incomplete {
            needed: EventHeader::SIZE + 57,
            available: EventHeader::SIZE + payload.len(),
        });
    }
    let version = String::from_utf8_lossy(&payload[2..52]);
    let version = version.trim_end_matches('\0');
    if !version_has_checksum(version) || payload.len() < 62 {
        return Ok(ChecksumAlgorithm::None);
    }
    match payload[payload.len() - 5] {
        0 => Ok(ChecksumAlgorithm::None),
        1 => Ok(ChecksumAlgorithm::Crc32),
        other => Err(DecodeError::corrupt(format!(
            "unknown checksum algorithm {}",
            other
        ))),
    }
}

/// Checksums exist from MySQL 5.6.1 and MariaDB 5.3.
fn version_has_checksum(version: &str) -> bool {
    let mut parts = version.split(|c: char| !c.is_ascii_digit());
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    if version.contains("MariaDB") {
        return (major, minor) >= (5, 3);
    }
    (major, minor, patch) >= (5, 6, 1)
}

fn decode_format_description(
    data: &[u8],
    checksum: ChecksumAlgorithm,
) -> Result<FormatDescriptionEvent> {
    let mut r = Reader::new(data);
    let binlog_version = r.u16()?;
    let server_version = String::from_utf8_lossy(r.take(50)?)
        .trim_end_matches('\0')
        .to_string();
    let create_timestamp = r.u32()?;
    let header_length = r.u8()?;
    if usize::from(header_length) != EventHeader::SIZE {
        return Err(DecodeError::corrupt(format!(
            "unsupported event header length {}",
            header_length
        )));
    }
    Ok(FormatDescriptionEvent {
        binlog_version,
        server_version,
        create_timestamp,
        header_length,
        checksum,
    })
}

fn decode_table_map(data: &[u8]) -> Result<TableMapEvent> {
    let mut r = Reader::new(data);
    let table_id = r.uint_le(6)?;
    let flags = r.u16()?;

    let schema_len = r.u8()? as usize;
    let schema_name = r.lossy_string(schema_len)?;
    r.skip(1)?; // null terminator
    let table_len = r.u8()? as usize;
    let table_name = r.lossy_string(table_len)?;
    r.skip(1)?;

    let column_count = r.packed_int()? as usize;
    let column_types = r
        .take(column_count)?
        .iter()
        .map(|t| ColumnType::from_u8(*t))
        .collect::<Result<Vec<_>>>()?;

    let metadata_len = r.packed_int()? as usize;
    let mut meta = Reader::new(r.take(metadata_len)?);
    let column_metadata = column_types
        .iter()
        .map(|t| column_metadata(*t, &mut meta))
        .collect::<Result<Vec<_>>>()?;

    // Optional metadata (signedness, names) follows; the tracker's schema
    // supplies those instead.
    let null_bitmap = r.take(column_count.div_ceil(8))?.to_vec();

    Ok(TableMapEvent {
        table_id,
        flags,
        schema_name,
        table_name,
        column_count,
        column_types,
        column_metadata,
        null_bitmap,
    })
}

fn column_metadata(column_type: ColumnType, r: &mut Reader<'_>) -> Result<u16> {
    Ok(match column_type {
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
        | ColumnType::Timestamp2 => u16::from(r.u8()?),
        ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit => r.u16()?,
        // (real_type, length), stored high byte first
        ColumnType::NewDecimal | ColumnType::String | ColumnType::Enum | ColumnType::Set => {
            r.uint_be(2)? as u16
        }
        _ => 0,
    })
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .is_some_and(|byte| byte & (1 << (idx % 8)) != 0)
}

fn decode_image(r: &mut Reader<'_>, table: &TableMapEvent, present: &[u8]) -> Result<RowImage> {
    let present_count = (0..table.column_count)
        .filter(|i| is_bit_set(present, *i))
        .count();
    let nulls = r.take(present_count.div_ceil(8))?;

    let mut image = Vec::with_capacity(table.column_count);
    let mut null_idx = 0;
    for col in 0..table.column_count {
        if !is_bit_set(present, col) {
            image.push(None);
            continue;
        }
        let value = if is_bit_set(nulls, null_idx) {
            ColumnValue::Null
        } else {
            decode_value(r, table.column_types[col], table.column_metadata[col])?
        };
        null_idx += 1;
        image.push(Some(value));
    }
    Ok(image)
}

fn decode_value(r: &mut Reader<'_>, column_type: ColumnType, metadata: u16) -> Result<ColumnValue> {
    let value = match column_type {
        ColumnType::Tiny => ColumnValue::SignedInt(i64::from(r.u8()? as i8)),
        ColumnType::Short => ColumnValue::SignedInt(i64::from(r.u16()? as i16)),
        ColumnType::Int24 => {
            let raw = r.uint_le(3)? as u32;
            // Sign extend
            ColumnValue::SignedInt(i64::from(((raw << 8) as i32) >> 8))
        }
        ColumnType::Long => ColumnValue::SignedInt(i64::from(r.u32()? as i32)),
        ColumnType::LongLong => ColumnValue::SignedInt(r.u64()? as i64),
        ColumnType::Float => ColumnValue::Float(r.f32()?),
        ColumnType::Double => ColumnValue::Double(r.f64()?),
        ColumnType::NewDecimal => {
            let precision = (metadata >> 8) as usize;
            let scale = (metadata & 0xFF) as usize;
            ColumnValue::Decimal(decode_decimal(r, precision, scale)?)
        }
        ColumnType::Year => match r.u8()? {
            0 => ColumnValue::Year(0),
            y => ColumnValue::Year(1900 + u16::from(y)),
        },
        ColumnType::Date | ColumnType::NewDate => {
            let packed = r.uint_le(3)? as u32;
            ColumnValue::Date {
                year: (packed >> 9) as u16,
                month: ((packed >> 5) & 0x0F) as u8,
                day: (packed & 0x1F) as u8,
            }
        }
        ColumnType::Time => {
            let packed = r.uint_le(3)? as u32;
            ColumnValue::Time {
                negative: false,
                hours: packed / 10000,
                minutes: ((packed / 100) % 100) as u8,
                seconds: (packed % 100) as u8,
                microseconds: 0,
            }
        }
        ColumnType::Time2 => decode_time2(r, metadata as u8)?,
        ColumnType::DateTime => {
            let packed = r.u64()?;
            ColumnValue::DateTime {
                year: (packed / 10_000_000_000) as u16,
                month: ((packed / 100_000_000) % 100) as u8,
                day: ((packed / 1_000_000) % 100) as u8,
                hour: ((packed / 10_000) % 100) as u8,
                minute: ((packed / 100) % 100) as u8,
                second: (packed % 100) as u8,
                microsecond: 0,
            }
        }
        ColumnType::DateTime2 => {
            let int_part = r.uint_be(5)?.wrapping_sub(0x80_0000_0000);
            let microsecond = read_fraction(r, metadata as u8)?;
            let ymd = int_part >> 17;
            let ym = ymd >> 5;
            let hms = int_part & 0x1_FFFF;
            ColumnValue::DateTime {
                year: (ym / 13) as u16,
                month: (ym % 13) as u8,
                day: (ymd & 0x1F) as u8,
                hour: (hms >> 12) as u8,
                minute: ((hms >> 6) & 0x3F) as u8,
                second: (hms & 0x3F) as u8,
                microsecond,
            }
        }
        ColumnType::Timestamp => ColumnValue::Timestamp {
            seconds: r.u32()?,
            microsecond: 0,
        },
        ColumnType::Timestamp2 => {
            let seconds = r.uint_be(4)? as u32;
            let microsecond = read_fraction(r, metadata as u8)?;
            ColumnValue::Timestamp {
                seconds,
                microsecond,
            }
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if metadata < 256 {
                r.u8()? as usize
            } else {
                r.u16()? as usize
            };
            ColumnValue::Bytes(r.take(len)?.to_vec())
        }
        ColumnType::String | ColumnType::Enum | ColumnType::Set => {
            decode_string(r, column_type, metadata)?
        }
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Geometry => {
            let len = r.uint_le(usize::from(metadata).clamp(1, 4))? as usize;
            ColumnValue::Bytes(r.take(len)?.to_vec())
        }
        ColumnType::Json => {
            let len = r.uint_le(usize::from(metadata).clamp(1, 4))? as usize;
            ColumnValue::Json(decode_json(r.take(len)?))
        }
        ColumnType::Bit => {
            let bits = usize::from(metadata >> 8) * 8 + usize::from(metadata & 0xFF);
            ColumnValue::Bit(r.uint_be(bits.div_ceil(8).min(8))?)
        }
        ColumnType::Null => ColumnValue::Null,
        ColumnType::Decimal => {
            return Err(DecodeError::corrupt("pre-5.0 DECIMAL columns are not supported"))
        }
    };
    Ok(value)
}

/// STRING carries its real type in the metadata; ENUM and SET arrive this way.
fn decode_string(r: &mut Reader<'_>, column_type: ColumnType, metadata: u16) -> Result<ColumnValue> {
    let mut real_type = (metadata >> 8) as u8;
    let mut max_len = metadata & 0xFF;
    if column_type == ColumnType::String && real_type & 0x30 != 0x30 {
        // Lengths above 255 borrow two bits from the type byte.
        max_len |= u16::from((real_type & 0x30) ^ 0x30) << 4;
        real_type |= 0x30;
    }
    let real_type = if column_type == ColumnType::String {
        ColumnType::from_u8(real_type)?
    } else {
        column_type
    };

    match real_type {
        ColumnType::Enum => Ok(ColumnValue::Enum(r.uint_le(usize::from(max_len))? as u16)),
        ColumnType::Set => Ok(ColumnValue::Set(r.uint_le(usize::from(max_len).min(8))?)),
        _ => {
            let len = if max_len < 256 {
                r.u8()? as usize
            } else {
                r.u16()? as usize
            };
            Ok(ColumnValue::Bytes(r.take(len)?.to_vec()))
        }
    }
}

/// Fractional seconds for DATETIME2/TIMESTAMP2, in microseconds.
fn read_fraction(r: &mut Reader<'_>, fsp: u8) -> Result<u32> {
    let bytes = usize::from(fsp.min(6)).div_ceil(2);
    if bytes == 0 {
        return Ok(0);
    }
    let raw = r.uint_be(bytes)? as u32;
    // 1 byte holds 1/100 s, 2 bytes 1/10000 s, 3 bytes microseconds.
    Ok(raw * 10u32.pow(6 - 2 * bytes as u32))
}

fn decode_time2(r: &mut Reader<'_>, fsp: u8) -> Result<ColumnValue> {
    const INT_OFFSET: i64 = 0x80_0000;
    let packed: i64 = match fsp.min(6) {
        0 => (r.uint_be(3)? as i64 - INT_OFFSET) << 24,
        1 | 2 => {
            let mut int_part = r.uint_be(3)? as i64 - INT_OFFSET;
            let mut frac = i64::from(r.u8()?);
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = r.uint_be(3)? as i64 - INT_OFFSET;
            let mut frac = r.uint_be(2)? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        _ => r.uint_be(6)? as i64 - 0x8000_0000_0000,
    };

    let negative = packed < 0;
    let magnitude = packed.unsigned_abs();
    let hms = magnitude >> 24;
    Ok(ColumnValue::Time {
        negative,
        hours: ((hms >> 12) & 0x3FF) as u32,
        minutes: ((hms >> 6) & 0x3F) as u8,
        seconds: (hms & 0x3F) as u8,
        microseconds: (magnitude % (1 << 24)) as u32,
    })
}

const DIG2BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// Binary DECIMAL to its canonical string, e.g. `-1234.5600` for DECIMAL(8,4).
///
/// Digits are grouped nine to a big-endian 4-byte word; leftover digits use
/// the smallest byte count that fits. The sign bit is inverted and negative
/// values are stored one's-complemented so the encoding sorts bytewise.
pub fn decode_decimal(r: &mut Reader<'_>, precision: usize, scale: usize) -> Result<String> {
    if precision == 0 || scale > precision {
        return Err(DecodeError::corrupt(format!(
            "invalid DECIMAL({},{})",
            precision, scale
        )));
    }
    let int_digits = precision - scale;
    let (int_words, int_left) = (int_digits / 9, int_digits % 9);
    let (frac_words, frac_left) = (scale / 9, scale % 9);
    let size = DIG2BYTES[int_left] + (int_words + frac_words) * 4 + DIG2BYTES[frac_left];

    let mut buf = r.take(size)?.to_vec();
    let negative = buf[0] & 0x80 == 0;
    buf[0] ^= 0x80;
    if negative {
        buf.iter_mut().for_each(|b| *b = !*b);
    }

    let mut digits = Reader::new(&buf);
    let mut int_part = String::with_capacity(int_digits);
    if int_left > 0 {
        let v = digits.uint_be(DIG2BYTES[int_left])?;
        int_part.push_str(&format!("{:0width$}", v, width = int_left));
    }
    for _ in 0..int_words {
        int_part.push_str(&format!("{:09}", digits.uint_be(4)?));
    }
    let int_part = match int_part.trim_start_matches('0') {
        "" => "0",
        trimmed => trimmed,
    };

    let mut out = String::with_capacity(precision + 2);
    if negative {
        out.push('-');
    }
    out.push_str(int_part);
    if scale > 0 {
        out.push('.');
        for _ in 0..frac_words {
            out.push_str(&format!("{:09}", digits.uint_be(4)?));
        }
        if frac_left > 0 {
            let v = digits.uint_be(DIG2BYTES[frac_left])?;
            out.push_str(&format!("{:0width$}", v, width = frac_left));
        }
    }
    Ok(out)
}

fn decode_query(data: &[u8]) -> Result<QueryEvent> {
    let mut r = Reader::new(data);
    let thread_id = r.u32()?;
    let exec_time = r.u32()?;
    let schema_len = r.u8()? as usize;
    let error_code = r.u16()?;
    let status_vars_len = r.u16()? as usize;
    r.skip(status_vars_len)?;
    let schema = r.lossy_string(schema_len)?;
    r.skip(1)?;
    let query = String::from_utf8_lossy(r.rest()).into_owned();
    Ok(QueryEvent {
        thread_id,
        exec_time,
        error_code,
        schema,
        query,
    })
}

fn has_valid_crc(data: &[u8]) -> bool {
    match data.len().checked_sub(4) {
        Some(end) if end > EventHeader::SIZE => {
            (&data[end..]).get_u32_le() == crc32fast::hash(&data[..end])
        }
        _ => false,
    }
}

fn decode_rotate(data: &[u8]) -> Result<RotateEvent> {
    let mut r = Reader::new(data);
    let position = r.u64()?;
    let next_binlog = String::from_utf8_lossy(r.rest())
        .trim_end_matches('\0')
        .to_string();
    if next_binlog.is_empty() {
        return Err(DecodeError::corrupt("rotate event without file name"));
    }
    Ok(RotateEvent {
        position,
        next_binlog,
    })
}

fn decode_gtid(data: &[u8]) -> Result<GtidEvent> {
    let mut r = Reader::new(data);
    let flags = r.u8()?;
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(r.take(16)?);
    let gno = r.u64()?;
    Ok(GtidEvent { flags, uuid, gno })
}

// ── MySQL binary JSON ───────────────────────────────────────────────────────
//
// JSON columns are logged in MySQL's binary document format:
//   0x00/0x01 small/large object   0x02/0x03 small/large array
//   0x04 literal   0x05..0x0a int16..uint64   0x0b double
//   0x0c utf8 string   0x0f opaque
// Anything that does not parse as binary is tried as JSON text and, failing
// that, kept as a string.

fn decode_json(data: &[u8]) -> serde_json::Value {
    if data.is_empty() {
        return serde_json::Value::Null;
    }
    json_typed(data[0], &data[1..])
        .or_else(|_| serde_json::from_slice(data).map_err(|e| DecodeError::corrupt(e.to_string())))
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(data).into_owned()))
}

fn json_typed(type_byte: u8, data: &[u8]) -> Result<serde_json::Value> {
    use serde_json::{json, Value};
    let mut r = Reader::new(data);
    Ok(match type_byte {
        0x00 => json_container(data, false, true)?,
        0x01 => json_container(data, true, true)?,
        0x02 => json_container(data, false, false)?,
        0x03 => json_container(data, true, false)?,
        0x04 => json_literal(r.u8()?.into()),
        0x05 => json!(r.u16()? as i16),
        0x06 => json!(r.u16()?),
        0x07 => json!(r.u32()? as i32),
        0x08 => json!(r.u32()?),
        0x09 => json!(r.u64()? as i64),
        0x0a => json!(r.u64()?),
        0x0b => json!(r.f64()?),
        0x0c => {
            let len = json_var_len(&mut r)?;
            Value::String(String::from_utf8_lossy(r.take(len)?).into_owned())
        }
        0x0f => {
            r.skip(1)?; // field type of the opaque value
            let len = json_var_len(&mut r)?;
            let raw = r.take(len)?;
            match std::str::from_utf8(raw) {
                Ok(s) => Value::String(s.to_string()),
                Err(_) => {
                    use base64::Engine;
                    Value::String(base64::engine::general_purpose::STANDARD.encode(raw))
                }
            }
        }
        other => {
            return Err(DecodeError::corrupt(format!(
                "unknown JSON value type {:#04x}",
                other
            )))
        }
    })
}

fn json_literal(code: u64) -> serde_json::Value {
    match code {
        0x01 => serde_json::Value::Bool(true),
        0x02 => serde_json::Value::Bool(false),
        _ => serde_json::Value::Null,
    }
}

fn json_container(data: &[u8], large: bool, object: bool) -> Result<serde_json::Value> {
    let width = if large { 4 } else { 2 };
    let mut r = Reader::new(data);
    let count = r.uint_le(width)? as usize;
    let _size = r.uint_le(width)?;

    let keys_start = 2 * width;
    let key_entry = width + 2;
    let values_start = if object {
        keys_start + count * key_entry
    } else {
        keys_start
    };
    let value_entry = width + 1;

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let at = values_start + i * value_entry;
        let mut entry = Reader::new(data.get(at..).unwrap_or_default());
        let type_byte = entry.u8()?;
        let inline = matches!(type_byte, 0x04 | 0x05 | 0x06) || (large && matches!(type_byte, 0x07 | 0x08));
        let value = if inline {
            let raw = entry.uint_le(width)?;
            match type_byte {
                0x04 => json_literal(raw),
                0x05 => serde_json::json!(raw as u16 as i16),
                0x06 => serde_json::json!(raw as u16),
                0x07 => serde_json::json!(raw as u32 as i32),
                _ => serde_json::json!(raw as u32),
            }
        } else {
            let offset = entry.uint_le(width)? as usize;
            let tail = data
                .get(offset..)
                .ok_or_else(|| DecodeError::corrupt("JSON value offset out of bounds"))?;
            json_typed(type_byte, tail)?
        };
        values.push(value);
    }

    if !object {
        return Ok(serde_json::Value::Array(values));
    }
    let mut map = serde_json::Map::with_capacity(count);
    for (i, value) in values.into_iter().enumerate() {
        let mut entry = Reader::new(data.get(keys_start + i * key_entry..).unwrap_or_default());
        let offset = entry.uint_le(width)? as usize;
        let len = entry.u16()? as usize;
        let key = data
            .get(offset..offset + len)
            .ok_or_else(|| DecodeError::corrupt("JSON key out of bounds"))?;
        map.insert(String::from_utf8_lossy(key).into_owned(), value);
    }
    Ok(serde_json::Value::Object(map))
}

/// Variable-length size: 7 bits per byte, high bit continues.
fn json_var_len(r: &mut Reader<'_>) -> Result<usize> {
    let mut len = 0usize;
    for i in 0..5 {
        let b = r.u8()?;
        len |= usize::from(b & 0x7F) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(len);
        }
    }
    Err(DecodeError::corrupt("JSON length prefix too long"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BinlogBuilder, BinlogColumn, BinlogValue};
    use pretty_assertions::assert_eq;

    fn decode_all(bytes: &[u8]) -> Vec<BinlogEvent> {
        let mut framer = EventFramer::default();
        let mut decoder = BinlogDecoder::new();
        framer.push(bytes);
        let mut events = Vec::new();
        while let Some(frame) = framer.next_frame().unwrap() {
            events.push(decoder.decode(&frame).unwrap().0);
        }
        events
    }

    #[test]
    fn test_reader_reports_incomplete() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert_eq!(r.u16().unwrap(), 0x0201);
        assert_eq!(
            r.u32().unwrap_err(),
            DecodeError::Incomplete {
                needed: 6,
                available: 3
            }
        );
    }

    #[test]
    fn test_packed_int() {
        assert_eq!(Reader::new(&[250]).packed_int().unwrap(), 250);
        assert_eq!(Reader::new(&[252, 0x34, 0x12]).packed_int().unwrap(), 0x1234);
        assert_eq!(Reader::new(&[253, 1, 2, 3]).packed_int().unwrap(), 0x030201);
        assert!(Reader::new(&[255]).packed_int().is_err());
    }

    #[test]
    fn test_framer_waits_for_whole_event() {
        let mut b = BinlogBuilder::new("mysql-bin.000001");
        b.format_description();
        let bytes = b.bytes().to_vec();

        let mut framer = EventFramer::default();
        framer.push(&bytes[..10]);
        assert_eq!(framer.next_frame().unwrap(), None);
        framer.push(&bytes[10..bytes.len() - 1]);
        assert_eq!(framer.next_frame().unwrap(), None);
        framer.push(&bytes[bytes.len() - 1..]);
        let frame = framer.next_frame().unwrap().unwrap();
        assert_eq!(frame.len(), bytes.len());
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_framer_rejects_bad_lengths() {
        let mut header = vec![0u8; 19];
        header[9..13].copy_from_slice(&5u32.to_le_bytes());
        let mut framer = EventFramer::default();
        framer.push(&header);
        assert!(matches!(framer.next_frame(), Err(DecodeError::Corrupt(_))));

        header[9..13].copy_from_slice(&4096u32.to_le_bytes());
        let mut framer = EventFramer::new(1024);
        framer.push(&header);
        assert!(matches!(framer.next_frame(), Err(DecodeError::Corrupt(_))));
    }

    #[test]
    fn test_decode_truncated_event_is_incomplete() {
        let mut b = BinlogBuilder::new("mysql-bin.000001");
        b.format_description();
        let bytes = b.bytes();
        let err = BinlogDecoder::new()
            .decode(&bytes[..bytes.len() - 3])
            .unwrap_err();
        assert!(err.is_incomplete());
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut b = BinlogBuilder::new("mysql-bin.000001");
        b.format_description();
        let fde_len = b.bytes().len();
        b.xid(7);
        let mut bytes = b.bytes().to_vec();

        let mut decoder = BinlogDecoder::new();
        decoder.decode(&bytes[..fde_len]).unwrap();
        assert_eq!(decoder.checksum(), ChecksumAlgorithm::Crc32);

        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;
        let err = decoder.decode(&bytes[fde_len..]).unwrap_err();
        assert!(matches!(err, DecodeError::Checksum { .. }));
    }

    #[test]
    fn test_decode_without_checksum() {
        let mut b = BinlogBuilder::new("mysql-bin.000001").without_checksum();
        b.format_description();
        b.query("shop", "BEGIN");
        b.xid(42);
        let events = decode_all(b.bytes());
        assert!(matches!(
            &events[0],
            BinlogEvent::FormatDescription(f) if f.checksum == ChecksumAlgorithm::None
        ));
        assert!(matches!(&events[1], BinlogEvent::Query(q) if q.query == "BEGIN" && q.schema == "shop"));
        assert_eq!(events[2], BinlogEvent::Xid(XidEvent { xid: 42 }));
    }

    #[test]
    fn test_rows_decode_against_table_map() {
        let columns = vec![
            BinlogColumn::long(),
            BinlogColumn::varchar(64),
            BinlogColumn::tiny(),
        ];
        let mut b = BinlogBuilder::new("mysql-bin.000001");
        b.format_description();
        b.table_map(42, "shop", "orders", &columns);
        b.write_rows(
            42,
            &columns,
            &[
                vec![BinlogValue::Int(1), BinlogValue::text("a"), BinlogValue::Int(-1)],
                vec![BinlogValue::Int(2), BinlogValue::Null, BinlogValue::Int(7)],
            ],
        );
        b.update_rows(
            42,
            &columns,
            &[(
                vec![BinlogValue::Int(1), BinlogValue::text("a"), BinlogValue::Int(-1)],
                vec![BinlogValue::Int(1), BinlogValue::text("b"), BinlogValue::Int(-1)],
            )],
        );

        let events = decode_all(b.bytes());
        let BinlogEvent::TableMap(map) = &events[1] else {
            panic!("expected table map, got {:?}", events[1]);
        };
        assert_eq!(map.schema_name, "shop");
        assert_eq!(map.table_name, "orders");
        assert_eq!(map.column_metadata, vec![0, 64, 0]);

        let BinlogEvent::WriteRows(rows) = &events[2] else {
            panic!("expected write rows");
        };
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(
            rows.rows[1].after,
            Some(vec![
                Some(ColumnValue::SignedInt(2)),
                Some(ColumnValue::Null),
                Some(ColumnValue::SignedInt(7)),
            ])
        );

        let BinlogEvent::UpdateRows(rows) = &events[3] else {
            panic!("expected update rows");
        };
        let after = rows.rows[0].after.as_ref().unwrap();
        assert_eq!(after[1], Some(ColumnValue::Bytes(b"b".to_vec())));
    }

    #[test]
    fn test_rows_without_table_map() {
        let columns = vec![BinlogColumn::long()];
        let mut b = BinlogBuilder::new("mysql-bin.000001");
        b.format_description();
        let fde_len = b.bytes().len();
        b.write_rows(9, &columns, &[vec![BinlogValue::Int(1)]]);

        let mut decoder = BinlogDecoder::new();
        decoder.decode(&b.bytes()[..fde_len]).unwrap();
        assert_eq!(
            decoder.decode(&b.bytes()[fde_len..]).unwrap_err(),
            DecodeError::UnknownTable(9)
        );
    }

    #[test]
    fn test_temporal_values() {
        let columns = vec![
            BinlogColumn::date(),
            BinlogColumn::datetime2(3),
            BinlogColumn::timestamp2(0),
            BinlogColumn::year(),
        ];
        let mut b = BinlogBuilder::new("mysql-bin.000001");
        b.format_description();
        b.table_map(1, "db", "t", &columns);
        b.write_rows(
            1,
            &columns,
            &[vec![
                BinlogValue::Date(2024, 2, 29),
                BinlogValue::DateTime(2024, 2, 29, 13, 5, 59, 123_000),
                BinlogValue::Timestamp(1_700_000_000, 0),
                BinlogValue::Int(124),
            ]],
        );
        let events = decode_all(b.bytes());
        let BinlogEvent::WriteRows(rows) = &events[2] else {
            panic!("expected rows");
        };
        assert_eq!(
            rows.rows[0].after.clone().unwrap(),
            vec![
                Some(ColumnValue::Date {
                    year: 2024,
                    month: 2,
                    day: 29
                }),
                Some(ColumnValue::DateTime {
                    year: 2024,
                    month: 2,
                    day: 29,
                    hour: 13,
                    minute: 5,
                    second: 59,
                    microsecond: 123_000
                }),
                Some(ColumnValue::Timestamp {
                    seconds: 1_700_000_000,
                    microsecond: 0
                }),
                Some(ColumnValue::Year(2024)),
            ]
        );
    }

    #[test]
    fn test_time2_negative_with_fraction() {
        // -00:00:01.5 at fsp 1: int part 0x7FFFFE, fraction byte 0xCE
        let mut r = Reader::new(&[0x7F, 0xFF, 0xFE, 0xCE]);
        assert_eq!(
            decode_time2(&mut r, 1).unwrap(),
            ColumnValue::Time {
                negative: true,
                hours: 0,
                minutes: 0,
                seconds: 1,
                microseconds: 500_000
            }
        );
    }

    #[test]
    fn test_decimal_decoding() {
        // DECIMAL(14,4)
        let mut r = Reader::new(&[0x81, 0x0D, 0xFB, 0x38, 0xD2, 0x04, 0xD2]);
        assert_eq!(decode_decimal(&mut r, 14, 4).unwrap(), "1234567890.1234");

        let mut r = Reader::new(&[0x7E, 0xF2, 0x04, 0xC7, 0x2D, 0xFB, 0x2D]);
        assert_eq!(decode_decimal(&mut r, 14, 4).unwrap(), "-1234567890.1234");

        // DECIMAL(5,2) 0.05
        let mut r = Reader::new(&[0x80, 0x00, 0x05]);
        assert_eq!(decode_decimal(&mut r, 5, 2).unwrap(), "0.05");
    }

    #[test]
    fn test_string_metadata_real_type() {
        // ENUM with a 1-byte index
        let mut r = Reader::new(&[3]);
        assert_eq!(
            decode_string(&mut r, ColumnType::String, 0xF701).unwrap(),
            ColumnValue::Enum(3)
        );
        // CHAR(10)
        let mut r = Reader::new(&[2, b'h', b'i']);
        assert_eq!(
            decode_string(&mut r, ColumnType::String, 0xFE0A).unwrap(),
            ColumnValue::Bytes(b"hi".to_vec())
        );
    }

    #[test]
    fn test_json_binary_and_text() {
        // small object {"a": 1}
        let binary = [
            0x00, 0x01, 0x00, 0x0C, 0x00, 0x0B, 0x00, 0x01, 0x00, 0x05, 0x01, 0x00, b'a',
        ];
        assert_eq!(decode_json(&binary), serde_json::json!({"a": 1}));
        assert_eq!(decode_json(br#"[1,"x"]"#), serde_json::json!([1, "x"]));
    }

    #[test]
    fn test_rotate_and_gtid() {
        let mut b = BinlogBuilder::new("mysql-bin.000001");
        b.format_description();
        b.gtid(5);
        b.rotate("mysql-bin.000002", 4);
        let events = decode_all(b.bytes());
        assert!(matches!(&events[1], BinlogEvent::Gtid(g) if g.gno == 5));
        assert_eq!(
            events[2],
            BinlogEvent::Rotate(RotateEvent {
                position: 4,
                next_binlog: "mysql-bin.000002".into()
            })
        );
    }

    #[test]
    fn test_version_has_checksum() {
        assert!(version_has_checksum("8.0.36-log"));
        assert!(version_has_checksum("5.6.1"));
        assert!(!version_has_checksum("5.5.62"));
        assert!(version_has_checksum("10.6.12-MariaDB"));
    }
}
