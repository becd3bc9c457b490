//! MySQL Snapshot Source
//!
//! Implementation of [`SnapshotSource`] for MySQL.
//!
//! # Read view
//!
//! ```text
//! FLUSH TABLES WITH READ LOCK            (skipped with a warning if denied)
//! START TRANSACTION WITH CONSISTENT SNAPSHOT
//! SHOW BINARY LOG STATUS                 → watermark
//! describe captured tables               → cached layouts
//! UNLOCK TABLES
//! ... keyset-paged SELECTs inside the transaction ...
//! COMMIT
//! ```
//!
//! Values are normalized through the same conversion as binlog rows, so a
//! snapshot row and a streamed row for the same data are identical.

use super::convert::{value_to_json, ServerTimeZone};
use super::decoder::ColumnValue;
use crate::common::{
    CdcError, ColumnDef, LogPosition, Result, SchemaVersion, SnapshotSource, SqlType, TableId,
};
use async_trait::async_trait;
use base64::Engine;
use chrono::NaiveDate;
use mysql_async::prelude::*;
use mysql_async::{Conn, Params, Pool, Row, Value as MyValue};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

fn mysql_error(context: &str, e: mysql_async::Error) -> CdcError {
    match e {
        mysql_async::Error::Io(e) => CdcError::connection_lost(format!("{}: {}", context, e)),
        mysql_async::Error::Server(e) => {
            CdcError::mysql(format!("{}: {} - {}", context, e.code, e.message))
        }
        other => CdcError::mysql(format!("{}: {}", context, other)),
    }
}

fn quote(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Current end of the binlog. MySQL 8.2 renamed `SHOW MASTER STATUS`.
pub async fn binlog_position(conn: &mut Conn) -> Result<LogPosition> {
    let row: Option<Row> = match conn.query_first("SHOW BINARY LOG STATUS").await {
        Ok(row) => row,
        Err(e) => {
            debug!(error = %e, "SHOW BINARY LOG STATUS unavailable, using SHOW MASTER STATUS");
            conn.query_first("SHOW MASTER STATUS")
                .await
                .map_err(|e| mysql_error("SHOW MASTER STATUS", e))?
        }
    };
    let row = row.ok_or_else(|| {
        CdcError::config("binary logging is disabled on the source server (log_bin=OFF)")
    })?;
    let file: Option<String> = row.get(0);
    let offset: Option<u64> = row.get(1);
    match (file, offset) {
        (Some(file), Some(offset)) if !file.is_empty() => Ok(LogPosition::new(file, offset)),
        _ => Err(CdcError::mysql("unexpected binary log status row")),
    }
}

/// [`SnapshotSource`] over a `mysql_async` pool.
pub struct MySqlSnapshotSource {
    pool: Pool,
    tables: Vec<TableId>,
    server_time_zone: ServerTimeZone,
    /// Connection holding the consistent-snapshot transaction
    view: Mutex<Option<Conn>>,
    schemas: Mutex<HashMap<TableId, SchemaVersion>>,
}

impl std::fmt::Debug for MySqlSnapshotSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlSnapshotSource")
            .field("tables", &self.tables)
            .field("server_time_zone", &self.server_time_zone)
            .finish_non_exhaustive()
    }
}

impl MySqlSnapshotSource {
    /// Source for `tables`; their layouts are captured while the read
    /// view is opened.
    pub fn new(pool: Pool, tables: Vec<TableId>, server_time_zone: ServerTimeZone) -> Self {
        Self {
            pool,
            tables,
            server_time_zone,
            view: Mutex::new(None),
            schemas: Mutex::new(HashMap::new()),
        }
    }

    /// Create from a connection URL.
    pub fn connect(url: &str, tables: Vec<TableId>, server_time_zone: ServerTimeZone) -> Result<Self> {
        let pool = Pool::from_url(url).map_err(|e| CdcError::config(format!("invalid MySQL URL: {}", e)))?;
        Ok(Self::new(pool, tables, server_time_zone))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<Conn> {
        self.pool
            .get_conn()
            .await
            .map_err(|e| mysql_error("get connection", e))
    }

    async fn query_schema(conn: &mut Conn, table: &TableId) -> Result<SchemaVersion> {
        let rows: Vec<(String, String, String, Option<String>, String)> = conn
            .exec(
                r"SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_DEFAULT, COLUMN_KEY
                  FROM information_schema.COLUMNS
                  WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
                  ORDER BY ORDINAL_POSITION",
                (&table.database, &table.table),
            )
            .await
            .map_err(|e| mysql_error("describe table", e))?;
        if rows.is_empty() {
            return Err(CdcError::schema(format!("table {} does not exist", table)));
        }

        let columns = rows
            .into_iter()
            .map(|(name, column_type, nullable, default, key)| {
                let mut column = ColumnDef::new(name, SqlType::parse(&column_type)?);
                if nullable.eq_ignore_ascii_case("NO") {
                    column = column.not_null();
                }
                if key == "PRI" {
                    column = column.primary_key();
                }
                if let Some(default) = default {
                    column = column.with_default(default);
                }
                Ok(column)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SchemaVersion::new(table.clone(), columns))
    }

    async fn schema(&self, table: &TableId) -> Result<SchemaVersion> {
        if let Some(schema) = self.schemas.lock().await.get(table) {
            return Ok(schema.clone());
        }
        let mut view = self.view.lock().await;
        let schema = match view.as_mut() {
            Some(conn) => Self::query_schema(conn, table).await?,
            None => Self::query_schema(&mut self.conn().await?, table).await?,
        };
        self.schemas
            .lock()
            .await
            .insert(table.clone(), schema.clone());
        Ok(schema)
    }
}

/// Map a binary-protocol value onto the binlog value model.
fn column_value(value: MyValue, column: &ColumnDef) -> ColumnValue {
    match value {
        MyValue::NULL => ColumnValue::Null,
        MyValue::Int(v) => match column.sql_type {
            SqlType::Year => ColumnValue::Year(v as u16),
            SqlType::Bit { .. } => ColumnValue::Bit(v as u64),
            _ => ColumnValue::SignedInt(v),
        },
        MyValue::UInt(v) => match column.sql_type {
            SqlType::Bit { .. } => ColumnValue::Bit(v),
            _ => ColumnValue::SignedInt(v as i64),
        },
        MyValue::Float(v) => ColumnValue::Float(v),
        MyValue::Double(v) => ColumnValue::Double(v),
        MyValue::Bytes(bytes) => match &column.sql_type {
            SqlType::Decimal { .. } => {
                ColumnValue::Decimal(String::from_utf8_lossy(&bytes).into_owned())
            }
            SqlType::Json => ColumnValue::Json(
                serde_json::from_slice(&bytes)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
            ),
            SqlType::Bit { .. } => ColumnValue::Bit(
                bytes
                    .iter()
                    .rev()
                    .take(8)
                    .rev()
                    .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
            ),
            SqlType::Year => String::from_utf8_lossy(&bytes)
                .parse()
                .map(ColumnValue::Year)
                .unwrap_or(ColumnValue::Bytes(bytes)),
            _ => ColumnValue::Bytes(bytes),
        },
        MyValue::Date(year, month, day, hour, minute, second, micros) => match column.sql_type {
            SqlType::Date => ColumnValue::Date { year, month, day },
            // session time_zone is UTC
            SqlType::Timestamp { .. } => NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
                .and_then(|d| d.and_hms_opt(u32::from(hour), u32::from(minute), u32::from(second)))
                .map(|dt| ColumnValue::Timestamp {
                    seconds: dt.and_utc().timestamp().max(0) as u32,
                    microsecond: micros,
                })
                .unwrap_or(ColumnValue::Timestamp {
                    seconds: 0,
                    microsecond: 0,
                }),
            _ => ColumnValue::DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
                microsecond: micros,
            },
        },
        MyValue::Time(negative, days, hours, minutes, seconds, micros) => ColumnValue::Time {
            negative,
            hours: days * 24 + u32::from(hours),
            minutes,
            seconds,
            microseconds: micros,
        },
    }
}

/// Normalized key value back to a statement parameter.
fn key_param(value: &Value, column: Option<&ColumnDef>) -> MyValue {
    match value {
        Value::Null => MyValue::NULL,
        Value::Bool(b) => MyValue::Int(i64::from(*b)),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                MyValue::Int(v)
            } else if let Some(v) = n.as_u64() {
                MyValue::UInt(v)
            } else {
                MyValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => {
            let binary = column.is_some_and(|c| c.sql_type.is_binary());
            if binary {
                if let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(s) {
                    return MyValue::Bytes(raw);
                }
            }
            MyValue::Bytes(s.as_bytes().to_vec())
        }
        other => MyValue::Bytes(other.to_string().into_bytes()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenStep {
    StartView,
    ReadPosition,
}

/// Order in which the read view is opened and the watermark read.
///
/// Under the global read lock nothing commits between the two. Without it
/// the watermark must not trail the view; a commit in between is then read
/// by both the snapshot and the stream, and loading it twice is an upsert.
fn open_steps(locked: bool) -> [OpenStep; 2] {
    if locked {
        [OpenStep::StartView, OpenStep::ReadPosition]
    } else {
        [OpenStep::ReadPosition, OpenStep::StartView]
    }
}

#[async_trait]
impl SnapshotSource for MySqlSnapshotSource {
    async fn begin(&self) -> Result<LogPosition> {
        let mut conn = self.conn().await?;
        conn.query_drop("SET SESSION time_zone = '+00:00'")
            .await
            .map_err(|e| mysql_error("set time zone", e))?;
        conn.query_drop("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .await
            .map_err(|e| mysql_error("set isolation level", e))?;

        let locked = match conn.query_drop("FLUSH TABLES WITH READ LOCK").await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    error = %e,
                    "FLUSH TABLES WITH READ LOCK not permitted; reading the watermark before the read view"
                );
                false
            }
        };

        let opened = async {
            let mut position = None;
            for step in open_steps(locked) {
                match step {
                    OpenStep::StartView => conn
                        .query_drop("START TRANSACTION WITH CONSISTENT SNAPSHOT")
                        .await
                        .map_err(|e| mysql_error("start consistent snapshot", e))?,
                    OpenStep::ReadPosition => position = Some(binlog_position(&mut conn).await?),
                }
            }
            let position = position.ok_or_else(|| CdcError::invalid_state("binlog position was not read"))?;
            let mut schemas = HashMap::with_capacity(self.tables.len());
            for table in &self.tables {
                let schema = Self::query_schema(&mut conn, table).await?;
                schemas.insert(table.clone(), schema);
            }
            Ok::<_, CdcError>((position, schemas))
        }
        .await;

        if locked {
            conn.query_drop("UNLOCK TABLES")
                .await
                .map_err(|e| mysql_error("unlock tables", e))?;
        }
        let (position, schemas) = opened?;

        info!(
            watermark = %position,
            tables = schemas.len(),
            locked,
            "Consistent snapshot opened"
        );
        *self.schemas.lock().await = schemas;
        *self.view.lock().await = Some(conn);
        Ok(position)
    }

    async fn describe(&self, table: &TableId) -> Result<SchemaVersion> {
        self.schema(table).await
    }

    async fn fetch_batch(
        &self,
        table: &TableId,
        key_columns: &[String],
        last_key: Option<&[Value]>,
        batch_size: usize,
    ) -> Result<Vec<Value>> {
        let schema = self.schema(table).await?;
        let select = schema
            .columns
            .iter()
            .map(|c| quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let keys = key_columns
            .iter()
            .map(|k| quote(k))
            .collect::<Vec<_>>()
            .join(", ");
        let from = format!("{}.{}", quote(&table.database), quote(&table.table));

        let (sql, params) = match last_key {
            Some(last) => {
                let placeholders = vec!["?"; last.len()].join(", ");
                let params = last
                    .iter()
                    .zip(key_columns)
                    .map(|(v, k)| key_param(v, schema.column(k)))
                    .collect::<Vec<_>>();
                (
                    format!(
                        "SELECT {} FROM {} WHERE ({}) > ({}) ORDER BY {} LIMIT {}",
                        select, from, keys, placeholders, keys, batch_size
                    ),
                    Params::Positional(params),
                )
            }
            None => (
                format!(
                    "SELECT {} FROM {} ORDER BY {} LIMIT {}",
                    select, from, keys, batch_size
                ),
                Params::Empty,
            ),
        };

        let mut view = self.view.lock().await;
        let conn = view
            .as_mut()
            .ok_or_else(|| CdcError::invalid_state("snapshot read view is not open"))?;
        let rows: Vec<Row> = conn
            .exec(sql, params)
            .await
            .map_err(|e| mysql_error(&format!("fetch {}", table), e))?;

        let page = rows
            .into_iter()
            .map(|mut row| {
                let object: Map<String, Value> = schema
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| {
                        let raw: MyValue = row.take(i).unwrap_or(MyValue::NULL);
                        let value = column_value(raw, column);
                        (
                            column.name.clone(),
                            value_to_json(&value, column, &self.server_time_zone),
                        )
                    })
                    .collect();
                Value::Object(object)
            })
            .collect::<Vec<_>>();
        debug!(table = %table, rows = page.len(), "Fetched snapshot page");
        Ok(page)
    }

    async fn end(&self) -> Result<()> {
        if let Some(mut conn) = self.view.lock().await.take() {
            conn.query_drop("COMMIT")
                .await
                .map_err(|e| mysql_error("close read view", e))?;
            debug!("Snapshot read view closed");
        }
        Ok(())
    }

    async fn current_position(&self) -> Result<LogPosition> {
        let mut conn = self.conn().await?;
        binlog_position(&mut conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn column(ty: &str) -> ColumnDef {
        ColumnDef::new("c", SqlType::parse(ty).unwrap())
    }

    fn normalized(value: MyValue, ty: &str) -> Value {
        let c = column(ty);
        value_to_json(&column_value(value, &c), &c, &ServerTimeZone::Utc)
    }

    #[test]
    fn test_snapshot_values_match_binlog_normalization() {
        assert_eq!(normalized(MyValue::UInt(u64::MAX), "bigint unsigned"), json!(u64::MAX));
        assert_eq!(normalized(MyValue::Bytes(b"12.50".to_vec()), "decimal(6,2)"), json!("12.50"));
        assert_eq!(
            normalized(MyValue::Date(2024, 2, 29, 0, 0, 0, 0), "date"),
            json!("2024-02-29")
        );
        assert_eq!(
            normalized(MyValue::Date(2024, 2, 29, 13, 5, 59, 123_000), "datetime(3)"),
            json!("2024-02-29 13:05:59.123")
        );
        assert_eq!(
            normalized(MyValue::Date(2023, 11, 14, 22, 13, 20, 0), "timestamp"),
            json!("2023-11-14 22:13:20")
        );
        assert_eq!(
            normalized(MyValue::Time(true, 1, 2, 3, 4, 0), "time"),
            json!("-26:03:04")
        );
        assert_eq!(normalized(MyValue::Bytes(b"small".to_vec()), "enum('small','large')"), json!("small"));
        assert_eq!(normalized(MyValue::Bytes(vec![0x01, 0x02]), "bit(10)"), json!(258));
        assert_eq!(normalized(MyValue::Int(2024), "year"), json!(2024));
        assert_eq!(
            normalized(MyValue::Bytes(br#"{"a": 1}"#.to_vec()), "json"),
            json!(r#"{"a":1}"#)
        );
    }

    #[test]
    fn test_key_param_round_trip() {
        assert_eq!(key_param(&json!(5), None), MyValue::Int(5));
        assert_eq!(key_param(&json!("x"), None), MyValue::Bytes(b"x".to_vec()));
        let bin = column("varbinary(4)");
        assert_eq!(key_param(&json!("AQI="), Some(&bin)), MyValue::Bytes(vec![1, 2]));
    }

    #[test]
    fn test_unlocked_watermark_is_read_before_the_view() {
        assert_eq!(open_steps(false), [OpenStep::ReadPosition, OpenStep::StartView]);
        assert_eq!(open_steps(true), [OpenStep::StartView, OpenStep::ReadPosition]);
    }

    #[test]
    fn test_quote_escapes_backticks() {
        assert_eq!(quote("a`b"), "`a``b`");
    }
}
