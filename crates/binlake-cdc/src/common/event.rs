//! CDC Event representation
//!
//! A [`CdcEvent`] is one row change (or one schema change) read from the
//! binlog or synthesized by the snapshot. Row images are JSON objects keyed
//! by column name with values already normalized (decimals and temporals as
//! canonical text).

use crate::common::{CdcError, LogPosition, Result, SchemaEvolution};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Fully qualified source table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub database: String,
    pub table: String,
}

impl TableId {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }

    /// Checkpoint and file-safe key: `db.table`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

impl FromStr for TableId {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once('.') {
            Some((db, table)) if !db.is_empty() && !table.is_empty() && !table.contains('.') => {
                Ok(Self::new(db, table))
            }
            _ => Err(CdcError::config(format!(
                "table '{}' must be written as database.table",
                s
            ))),
        }
    }
}

/// CDC operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CdcOp {
    /// Row inserted (or read by the snapshot)
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// DDL changed the table's columns
    SchemaChange,
}

impl fmt::Display for CdcOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CdcOp::Insert => "insert",
            CdcOp::Update => "update",
            CdcOp::Delete => "delete",
            CdcOp::SchemaChange => "schema_change",
        };
        f.write_str(s)
    }
}

/// Represents a change captured from the source database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcEvent {
    /// Source table
    pub table: TableId,
    /// Operation type
    pub op: CdcOp,
    /// Previous row state (for UPDATE/DELETE)
    pub before: Option<Value>,
    /// Current row state (for INSERT/UPDATE)
    pub after: Option<Value>,
    /// Binlog position (the watermark for snapshot rows)
    pub position: LogPosition,
    /// Event timestamp (Unix epoch seconds)
    pub timestamp: i64,
    /// Synthetic insert produced by the initial snapshot
    #[serde(default)]
    pub snapshot: bool,
    /// Column-level change, present for `CdcOp::SchemaChange`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_change: Option<Box<SchemaEvolution>>,
}

impl CdcEvent {
    /// Create a new INSERT event
    pub fn insert(table: TableId, data: Value, position: LogPosition, timestamp: i64) -> Self {
        Self {
            table,
            op: CdcOp::Insert,
            before: None,
            after: Some(data),
            position,
            timestamp,
            snapshot: false,
            schema_change: None,
        }
    }

    /// Create a new UPDATE event
    pub fn update(
        table: TableId,
        before: Option<Value>,
        after: Value,
        position: LogPosition,
        timestamp: i64,
    ) -> Self {
        Self {
            table,
            op: CdcOp::Update,
            before,
            after: Some(after),
            position,
            timestamp,
            snapshot: false,
            schema_change: None,
        }
    }

    /// Create a new DELETE event
    pub fn delete(table: TableId, before: Value, position: LogPosition, timestamp: i64) -> Self {
        Self {
            table,
            op: CdcOp::Delete,
            before: Some(before),
            after: None,
            position,
            timestamp,
            snapshot: false,
            schema_change: None,
        }
    }

    /// Create a snapshot row, positioned at the snapshot watermark.
    pub fn snapshot_row(table: TableId, data: Value, watermark: LogPosition) -> Self {
        Self {
            snapshot: true,
            ..Self::insert(table, data, watermark, chrono::Utc::now().timestamp())
        }
    }

    /// Create a schema change marker.
    pub fn schema_change(evolution: SchemaEvolution, timestamp: i64) -> Self {
        Self {
            table: evolution.table.clone(),
            op: CdcOp::SchemaChange,
            before: None,
            after: None,
            position: evolution.position.clone(),
            timestamp,
            snapshot: false,
            schema_change: Some(Box::new(evolution)),
        }
    }

    /// Check if this is a row change.
    pub fn is_dml(&self) -> bool {
        matches!(self.op, CdcOp::Insert | CdcOp::Update | CdcOp::Delete)
    }

    /// The row image that identifies the row's final state: `after` for
    /// inserts and updates, `before` for deletes.
    pub fn row_image(&self) -> Option<&Map<String, Value>> {
        let image = match self.op {
            CdcOp::Insert | CdcOp::Update => self.after.as_ref(),
            CdcOp::Delete => self.before.as_ref(),
            CdcOp::SchemaChange => None,
        };
        image.and_then(Value::as_object)
    }

    /// Primary key values of the row image, in `key_columns` order.
    pub fn key_values(&self, key_columns: &[String]) -> Option<Vec<Value>> {
        let image = self.row_image()?;
        key_columns
            .iter()
            .map(|c| image.get(c).cloned())
            .collect()
    }

    /// Primary key of the before image when an update moved the row to a new key.
    pub fn replaced_key(&self, key_columns: &[String]) -> Option<Vec<Value>> {
        if self.op != CdcOp::Update || key_columns.is_empty() {
            return None;
        }
        let before = self.before.as_ref()?.as_object()?;
        let old: Option<Vec<Value>> = key_columns.iter().map(|c| before.get(c).cloned()).collect();
        let old = old?;
        match self.key_values(key_columns) {
            Some(new) if new != old => Some(old),
            _ => None,
        }
    }
}
