//! Load batches: row encoding and deterministic labels.

use crate::types::DestinationTable;
use binlake_cdc::{CdcEvent, CdcOp, LogPosition};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Hidden Doris column that turns a row into a delete.
pub const DELETE_SIGN: &str = "__DORIS_DELETE_SIGN__";

/// Doris caps labels at 128 characters.
pub const MAX_LABEL_LEN: usize = 128;

/// Length of the content hash at the end of a label.
const HASH_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOp {
    Upsert,
    Delete,
}

/// One row as the destination applies it.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub op: RowOp,
    pub data: Map<String, Value>,
}

impl RowChange {
    /// JSON object with the delete sign set.
    pub fn to_json(&self) -> Value {
        let mut data = self.data.clone();
        let sign = match self.op {
            RowOp::Upsert => 0,
            RowOp::Delete => 1,
        };
        data.insert(DELETE_SIGN.to_string(), Value::from(sign));
        Value::Object(data)
    }

    /// Key values in `key_columns` order.
    pub fn key(&self, key_columns: &[String]) -> Vec<Value> {
        key_columns
            .iter()
            .map(|c| self.data.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Expand change events into the rows a destination applies, in order.
///
/// An update that moves a row to a new primary key deletes the old key
/// first.
pub fn row_changes(events: &[CdcEvent], key_columns: &[String]) -> Vec<RowChange> {
    let mut rows = Vec::with_capacity(events.len());
    for event in events {
        let Some(image) = event.row_image() else {
            continue;
        };
        match event.op {
            CdcOp::Insert => rows.push(RowChange {
                op: RowOp::Upsert,
                data: image.clone(),
            }),
            CdcOp::Update => {
                if let Some(old_key) = event.replaced_key(key_columns) {
                    let data = key_columns.iter().cloned().zip(old_key).collect();
                    rows.push(RowChange {
                        op: RowOp::Delete,
                        data,
                    });
                }
                rows.push(RowChange {
                    op: RowOp::Upsert,
                    data: image.clone(),
                });
            }
            CdcOp::Delete => rows.push(RowChange {
                op: RowOp::Delete,
                data: image.clone(),
            }),
            CdcOp::SchemaChange => {}
        }
    }
    rows
}

/// Encode rows as JSON lines (`read_json_by_line`).
pub fn encode_json_lines(rows: &[RowChange]) -> serde_json::Result<Vec<u8>> {
    let mut body = Vec::with_capacity(rows.len() * 64);
    for row in rows {
        serde_json::to_writer(&mut body, &row.to_json())?;
        body.push(b'\n');
    }
    Ok(body)
}

/// A group of consecutive events of one table, submitted under one label.
#[derive(Debug, Clone)]
pub struct LoadBatch {
    pub table: DestinationTable,
    pub key_columns: Vec<String>,
    pub events: Vec<CdcEvent>,
    pub label: String,
    pub first: LogPosition,
    pub last: LogPosition,
}

impl LoadBatch {
    /// Build a batch labeled from its content. Returns `None` for no events.
    pub fn new(
        table: DestinationTable,
        key_columns: Vec<String>,
        events: Vec<CdcEvent>,
        label_prefix: &str,
    ) -> serde_json::Result<Option<Self>> {
        let (Some(first), Some(last)) = (
            events.first().map(|e| e.position.clone()),
            events.last().map(|e| e.position.clone()),
        ) else {
            return Ok(None);
        };
        let body = encode_json_lines(&row_changes(&events, &key_columns))?;
        let label = make_label(label_prefix, &table, &first, &last, &body);
        Ok(Some(Self {
            table,
            key_columns,
            events,
            label,
            first,
            last,
        }))
    }

    /// Rebuild a batch under a label recorded before a restart.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn rows(&self) -> Vec<RowChange> {
        row_changes(&self.events, &self.key_columns)
    }

    pub fn to_json_lines(&self) -> serde_json::Result<Vec<u8>> {
        encode_json_lines(&self.rows())
    }
}

/// `{prefix}_{db}_{table}_{first}_{last}_{hash}`, restricted to
/// `[A-Za-z0-9_-]` and [`MAX_LABEL_LEN`] characters.
///
/// The hash covers the encoded rows, so equal content gives an equal label.
pub fn make_label(
    prefix: &str,
    table: &DestinationTable,
    first: &LogPosition,
    last: &LogPosition,
    body: &[u8],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(table.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(first.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(last.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(body);
    let digest = hex::encode(hasher.finalize());
    let hash = &digest[..HASH_LEN];

    let head = sanitize(&format!(
        "{}_{}_{}_{}_{}",
        prefix,
        table.database,
        table.table,
        first.compact(),
        last.compact()
    ));
    // the hash is what makes a label unique; trim the readable part
    let room = MAX_LABEL_LEN - HASH_LEN - 1;
    let head: String = head.chars().take(room).collect();
    format!("{}_{}", head, hash)
}

fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use binlake_cdc::TableId;
    use serde_json::json;

    fn orders() -> TableId {
        TableId::new("shop", "orders")
    }

    fn pos(offset: u64, event: u32) -> LogPosition {
        LogPosition::at("mysql-bin.000002", offset, event, 0)
    }

    fn key() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[test]
    fn test_delete_sign_encoding() {
        let events = vec![
            CdcEvent::insert(orders(), json!({"id": 1, "qty": 2}), pos(100, 3), 0),
            CdcEvent::delete(orders(), json!({"id": 1, "qty": 2}), pos(200, 3), 0),
        ];
        let body = encode_json_lines(&row_changes(&events, &key())).unwrap();
        let lines: Vec<Value> = body
            .split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_slice(l).unwrap())
            .collect();
        assert_eq!(lines[0][DELETE_SIGN], json!(0));
        assert_eq!(lines[1][DELETE_SIGN], json!(1));
        assert_eq!(lines[1]["id"], json!(1));
    }

    #[test]
    fn test_key_change_deletes_old_key_first() {
        let events = vec![CdcEvent::update(
            orders(),
            Some(json!({"id": 1, "qty": 2})),
            json!({"id": 7, "qty": 2}),
            pos(100, 3),
            0,
        )];
        let rows = row_changes(&events, &key());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].op, RowOp::Delete);
        assert_eq!(rows[0].key(&key()), vec![json!(1)]);
        assert_eq!(rows[1].op, RowOp::Upsert);
        assert_eq!(rows[1].key(&key()), vec![json!(7)]);
    }

    #[test]
    fn test_label_is_deterministic_and_bounded() {
        let table = DestinationTable::new("dw", "orders");
        let events = vec![CdcEvent::insert(orders(), json!({"id": 1}), pos(100, 3), 0)];
        let a = LoadBatch::new(table.clone(), key(), events.clone(), "binlake")
            .unwrap()
            .unwrap();
        let b = LoadBatch::new(table.clone(), key(), events, "binlake")
            .unwrap()
            .unwrap();
        assert_eq!(a.label, b.label);
        assert!(a.label.starts_with("binlake_dw_orders_2-100-3-0_2-100-3-0_"));

        let other = vec![CdcEvent::insert(orders(), json!({"id": 2}), pos(100, 3), 0)];
        let c = LoadBatch::new(table, key(), other, "binlake").unwrap().unwrap();
        assert_ne!(a.label, c.label);

        let long = make_label(
            &"p".repeat(200),
            &DestinationTable::new("d.b", "t b"),
            &pos(1, 1),
            &pos(2, 2),
            b"x",
        );
        assert_eq!(long.len(), MAX_LABEL_LEN);
        assert!(long
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn test_empty_batch() {
        let batch = LoadBatch::new(DestinationTable::new("dw", "t"), key(), vec![], "p").unwrap();
        assert!(batch.is_none());
    }
}
