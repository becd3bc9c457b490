//! In-memory warehouse for tests and dry runs.

use super::{Destination, DestinationCapabilities, LoadOutcome, LoadStatus};
use crate::error::{ConnectorError, ConnectorResult};
use crate::loader::{LoadBatch, RowOp};
use crate::types::DestinationTable;
use async_trait::async_trait;
use binlake_cdc::ColumnChange;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Operation applied to the memory destination, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationOp {
    Load {
        table: DestinationTable,
        label: String,
        rows: usize,
        status: LoadStatus,
    },
    Alter {
        table: DestinationTable,
        changes: Vec<String>,
    },
}

#[derive(Debug, Default)]
struct MemoryTable {
    /// Known columns; `None` accepts anything
    columns: Option<BTreeSet<String>>,
    rows: BTreeMap<String, Map<String, Value>>,
}

#[derive(Debug, Default)]
struct Warehouse {
    tables: HashMap<DestinationTable, MemoryTable>,
    labels: HashSet<String>,
    log: Vec<DestinationOp>,
    failing_loads: u32,
    attempts: u64,
}

/// Rows keyed by primary key; batches apply atomically and labels dedup.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Warehouse>>,
    capabilities: DestinationCapabilities,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads to this destination are capped at `rows` per batch.
    pub fn with_max_batch_rows(mut self, rows: usize) -> Self {
        self.capabilities.max_batch_rows = Some(rows);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Warehouse> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Declare `table` with a fixed column set; rows with other columns are rejected.
    pub fn create_table<I, S>(&self, table: DestinationTable, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut w = self.lock();
        let entry = w.tables.entry(table).or_default();
        entry.columns = Some(columns.into_iter().map(Into::into).collect());
    }

    /// Fail the next `n` loads with a retriable error.
    pub fn fail_next_loads(&self, n: u32) {
        self.lock().failing_loads = n;
    }

    /// Rows of `table` ordered by key.
    pub fn rows(&self, table: &DestinationTable) -> Vec<Map<String, Value>> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &DestinationTable) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    pub fn columns(&self, table: &DestinationTable) -> Option<BTreeSet<String>> {
        self.lock().tables.get(table).and_then(|t| t.columns.clone())
    }

    pub fn operations(&self) -> Vec<DestinationOp> {
        self.lock().log.clone()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.lock().labels.contains(label)
    }

    /// Load calls received, including failed ones.
    pub fn load_attempts(&self) -> u64 {
        self.lock().attempts
    }
}

fn row_key(data: &Map<String, Value>, key_columns: &[String]) -> String {
    if key_columns.is_empty() {
        return Value::Object(data.clone()).to_string();
    }
    let key: Vec<&Value> = key_columns
        .iter()
        .map(|c| data.get(c).unwrap_or(&Value::Null))
        .collect();
    serde_json::to_string(&key).unwrap_or_default()
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn load(&self, batch: &LoadBatch) -> ConnectorResult<LoadOutcome> {
        let mut w = self.lock();
        w.attempts += 1;
        if w.failing_loads > 0 {
            w.failing_loads -= 1;
            return Err(ConnectorError::connection("injected load failure"));
        }

        if w.labels.contains(&batch.label) {
            w.log.push(DestinationOp::Load {
                table: batch.table.clone(),
                label: batch.label.clone(),
                rows: 0,
                status: LoadStatus::AlreadyApplied,
            });
            return Ok(LoadOutcome::already_applied());
        }

        let rows = batch.rows();
        let table = w.tables.entry(batch.table.clone()).or_default();
        if let Some(columns) = &table.columns {
            for (i, row) in rows.iter().enumerate() {
                if let Some(unknown) = row.data.keys().find(|c| !columns.contains(*c)) {
                    return Err(ConnectorError::schema(format!(
                        "row {} of {} has unknown column '{}'",
                        i, batch.table, unknown
                    )));
                }
            }
        }

        for row in &rows {
            let key = row_key(&row.data, &batch.key_columns);
            match row.op {
                RowOp::Upsert => {
                    table.rows.insert(key, row.data.clone());
                }
                RowOp::Delete => {
                    table.rows.remove(&key);
                }
            }
        }

        w.labels.insert(batch.label.clone());
        w.log.push(DestinationOp::Load {
            table: batch.table.clone(),
            label: batch.label.clone(),
            rows: rows.len(),
            status: LoadStatus::Applied,
        });
        debug!(table = %batch.table, label = %batch.label, rows = rows.len(), "Memory load applied");
        Ok(LoadOutcome::applied(rows.len() as u64))
    }

    async fn alter_table(
        &self,
        table: &DestinationTable,
        changes: &[ColumnChange],
    ) -> ConnectorResult<()> {
        let mut w = self.lock();
        let entry = w.tables.entry(table.clone()).or_default();
        for change in changes {
            match change {
                ColumnChange::Add { column } => {
                    if let Some(columns) = entry.columns.as_mut() {
                        columns.insert(column.name.clone());
                    }
                }
                ColumnChange::Widen { .. } => {}
                other => {
                    return Err(ConnectorError::schema(format!(
                        "cannot apply '{}' to {}",
                        other, table
                    )))
                }
            }
        }
        w.log.push(DestinationOp::Alter {
            table: table.clone(),
            changes: changes.iter().map(ToString::to_string).collect(),
        });
        Ok(())
    }

    fn capabilities(&self) -> DestinationCapabilities {
        self.capabilities.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binlake_cdc::{CdcEvent, ColumnDef, LogPosition, SqlType, TableId};
    use serde_json::json;

    fn table() -> DestinationTable {
        DestinationTable::new("dw", "orders")
    }

    fn batch(events: Vec<CdcEvent>) -> LoadBatch {
        LoadBatch::new(table(), vec!["id".into()], events, "test")
            .unwrap()
            .unwrap()
    }

    fn insert(id: i64, offset: u64) -> CdcEvent {
        CdcEvent::insert(
            TableId::new("shop", "orders"),
            json!({"id": id, "qty": 1}),
            LogPosition::at("mysql-bin.000001", offset, 1, 0),
            0,
        )
    }

    #[tokio::test]
    async fn test_repeat_label_is_already_applied() {
        let dest = MemoryDestination::new();
        let b = batch(vec![insert(1, 10), insert(2, 20)]);
        assert_eq!(dest.load(&b).await.unwrap().status, LoadStatus::Applied);
        assert_eq!(dest.load(&b).await.unwrap().status, LoadStatus::AlreadyApplied);
        assert_eq!(dest.row_count(&table()), 2);
    }

    #[tokio::test]
    async fn test_unknown_column_rejects_whole_batch() {
        let dest = MemoryDestination::new();
        dest.create_table(table(), ["id"]);
        let err = dest.load(&batch(vec![insert(1, 10)])).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(dest.row_count(&table()), 0);

        let add = ColumnChange::Add {
            column: ColumnDef::new("qty", SqlType::parse("int").unwrap()),
        };
        dest.alter_table(&table(), &[add]).await.unwrap();
        dest.load(&batch(vec![insert(1, 10)])).await.unwrap();
        assert_eq!(dest.row_count(&table()), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_retryable() {
        let dest = MemoryDestination::new();
        dest.fail_next_loads(1);
        let b = batch(vec![insert(1, 10)]);
        assert!(dest.load(&b).await.unwrap_err().is_retryable());
        assert!(dest.load(&b).await.is_ok());
        assert_eq!(dest.load_attempts(), 2);
    }
}
