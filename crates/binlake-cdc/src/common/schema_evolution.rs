//! # Schema Evolution Tracking
//!
//! Keeps the column layout of every captured table in step with the DDL in
//! the binlog.
//!
//! - **Version Tracking**: one [`SchemaVersion`] per column-set change
//! - **Diffing**: [`SchemaDiff`] classifies each column change
//! - **Compatibility**: adds of nullable/defaulted columns and widenings
//!   can be mirrored on the destination; drops, narrowings and renames cannot
//! - **Resolution**: an operator can accept a change at a log position
//!
//! ## Usage
//!
//! ```ignore
//! let tracker = SchemaTracker::new();
//! tracker.register(schema_v1).await;
//!
//! if let Some(evolution) = tracker.evolve(&table, ddl, &position).await? {
//!     if evolution.is_compatible() { /* alter destination */ }
//! }
//! ```

use crate::common::ddl::{self, AlterOp, ColumnPosition, DdlStatement};
use crate::common::{ColumnDef, LogPosition, Result, SchemaVersion, TableId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One column-level difference between two schema versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ColumnChange {
    Add { column: ColumnDef },
    Drop { column: ColumnDef },
    /// Type widening or NOT NULL → NULL
    Widen { from: ColumnDef, to: ColumnDef },
    Narrow { from: ColumnDef, to: ColumnDef },
    Rename { from: String, to: String },
    /// Table-level DDL (drop, truncate, rename, unparseable statement)
    Statement { detail: String },
}

impl ColumnChange {
    /// Whether the destination can follow this change in place.
    pub fn is_compatible(&self) -> bool {
        match self {
            ColumnChange::Add { column } => column.is_backfillable(),
            ColumnChange::Widen { .. } => true,
            ColumnChange::Drop { .. }
            | ColumnChange::Narrow { .. }
            | ColumnChange::Rename { .. }
            | ColumnChange::Statement { .. } => false,
        }
    }
}

impl fmt::Display for ColumnChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnChange::Add { column } if column.is_backfillable() => {
                write!(f, "add column `{}` {}", column.name, column.sql_type)
            }
            ColumnChange::Add { column } => write!(
                f,
                "add column `{}` {} NOT NULL without default",
                column.name, column.sql_type
            ),
            ColumnChange::Drop { column } => write!(f, "drop column `{}`", column.name),
            ColumnChange::Widen { from, to } | ColumnChange::Narrow { from, to } => {
                let verb = if matches!(self, ColumnChange::Widen { .. }) {
                    "widen"
                } else {
                    "narrow"
                };
                write!(
                    f,
                    "{} column `{}` {}{} → {}{}",
                    verb,
                    to.name,
                    from.sql_type,
                    if from.nullable { "" } else { " NOT NULL" },
                    to.sql_type,
                    if to.nullable { "" } else { " NOT NULL" }
                )
            }
            ColumnChange::Rename { from, to } => write!(f, "rename column `{}` to `{}`", from, to),
            ColumnChange::Statement { detail } => f.write_str(detail),
        }
    }
}

/// Column-level diff between two layouts of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    pub changes: Vec<ColumnChange>,
}

impl SchemaDiff {
    /// Compare `old` and `new`. `renames` lists `(old_name, new_name)` pairs
    /// known from the DDL so a rename is not reported as drop + add.
    pub fn compute(old: &[ColumnDef], new: &[ColumnDef], renames: &[(String, String)]) -> Self {
        let renamed_to = |name: &str| -> String {
            let mut current = name.to_string();
            for (from, to) in renames {
                if from.eq_ignore_ascii_case(&current) {
                    current = to.clone();
                }
            }
            current
        };

        let mut changes = Vec::new();
        let mut matched = vec![false; new.len()];

        for before in old {
            let target = renamed_to(&before.name);
            let found = new
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(&target));
            let Some(idx) = found else {
                changes.push(ColumnChange::Drop {
                    column: before.clone(),
                });
                continue;
            };
            matched[idx] = true;
            let after = &new[idx];

            if !after.name.eq_ignore_ascii_case(&before.name) {
                changes.push(ColumnChange::Rename {
                    from: before.name.clone(),
                    to: after.name.clone(),
                });
            }
            if before.sql_type == after.sql_type && before.nullable == after.nullable {
                continue;
            }
            let loosens_null = !before.nullable || after.nullable;
            if loosens_null && before.sql_type.widens_to(&after.sql_type) {
                changes.push(ColumnChange::Widen {
                    from: before.clone(),
                    to: after.clone(),
                });
            } else {
                changes.push(ColumnChange::Narrow {
                    from: before.clone(),
                    to: after.clone(),
                });
            }
        }

        for (idx, column) in new.iter().enumerate() {
            if !matched[idx] {
                changes.push(ColumnChange::Add {
                    column: column.clone(),
                });
            }
        }

        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// A schema change of one table at one log position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEvolution {
    pub table: TableId,
    /// Position of the DDL statement
    pub position: LogPosition,
    pub ddl: String,
    pub from_version: u32,
    pub to_version: u32,
    pub changes: Vec<ColumnChange>,
    /// Layout after the change
    pub schema: SchemaVersion,
    /// Accepted by an operator; the destination was altered out of band
    #[serde(default)]
    pub resolved: bool,
}

impl SchemaEvolution {
    pub fn is_compatible(&self) -> bool {
        self.changes.iter().all(ColumnChange::is_compatible)
    }

    /// Human-readable list of the changes the destination cannot follow.
    pub fn unsupported_detail(&self) -> Option<String> {
        let parts: Vec<String> = self
            .changes
            .iter()
            .filter(|c| !c.is_compatible())
            .map(ToString::to_string)
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

/// Statistics for schema tracking.
#[derive(Debug, Default)]
pub struct SchemaTrackerStats {
    pub schemas_registered: AtomicU64,
    pub evolutions: AtomicU64,
    pub unsupported: AtomicU64,
}

impl SchemaTrackerStats {
    pub fn snapshot(&self) -> SchemaTrackerStatsSnapshot {
        SchemaTrackerStatsSnapshot {
            schemas_registered: self.schemas_registered.load(Ordering::Relaxed),
            evolutions: self.evolutions.load(Ordering::Relaxed),
            unsupported: self.unsupported.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of schema tracker statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaTrackerStatsSnapshot {
    pub schemas_registered: u64,
    pub evolutions: u64,
    pub unsupported: u64,
}

#[derive(Debug, Default)]
struct TableState {
    versions: Vec<SchemaVersion>,
    resolved: BTreeSet<LogPosition>,
}

/// Versioned column layouts of the captured tables.
#[derive(Debug, Default)]
pub struct SchemaTracker {
    tables: RwLock<HashMap<TableId, TableState>>,
    stats: SchemaTrackerStats,
}

impl SchemaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the baseline layout of a table, discarding earlier history.
    pub async fn register(&self, schema: SchemaVersion) {
        let mut tables = self.tables.write().await;
        let state = tables.entry(schema.table.clone()).or_default();
        info!(
            table = %schema.table,
            version = schema.version,
            columns = schema.columns.len(),
            "Registered table schema"
        );
        state.versions = vec![schema];
        self.stats.schemas_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn current(&self, table: &TableId) -> Option<SchemaVersion> {
        let tables = self.tables.read().await;
        tables.get(table).and_then(|s| s.versions.last().cloned())
    }

    pub async fn history(&self, table: &TableId) -> Vec<SchemaVersion> {
        let tables = self.tables.read().await;
        tables
            .get(table)
            .map(|s| s.versions.clone())
            .unwrap_or_default()
    }

    pub async fn is_tracked(&self, table: &TableId) -> bool {
        let tables = self.tables.read().await;
        tables.get(table).is_some_and(|s| !s.versions.is_empty())
    }

    /// Column names of the current layout, used to label decoded rows.
    pub async fn column_names(&self, table: &TableId) -> Option<Vec<String>> {
        self.current(table).await.map(|s| s.column_names())
    }

    /// Accept the DDL at `position` for `table`.
    pub async fn resolve(&self, table: &TableId, position: LogPosition) {
        let mut tables = self.tables.write().await;
        info!(table = %table, position = %position, "Schema change resolved by operator");
        tables
            .entry(table.clone())
            .or_default()
            .resolved
            .insert(position);
    }

    pub async fn is_resolved(&self, table: &TableId, position: &LogPosition) -> bool {
        let tables = self.tables.read().await;
        tables
            .get(table)
            .is_some_and(|s| s.resolved.contains(position))
    }

    /// Apply `ddl` seen at `position` to `table`.
    ///
    /// Returns `None` when the statement does not change the table's column
    /// set. Otherwise the new layout becomes current and the evolution is
    /// returned for the destination to follow (or reject).
    pub async fn evolve(
        &self,
        table: &TableId,
        ddl_text: &str,
        position: &LogPosition,
    ) -> Result<Option<SchemaEvolution>> {
        let mut tables = self.tables.write().await;
        let Some(state) = tables.get_mut(table) else {
            return Ok(None);
        };
        let Some(current) = state.versions.last().cloned() else {
            return Ok(None);
        };

        let outcome = match ddl::parse(ddl_text) {
            Ok(statement) => next_layout(table, &current.columns, &statement),
            Err(e) => {
                warn!(table = %table, position = %position, error = %e, "Unparseable DDL on tracked table");
                Layout::Statement(format!("unparseable DDL: {}", e))
            }
        };

        let resolved = state.resolved.contains(position);
        let (changes, schema) = match outcome {
            Layout::Unchanged => return Ok(None),
            Layout::Statement(detail) => (vec![ColumnChange::Statement { detail }], current.clone()),
            Layout::Columns { columns, renames } => {
                let diff = SchemaDiff::compute(&current.columns, &columns, &renames);
                if diff.is_empty() {
                    // defaults or ordering only
                    if let Some(last) = state.versions.last_mut() {
                        last.columns = columns;
                    }
                    debug!(table = %table, position = %position, "DDL left the column set unchanged");
                    return Ok(None);
                }
                let next = current.next(columns);
                state.versions.push(next.clone());
                (diff.changes, next)
            }
        };

        let evolution = SchemaEvolution {
            table: table.clone(),
            position: position.clone(),
            ddl: ddl_text.to_string(),
            from_version: current.version,
            to_version: schema.version,
            changes,
            schema,
            resolved,
        };

        self.stats.evolutions.fetch_add(1, Ordering::Relaxed);
        if let Some(detail) = evolution.unsupported_detail() {
            self.stats.unsupported.fetch_add(1, Ordering::Relaxed);
            if resolved {
                info!(table = %table, position = %position, detail = %detail, "Accepting resolved schema change");
            } else {
                warn!(table = %table, position = %position, detail = %detail, "Unsupported schema change");
            }
        } else {
            info!(
                table = %table,
                position = %position,
                from = evolution.from_version,
                to = evolution.to_version,
                "Schema evolved"
            );
        }
        Ok(Some(evolution))
    }

    pub fn stats(&self) -> SchemaTrackerStatsSnapshot {
        self.stats.snapshot()
    }
}

enum Layout {
    Unchanged,
    Statement(String),
    Columns {
        columns: Vec<ColumnDef>,
        renames: Vec<(String, String)>,
    },
}

fn next_layout(table: &TableId, current: &[ColumnDef], statement: &DdlStatement) -> Layout {
    let db = table.database.as_str();
    match statement {
        DdlStatement::AlterTable { table: target, ops } => {
            if &target.resolve(db) != table {
                return Layout::Statement(format!(
                    "table replaced by rename of {}",
                    target.resolve(db)
                ));
            }
            apply_ops(current, ops)
        }
        DdlStatement::CreateTable { columns, .. } if columns.is_empty() => {
            Layout::Statement("table re-created without a column list".into())
        }
        DdlStatement::CreateTable { columns, .. } => Layout::Columns {
            columns: columns.clone(),
            renames: Vec::new(),
        },
        DdlStatement::DropTable { .. } => Layout::Statement("table dropped".into()),
        DdlStatement::RenameTable { .. } => Layout::Statement("table renamed".into()),
        DdlStatement::Truncate { .. } => Layout::Statement("table truncated".into()),
        DdlStatement::Other => Layout::Unchanged,
    }
}

fn apply_ops(current: &[ColumnDef], ops: &[AlterOp]) -> Layout {
    let mut columns = current.to_vec();
    let mut renames = Vec::new();
    let find = |columns: &[ColumnDef], name: &str| {
        columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    };
    let place = |columns: &mut Vec<ColumnDef>, column: ColumnDef, position: &ColumnPosition, at: usize| {
        let idx = match position {
            ColumnPosition::Last => at.min(columns.len()),
            ColumnPosition::First => 0,
            ColumnPosition::After(name) => columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(name))
                .map_or(columns.len(), |i| i + 1),
        };
        columns.insert(idx, column);
    };

    for op in ops {
        match op {
            AlterOp::AddColumn { column, position } => {
                let end = columns.len();
                place(&mut columns, column.clone(), position, end);
            }
            AlterOp::DropColumn(name) => {
                if let Some(i) = find(&columns, name) {
                    columns.remove(i);
                }
            }
            AlterOp::ModifyColumn { column, position } => {
                let Some(i) = find(&columns, &column.name) else {
                    continue;
                };
                let mut next = column.clone();
                next.primary_key |= columns[i].primary_key;
                next.nullable &= !next.primary_key;
                columns.remove(i);
                place(&mut columns, next, position, i);
            }
            AlterOp::ChangeColumn {
                old,
                column,
                position,
            } => {
                let Some(i) = find(&columns, old) else {
                    continue;
                };
                let mut next = column.clone();
                next.primary_key |= columns[i].primary_key;
                next.nullable &= !next.primary_key;
                if !old.eq_ignore_ascii_case(&column.name) {
                    renames.push((old.clone(), column.name.clone()));
                }
                columns.remove(i);
                place(&mut columns, next, position, i);
            }
            AlterOp::RenameColumn { from, to } => {
                if let Some(i) = find(&columns, from) {
                    columns[i].name = to.clone();
                    renames.push((from.clone(), to.clone()));
                }
            }
            AlterOp::AlterDefault { column, default } => {
                if let Some(i) = find(&columns, column) {
                    columns[i].default = default.clone();
                }
            }
            AlterOp::RenameTable(to) => {
                return Layout::Statement(format!("table renamed to {}", to.table));
            }
            AlterOp::Ignored => {}
        }
    }

    if columns == current && renames.is_empty() {
        Layout::Unchanged
    } else {
        Layout::Columns { columns, renames }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SqlType;

    fn orders() -> TableId {
        TableId::new("shop", "orders")
    }

    fn baseline() -> SchemaVersion {
        SchemaVersion::new(
            orders(),
            vec![
                ColumnDef::new("id", SqlType::parse("bigint").unwrap()).primary_key(),
                ColumnDef::new("a", SqlType::parse("int").unwrap()),
                ColumnDef::new("b", SqlType::parse("varchar(20)").unwrap()),
            ],
        )
    }

    fn pos(offset: u64) -> LogPosition {
        LogPosition::new("mysql-bin.000001", offset)
    }

    async fn tracker() -> SchemaTracker {
        let t = SchemaTracker::new();
        t.register(baseline()).await;
        t
    }

    #[tokio::test]
    async fn test_add_nullable_column_is_compatible() {
        let t = tracker().await;
        let ev = t
            .evolve(&orders(), "ALTER TABLE orders ADD COLUMN c varchar(10) NULL", &pos(500))
            .await
            .unwrap()
            .unwrap();

        assert!(ev.is_compatible());
        assert_eq!(ev.from_version, 1);
        assert_eq!(ev.to_version, 2);
        assert!(matches!(&ev.changes[..], [ColumnChange::Add { column }] if column.name == "c"));
        assert_eq!(
            t.column_names(&orders()).await.unwrap(),
            vec!["id", "a", "b", "c"]
        );
        assert_eq!(t.history(&orders()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_add_column_after_keeps_ordinal_order() {
        let t = tracker().await;
        t.evolve(&orders(), "ALTER TABLE orders ADD x int DEFAULT 1 AFTER id", &pos(10))
            .await
            .unwrap();
        assert_eq!(
            t.column_names(&orders()).await.unwrap(),
            vec!["id", "x", "a", "b"]
        );
    }

    #[tokio::test]
    async fn test_not_null_add_without_default_is_unsupported() {
        let t = tracker().await;
        let ev = t
            .evolve(&orders(), "ALTER TABLE orders ADD COLUMN c int NOT NULL", &pos(600))
            .await
            .unwrap()
            .unwrap();
        assert!(!ev.is_compatible());
        assert!(ev.unsupported_detail().unwrap().contains("without default"));
    }

    #[tokio::test]
    async fn test_drop_and_rename_are_unsupported() {
        let t = tracker().await;
        let ev = t
            .evolve(&orders(), "ALTER TABLE orders DROP COLUMN b", &pos(700))
            .await
            .unwrap()
            .unwrap();
        assert!(!ev.is_compatible());
        assert!(matches!(&ev.changes[..], [ColumnChange::Drop { column }] if column.name == "b"));

        let ev = t
            .evolve(&orders(), "ALTER TABLE orders RENAME COLUMN a TO a2", &pos(800))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ev.changes,
            vec![ColumnChange::Rename {
                from: "a".into(),
                to: "a2".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_widen_and_narrow() {
        let t = tracker().await;
        let ev = t
            .evolve(&orders(), "ALTER TABLE orders MODIFY a bigint", &pos(900))
            .await
            .unwrap()
            .unwrap();
        assert!(ev.is_compatible());
        assert!(matches!(ev.changes[0], ColumnChange::Widen { .. }));

        let ev = t
            .evolve(&orders(), "ALTER TABLE orders MODIFY b varchar(5)", &pos(950))
            .await
            .unwrap()
            .unwrap();
        assert!(!ev.is_compatible());
        assert!(matches!(ev.changes[0], ColumnChange::Narrow { .. }));
    }

    #[tokio::test]
    async fn test_default_change_is_not_an_evolution() {
        let t = tracker().await;
        let ev = t
            .evolve(&orders(), "ALTER TABLE orders ALTER COLUMN a SET DEFAULT 3", &pos(1000))
            .await
            .unwrap();
        assert!(ev.is_none());
        let current = t.current(&orders()).await.unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(current.column("a").unwrap().default.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_table_level_statements() {
        let t = tracker().await;
        let ev = t
            .evolve(&orders(), "TRUNCATE TABLE orders", &pos(1100))
            .await
            .unwrap()
            .unwrap();
        assert!(!ev.is_compatible());
        assert_eq!(ev.from_version, ev.to_version);

        assert!(t
            .evolve(&orders(), "CREATE INDEX i ON orders (a)", &pos(1200))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_untracked_table_is_ignored() {
        let t = tracker().await;
        let other = TableId::new("shop", "other");
        assert!(t
            .evolve(&other, "ALTER TABLE other DROP COLUMN x", &pos(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_resolution_marks_evolution() {
        let t = tracker().await;
        t.resolve(&orders(), pos(700)).await;
        assert!(t.is_resolved(&orders(), &pos(700)).await);
        let ev = t
            .evolve(&orders(), "ALTER TABLE orders DROP COLUMN b", &pos(700))
            .await
            .unwrap()
            .unwrap();
        assert!(ev.resolved);
        assert_eq!(t.column_names(&orders()).await.unwrap(), vec!["id", "a"]);
        assert_eq!(t.stats().unsupported, 1);
    }

    #[test]
    fn test_diff_not_null_to_null_is_widen() {
        let old = vec![ColumnDef::new("a", SqlType::parse("int").unwrap()).not_null()];
        let new = vec![ColumnDef::new("a", SqlType::parse("int").unwrap())];
        let diff = SchemaDiff::compute(&old, &new, &[]);
        assert!(matches!(diff.changes[..], [ColumnChange::Widen { .. }]));

        let diff = SchemaDiff::compute(&new, &old, &[]);
        assert!(matches!(diff.changes[..], [ColumnChange::Narrow { .. }]));
    }
}
