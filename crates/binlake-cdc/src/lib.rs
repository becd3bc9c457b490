//! # binlake-cdc - MySQL Change Data Capture
//!
//! Reads row-level changes from a MySQL binary log and exposes them as an
//! ordered, restartable stream of [`CdcEvent`]s.
//!
//! ## Features
//!
//! - `mysql` (default) - snapshot reads and metadata through `mysql_async`;
//!   the binlog client itself has no feature gate
//! - `testing` - binlog encoders and in-memory sources for tests
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────┐
//!  SHOW MASTER ─▶ │ SnapshotCoordinator  │── snapshot rows (position = watermark) ─┐
//!  STATUS + read  │ NotStarted → ... →   │                                          │
//!  view           │ Streaming            │                                          ▼
//!                 └──────────────────────┘                                ┌──────────────────┐
//!  binlog bytes ─▶ EventFramer ─▶ BinlogDecoder ─▶ ChangeStream ────────▶ │ per-table queues │
//!                                     │                  │                └──────────────────┘
//!                                     ▼                  ▼
//!                              TABLE_MAP cache     SchemaTracker (DDL → SchemaEvolution)
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! `CdcEvent`, `CdcOp`, `TableId`, `LogPosition`, `CdcError`.
//!
//! ### Tier 2: Pipeline Building Blocks (crate root)
//! `ChangeStream`, `SnapshotCoordinator`, `SchemaTracker`, checkpoints and retry.
//!
//! ### Tier 3: Advanced Types (`common` and `mysql` modules)
//! Decoder internals, protocol client, DDL parser.

pub mod common;

pub mod mysql;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// =============================================================================
// TIER 1: Core Types
// =============================================================================

pub use common::{CdcError, CdcEvent, CdcOp, DecodeError, LogPosition, Result, TableId};

// =============================================================================
// TIER 2: Pipeline Building Blocks
// =============================================================================

pub use common::{
    retry_with_backoff, ChangeStream, CheckpointBackend, CheckpointStore, ColumnChange, ColumnDef,
    HandoffFilter, LogConnector, LogReader, MemoryCheckpointStore, RetryConfig, SchemaDiff,
    SchemaEvolution, SchemaTracker, SchemaVersion, SnapshotConfig, SnapshotCoordinator,
    SnapshotPhase, SnapshotSource, SqlType, StreamConfig, TableCheckpoint,
};

pub use mysql::{MySqlConnector, MySqlSourceConfig, ServerTimeZone};

#[cfg(feature = "mysql")]
pub use mysql::MySqlSnapshotSource;
