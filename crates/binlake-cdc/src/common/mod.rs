//! # Common CDC Types
//!
//! Source-agnostic building blocks of the change pipeline:
//!
//! - [`LogPosition`] - totally ordered binlog coordinate
//! - [`CdcEvent`] - row change or schema change
//! - [`SchemaVersion`] / [`SqlType`] - column model and widening rules
//! - [`SchemaTracker`] - DDL → diff → versioned schema
//! - [`SnapshotCoordinator`] - consistent snapshot and streaming handoff
//! - [`ChangeStream`] - ordered, reconnecting event stream
//! - [`CheckpointStore`] - durable per-table progress
//! - [`RetryConfig`] - exponential backoff for transient errors
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Common Module                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  LogPosition     ←─── file, txn offset, event, row          │
//! │  CdcEvent        ←─── insert/update/delete/schema change    │
//! │  SchemaTracker   ←─── DDL parsing, diff, version history    │
//! │  Snapshot        ←─── phases, watermark, handoff filter     │
//! │  ChangeStream    ←─── framer + decoder + reconnect          │
//! │  Checkpoint      ←─── committed position, pending batch     │
//! │  Resilience      ←─── retry config, backoff                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod checkpoint;
pub mod ddl;
mod error;
mod event;
mod position;
mod resilience;
mod schema;
mod schema_evolution;
mod snapshot;
mod stream;

pub use checkpoint::*;
pub use error::*;
pub use event::*;
pub use position::*;
pub use resilience::*;
pub use schema::*;
pub use schema_evolution::*;
pub use snapshot::*;
pub use stream::*;
