//! Destination boundary
//!
//! A [`Destination`] applies labeled batches and follows compatible schema
//! changes. Implementations:
//!
//! - [`DorisDestination`] - Doris Stream Load over HTTP
//! - [`MemoryDestination`] - in-memory warehouse for tests and dry runs

mod doris;
mod memory;

pub use doris::{doris_type, DorisConfig, DorisDestination, StreamLoadResponse};
pub use memory::{DestinationOp, MemoryDestination};

use crate::error::ConnectorResult;
use crate::loader::LoadBatch;
use crate::types::DestinationTable;
use async_trait::async_trait;
use binlake_cdc::ColumnChange;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Whether a load changed the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Applied,
    /// The label was loaded before; nothing changed
    AlreadyApplied,
}

/// A row the destination filtered out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRejection {
    /// Row index in the batch, when known
    pub row: Option<usize>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOutcome {
    pub status: LoadStatus,
    pub rows_loaded: u64,
    pub rows_filtered: u64,
    #[serde(default)]
    pub rejections: Vec<RowRejection>,
}

impl LoadOutcome {
    pub fn applied(rows_loaded: u64) -> Self {
        Self {
            status: LoadStatus::Applied,
            rows_loaded,
            rows_filtered: 0,
            rejections: Vec::new(),
        }
    }

    pub fn already_applied() -> Self {
        Self {
            status: LoadStatus::AlreadyApplied,
            rows_loaded: 0,
            rows_filtered: 0,
            rejections: Vec::new(),
        }
    }
}

/// What a destination guarantees about loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationCapabilities {
    /// A batch is applied entirely or not at all
    pub atomic_batches: bool,
    /// Repeating a label is a no-op
    pub label_dedup: bool,
    /// Upper bound on rows per batch when loads are not atomic
    pub max_batch_rows: Option<usize>,
}

impl Default for DestinationCapabilities {
    fn default() -> Self {
        Self {
            atomic_batches: true,
            label_dedup: true,
            max_batch_rows: None,
        }
    }
}

#[async_trait]
pub trait Destination: Send + Sync {
    /// Apply `batch`. Repeating a label must not apply it twice.
    async fn load(&self, batch: &LoadBatch) -> ConnectorResult<LoadOutcome>;

    /// Mirror compatible column changes on `table`.
    async fn alter_table(
        &self,
        table: &DestinationTable,
        changes: &[ColumnChange],
    ) -> ConnectorResult<()>;

    fn capabilities(&self) -> DestinationCapabilities {
        DestinationCapabilities::default()
    }
}

/// Shared destination.
pub type SharedDestination = Arc<dyn Destination>;
