//! Idempotent loader
//!
//! One [`TableLoader`] per destination table groups events into labeled
//! batches and submits them with a write-ahead record in the table's
//! checkpoint:
//!
//! ```text
//! events ──▶ buffer ──(size | timer | schema change)──▶ LoadBatch
//!                                                         │
//!            checkpoint.pending = {label, first, last} ◀──┤
//!                                                         ▼
//!                              Destination::load (same label on retry)
//!                                                         │
//!            checkpoint.committed = last, pending = ∅  ◀──┘
//! ```

mod batch;
mod worker;

pub use batch::{
    encode_json_lines, make_label, row_changes, LoadBatch, RowChange, RowOp, DELETE_SIGN,
    MAX_LABEL_LEN,
};
pub use worker::{LoaderStats, TableLoader, TableMessage, TableReport};

use binlake_cdc::RetryConfig;
use std::time::Duration;

/// Batching and submission settings.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush once this many events are buffered
    pub max_events: usize,
    /// Flush once the buffered row images reach this size
    pub max_bytes: usize,
    /// Flush a partial batch after this long
    pub max_delay: Duration,
    pub label_prefix: String,
    /// Budget for retriable load failures; the label is kept across attempts
    pub retry: RetryConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            max_bytes: 64 * 1024 * 1024,
            max_delay: Duration::from_secs(5),
            label_prefix: "binlake".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl BatchConfig {
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder::default()
    }

    /// `max_events`, capped by a destination that cannot load larger batches atomically.
    pub fn effective_max_events(&self, max_batch_rows: Option<usize>) -> usize {
        match max_batch_rows {
            Some(cap) => self.max_events.min(cap).max(1),
            None => self.max_events.max(1),
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    pub fn max_events(mut self, n: usize) -> Self {
        self.config.max_events = n;
        self
    }

    pub fn max_bytes(mut self, n: usize) -> Self {
        self.config.max_bytes = n;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn label_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.label_prefix = prefix.into();
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn build(self) -> BatchConfig {
        self.config
    }
}
