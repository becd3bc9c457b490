//! binlake-connect - loads MySQL change streams into Apache Doris
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐     ┌──────────────────┐
//! │   binlake-cdc    │────▶│   TableLoader    │────▶│   Destination    │
//! │ snapshot + binlog│     │ one per table,   │     │ Doris Stream Load│
//! │                  │     │ labeled batches  │     │ or in-memory     │
//! └──────────────────┘     └──────────────────┘     └──────────────────┘
//!                                   │
//!                                   ▼
//!                          per-table checkpoints
//! ```
//!
//! # Library Usage
//!
//! ```rust,ignore
//! use binlake_connect::{MemoryDestination, Pipeline, PipelineConfig, PipelineSource, TableMapping};
//!
//! let config = PipelineConfig::new(vec![TableMapping::identity("shop.orders".parse()?)]);
//! let pipeline = Pipeline::new(config, source, Arc::new(MemoryDestination::new()), checkpoints);
//! let report = pipeline.run(shutdown).await?;
//! ```
//!
//! # CLI Usage (Binary)
//!
//! ```bash
//! # Snapshot then stream until Ctrl+C
//! binlake -c binlake.yaml
//!
//! # Validate configuration
//! binlake -c binlake.yaml validate
//!
//! # Accept a paused schema change after altering the warehouse by hand
//! binlake -c binlake.yaml resolve --table shop.orders --position mysql-bin.000004:1200:1:0
//! ```

pub mod config;
pub mod destination;
pub mod error;
pub mod loader;
pub mod pipeline;
pub mod types;

pub use config::BinlakeConfig;
pub use destination::{
    Destination, DestinationCapabilities, DorisConfig, DorisDestination, LoadOutcome, LoadStatus,
    MemoryDestination, SharedDestination,
};
pub use error::{ConnectError, ConnectorError, ConnectorResult, LoadError, Result};
pub use loader::{BatchConfig, LoadBatch, TableLoader, TableReport};
pub use pipeline::{
    Pipeline, PipelineConfig, PipelineReport, PipelineSource, StartupMode, TableMapping,
};
pub use types::{DestinationTable, SensitiveString, TableStatus};
