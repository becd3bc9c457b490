//! Shared fixtures for pipeline tests: an in-memory binlog, snapshot source,
//! warehouse and checkpoint store wired into one [`Pipeline`].

#![allow(dead_code)]

use binlake_cdc::testing::{BinlogColumn, BinlogValue, MemoryBinlog, MemorySnapshotSource};
use binlake_cdc::{
    ColumnDef, LogPosition, MemoryCheckpointStore, RetryConfig, SchemaVersion, SnapshotConfig,
    SqlType, StreamConfig, TableId,
};
use binlake_connect::{
    BatchConfig, DestinationTable, MemoryDestination, Pipeline, PipelineConfig, PipelineReport,
    PipelineSource, StartupMode, TableMapping,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const FILE: &str = "mysql-bin.000001";

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn orders() -> TableId {
    TableId::new("shop", "orders")
}

pub fn customers() -> TableId {
    TableId::new("shop", "customers")
}

pub fn dest(table: &TableId) -> DestinationTable {
    DestinationTable::from(table)
}

/// `id INT PRIMARY KEY, note VARCHAR(40)`
pub fn schema(table: TableId) -> SchemaVersion {
    SchemaVersion::new(
        table,
        vec![
            ColumnDef::new("id", SqlType::parse("int").unwrap())
                .not_null()
                .primary_key(),
            ColumnDef::new("note", SqlType::parse("varchar(40)").unwrap()),
        ],
    )
}

pub fn columns() -> Vec<BinlogColumn> {
    vec![BinlogColumn::long(), BinlogColumn::varchar(160)]
}

pub fn row(id: i64, note: &str) -> Vec<BinlogValue> {
    vec![BinlogValue::Int(id), BinlogValue::text(note)]
}

pub fn json_row(id: i64, note: &str) -> Value {
    json!({"id": id, "note": note})
}

pub fn fast_retry(max_retries: i32) -> RetryConfig {
    RetryConfig::builder()
        .max_retries(max_retries)
        .retry_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(0.0)
        .build()
}

pub fn config(tables: &[TableId]) -> PipelineConfig {
    PipelineConfig::new(tables.iter().cloned().map(TableMapping::identity).collect())
        .with_batch(
            BatchConfig::builder()
                .max_events(100)
                .max_delay(Duration::from_millis(20))
                .label_prefix("test")
                .retry(fast_retry(3))
                .build(),
        )
        .with_snapshot(SnapshotConfig::builder().batch_size(4).retry(fast_retry(3)).build())
        .with_stream(StreamConfig::default().with_retry(fast_retry(3)))
        .with_queue_capacity(8)
}

/// Every collaborator of a pipeline, kept so tests can inspect them.
#[derive(Clone)]
pub struct Harness {
    pub binlog: MemoryBinlog,
    pub snapshot: MemorySnapshotSource,
    pub destination: MemoryDestination,
    pub checkpoints: Arc<MemoryCheckpointStore>,
}

impl Harness {
    pub fn new(watermark: LogPosition) -> Self {
        init_test_logging();
        Self {
            binlog: MemoryBinlog::new(),
            snapshot: MemorySnapshotSource::new(watermark),
            destination: MemoryDestination::new(),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        }
    }

    pub fn pipeline(&self, config: PipelineConfig) -> Pipeline {
        Pipeline::new(
            config,
            PipelineSource::new(Arc::new(self.binlog.clone()), Arc::new(self.snapshot.clone())),
            Arc::new(self.destination.clone()),
            self.checkpoints.clone(),
        )
    }

    /// Run until the binlog is drained.
    pub async fn run(&self, config: PipelineConfig) -> PipelineReport {
        tokio::time::timeout(
            Duration::from_secs(30),
            self.pipeline(config).run(CancellationToken::new()),
        )
        .await
        .expect("pipeline did not finish")
        .expect("pipeline failed to start")
    }

    /// Destination rows of `table` keyed by `id`.
    pub fn rows_by_id(&self, table: &TableId) -> BTreeMap<i64, Map<String, Value>> {
        self.destination
            .rows(&dest(table))
            .into_iter()
            .map(|r| (r["id"].as_i64().unwrap(), r))
            .collect()
    }
}

pub fn streaming(start: &LogPosition) -> StartupMode {
    StartupMode::Position(start.clone())
}
