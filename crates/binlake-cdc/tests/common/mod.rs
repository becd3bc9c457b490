#![allow(dead_code)]

use binlake_cdc::testing::{BinlogColumn, BinlogValue};
use binlake_cdc::{ColumnDef, RetryConfig, SchemaVersion, SqlType, TableId};
use std::time::Duration;
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

pub fn orders_schema() -> SchemaVersion {
    SchemaVersion::new(
        orders(),
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

pub fn fast_retry() -> RetryConfig {
    RetryConfig::builder()
        .max_retries(3)
        .retry_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(0.0)
        .build()
}
