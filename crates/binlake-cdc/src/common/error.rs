//! Error types for CDC operations
//!
//! Every error knows whether another attempt can succeed
//! ([`CdcError::is_retriable`]) and has a stable code for metric labels.
//!
//! | Kind | Recovery |
//! |------|----------|
//! | [`DecodeError`] | `Incomplete` waits for more bytes; other kinds are structural |
//! | `ConnectionLost` | reconnect and resume from the last delivered position |
//! | `SnapshotFailure` | restart the table's snapshot from its first row |
//! | `UnsupportedSchemaChange` | table paused until an operator resolves it |

use crate::common::{LogPosition, TableId};
use thiserror::Error;

/// Failure to turn raw binlog bytes into an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The record is truncated; more input is needed.
    #[error("incomplete record: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    /// The bytes cannot be a valid record.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// CRC32 trailer does not match the record body.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum { stored: u32, computed: u32 },

    /// Rows event for a table id with no preceding TABLE_MAP.
    #[error("rows event references unknown table id {0}")]
    UnknownTable(u64),
}

impl DecodeError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// True when feeding more bytes can make the record decodable.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }
}

/// Errors of the capture side.
#[derive(Error, Debug)]
pub enum CdcError {
    /// Bytes that do not form an event
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Replication connection dropped
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Snapshot of a table could not complete
    #[error("Snapshot of {table} failed: {reason}")]
    SnapshotFailure { table: TableId, reason: String },

    /// DDL that cannot be applied to the destination automatically
    #[error("Unsupported schema change on {table} at {position}: {detail}")]
    UnsupportedSchemaChange {
        table: TableId,
        position: LogPosition,
        detail: String,
    },

    /// MySQL server or protocol error
    #[error("MySQL error: {0}")]
    MySql(String),

    /// Missing or inconsistent column layout
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation not valid in the current phase
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Other(String),
}

impl CdcError {
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    pub fn snapshot_failure(table: TableId, reason: impl Into<String>) -> Self {
        Self::SnapshotFailure {
            table,
            reason: reason.into(),
        }
    }

    pub fn unsupported_schema_change(
        table: TableId,
        position: LogPosition,
        detail: impl Into<String>,
    ) -> Self {
        Self::UnsupportedSchemaChange {
            table,
            position,
            detail: detail.into(),
        }
    }

    pub fn mysql(msg: impl Into<String>) -> Self {
        Self::MySql(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Transient failures: dropped connections, timeouts, deadlocks.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionLost(_) => true,
            Self::Timeout(_) => true,

            Self::MySql(msg) => {
                msg.contains("Lost connection")
                    || msg.contains("gone away")
                    || msg.contains("Deadlock")
                    || msg.contains("Lock wait timeout")
            }

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::BrokenPipe
                        | ErrorKind::UnexpectedEof
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::Decode(_)
            | Self::SnapshotFailure { .. }
            | Self::UnsupportedSchemaChange { .. }
            | Self::Schema(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::InvalidState(_)
            | Self::Other(_) => false,
        }
    }

    /// Stable label for metrics.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Decode(DecodeError::Incomplete { .. }) => "decode_incomplete",
            Self::Decode(_) => "decode_error",
            Self::ConnectionLost(_) => "connection_lost",
            Self::SnapshotFailure { .. } => "snapshot_failure",
            Self::UnsupportedSchemaChange { .. } => "unsupported_schema_change",
            Self::MySql(_) => "mysql_error",
            Self::Schema(_) => "schema_error",
            Self::Config(_) => "config_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::InvalidState(_) => "invalid_state",
            Self::Other(_) => "unknown",
        }
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> TableId {
        TableId::new("shop", "orders")
    }

    #[test]
    fn test_error_display_carries_context() {
        let err = CdcError::unsupported_schema_change(
            orders(),
            LogPosition::new("mysql-bin.000002", 1200),
            "drop column `note`",
        );
        let text = err.to_string();
        assert!(text.contains("shop.orders"));
        assert!(text.contains("mysql-bin.000002:1200"));
        assert!(text.contains("drop column"));

        let err = CdcError::snapshot_failure(orders(), "read view lost");
        assert!(err.to_string().contains("Snapshot of shop.orders failed"));
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(CdcError::connection_lost("reset by peer").is_retriable());
        assert!(CdcError::timeout("5s").is_retriable());
        assert!(CdcError::mysql("2013 Lost connection to MySQL server").is_retriable());
        assert!(CdcError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)).is_retriable());

        assert!(!CdcError::config("bad config").is_retriable());
        assert!(!CdcError::Decode(DecodeError::corrupt("bad header")).is_retriable());
        assert!(!CdcError::snapshot_failure(orders(), "x").is_retriable());
        assert!(!CdcError::mysql("1064 syntax error").is_retriable());
    }

    #[test]
    fn test_decode_error_incomplete() {
        let err = DecodeError::Incomplete {
            needed: 19,
            available: 7,
        };
        assert!(err.is_incomplete());
        assert!(!DecodeError::UnknownTable(9).is_incomplete());
        assert_eq!(CdcError::from(err).error_code(), "decode_incomplete");
    }
}
