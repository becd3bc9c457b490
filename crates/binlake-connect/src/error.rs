//! Error types for binlake-connect
//!
//! - [`ConnectorError`] - failures reported by a destination, classified for retry
//! - [`LoadError`] - a batch that could not be loaded within its retry budget
//! - [`ConnectError`] - pipeline runtime errors

use binlake_cdc::common::Retriable;
use binlake_cdc::{CdcError, LogPosition, TableId};
use thiserror::Error;

/// Result type alias for the pipeline runtime
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Result type alias for destination operations
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Main error type for the pipeline runtime
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source side failure
    #[error(transparent)]
    Cdc(#[from] CdcError),

    /// Destination failure outside of a batch load (alters, health checks)
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Batch gave up after its retry budget
    #[error(transparent)]
    Load(#[from] LoadError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl ConnectError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Errors that can occur in destination operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection to external system failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Authentication failed
    #[error("authentication error: {0}")]
    Auth(String),

    /// Timeout waiting for response
    #[error("timeout: {0}")]
    Timeout(String),

    /// Rows do not match the destination table
    #[error("schema error: {0}")]
    Schema(String),

    /// The destination refused the batch
    #[error("load rejected: {message}")]
    Rejected {
        message: String,
        /// Where the destination keeps per-row detail
        error_url: Option<String>,
    },

    /// Transient error that may succeed on retry
    #[error("transient error (retryable): {0}")]
    Transient(String),

    /// Fatal error that will not succeed on retry
    #[error("fatal error: {0}")]
    Fatal(String),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConnectorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Transient(_)
        )
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn rejected(msg: impl Into<String>, error_url: Option<String>) -> Self {
        Self::Rejected {
            message: msg.into(),
            error_url,
        }
    }
}

impl Retriable for ConnectorError {
    fn is_retriable(&self) -> bool {
        self.is_retryable()
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() || e.is_body() {
            Self::Connection(e.to_string())
        } else if e.is_decode() {
            Self::Transient(format!("unreadable response: {}", e))
        } else {
            Self::Fatal(e.to_string())
        }
    }
}

/// A batch the loader could not get applied.
///
/// Stops the table; other tables keep loading.
#[derive(Debug, Error)]
#[error("load of {table} failed after {attempts} attempt(s) (label {label}, {first}..{last}): {reason}")]
pub struct LoadError {
    pub table: TableId,
    pub label: String,
    pub first: LogPosition,
    pub last: LogPosition,
    pub attempts: u32,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ConnectorError::connection("reset").is_retryable());
        assert!(ConnectorError::Timeout("slow".into()).is_retryable());
        assert!(ConnectorError::transient("publish").is_retryable());
        assert!(!ConnectorError::fatal("bad").is_retryable());
        assert!(!ConnectorError::rejected("too many filtered rows", None).is_retryable());
        assert!(!ConnectorError::schema("unknown column").is_retryable());
    }

    #[test]
    fn test_load_error_names_label() {
        let err = LoadError {
            table: TableId::new("shop", "orders"),
            label: "binlake_shop_orders_1-4-0-0_1-90-3-0_0011223344556677".into(),
            first: LogPosition::new("mysql-bin.000001", 4),
            last: LogPosition::at("mysql-bin.000001", 90, 3, 0),
            attempts: 4,
            reason: "connection error: refused".into(),
        };
        let text = err.to_string();
        assert!(text.contains("shop.orders"));
        assert!(text.contains("binlake_shop_orders_1-4-0-0_1-90-3-0_0011223344556677"));
        assert!(text.contains("4 attempt(s)"));
    }
}
