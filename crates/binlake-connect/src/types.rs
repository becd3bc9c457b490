//! Shared types: secrets, destination table names and per-table status.

use binlake_cdc::TableId;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A string that must never show up in logs or config dumps.
///
/// ```
/// use binlake_connect::SensitiveString;
///
/// let secret = SensitiveString::new("doris-password");
/// assert_eq!(format!("{:?}", secret), "[REDACTED]");
/// assert_eq!(secret.expose_secret(), "doris-password");
/// ```
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Use only where the actual value is needed (authentication).
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Default for SensitiveString {
    fn default() -> Self {
        Self::new("")
    }
}

impl fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// Table in the warehouse that one source table loads into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationTable {
    pub database: String,
    pub table: String,
}

impl DestinationTable {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl From<&TableId> for DestinationTable {
    fn from(table: &TableId) -> Self {
        Self::new(&table.database, &table.table)
    }
}

impl fmt::Display for DestinationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

impl FromStr for DestinationTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, table)) if !db.is_empty() && !table.is_empty() && !table.contains('.') => {
                Ok(Self::new(db, table))
            }
            _ => Err(format!("expected <database>.<table>, got '{}'", s)),
        }
    }
}

/// How a table's worker ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableStatus {
    /// Caught up with the log when the source ended
    Streaming,
    /// Stopped on a schema change the destination cannot follow
    Paused { position: String, detail: String },
    /// Snapshot or load failed
    Failed { reason: String },
    /// Drained on shutdown
    Stopped,
}

impl TableStatus {
    /// Paused and failed tables need an operator.
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Paused { .. } | Self::Failed { .. })
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Streaming => f.write_str("streaming"),
            Self::Paused { position, detail } => write!(f, "paused at {}: {}", position, detail),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_string_redacted() {
        let secret = SensitiveString::new("my-secret-password");
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
        assert_eq!(format!("{}", secret), "[REDACTED]");
        let json = serde_json::to_string(&secret).unwrap();
        assert!(!json.contains("my-secret-password"));
    }

    #[test]
    fn test_sensitive_string_deserializes_value() {
        let secret: SensitiveString = serde_json::from_str("\"hunter2\"").unwrap();
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_destination_table_parse() {
        let t: DestinationTable = "dw.orders".parse().unwrap();
        assert_eq!(t, DestinationTable::new("dw", "orders"));
        assert!("orders".parse::<DestinationTable>().is_err());
        assert!("a.b.c".parse::<DestinationTable>().is_err());
    }
}
