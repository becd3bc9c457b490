//! Binlog positions
//!
//! A [`LogPosition`] names one row change inside the binlog. Rows events
//! cannot be replayed on their own (they need the TABLE_MAP events that
//! precede them inside the transaction), so the position is anchored at the
//! start of the enclosing transaction and refined by event and row index:
//!
//! ```text
//! mysql-bin.000003 : 4410      : 2     : 1
//! └── file ──────┘   └ txn ─┘    └ev┘    └row┘
//! ```
//!
//! Resuming at a position re-reads the transaction from its first event and
//! skips everything ordered before the position.

use crate::common::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Totally ordered coordinate in a MySQL binary log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    /// Binlog file name, e.g. `mysql-bin.000003`
    pub file: String,
    /// Byte offset of the first event of the enclosing transaction
    pub offset: u64,
    /// 1-based index of the event inside the transaction (0 = transaction start)
    #[serde(default)]
    pub event: u32,
    /// Row index inside a rows event
    #[serde(default)]
    pub row: u32,
}

impl LogPosition {
    /// Position at a transaction boundary.
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
            event: 0,
            row: 0,
        }
    }

    /// Fully qualified position of one row.
    pub fn at(file: impl Into<String>, offset: u64, event: u32, row: u32) -> Self {
        Self {
            file: file.into(),
            offset,
            event,
            row,
        }
    }

    /// Numeric suffix of the file name (`mysql-bin.000012` → 12).
    pub fn file_sequence(&self) -> u64 {
        self.file
            .rsplit_once('.')
            .and_then(|(_, suffix)| suffix.parse().ok())
            .unwrap_or(0)
    }

    /// Same transaction, rewound to its first event.
    pub fn transaction_start(&self) -> Self {
        Self::new(self.file.clone(), self.offset)
    }

    pub fn is_transaction_start(&self) -> bool {
        self.event == 0 && self.row == 0
    }

    /// Compact token safe for labels: `<seq>-<offset>-<event>-<row>`.
    pub fn compact(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.file_sequence(),
            self.offset,
            self.event,
            self.row
        )
    }
}

impl Ord for LogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file_sequence()
            .cmp(&other.file_sequence())
            .then_with(|| self.file.cmp(&other.file))
            .then_with(|| self.offset.cmp(&other.offset))
            .then_with(|| self.event.cmp(&other.event))
            .then_with(|| self.row.cmp(&other.row))
    }
}

impl PartialOrd for LogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_transaction_start() {
            write!(f, "{}:{}", self.file, self.offset)
        } else {
            write!(f, "{}:{}:{}:{}", self.file, self.offset, self.event, self.row)
        }
    }
}

impl FromStr for LogPosition {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let invalid = || CdcError::config(format!("invalid binlog position '{}'", s));

        let number = |text: &str| -> Result<u64> { text.parse::<u64>().map_err(|_| invalid()) };

        match parts.as_slice() {
            [file, offset] if !file.is_empty() => Ok(Self::new(*file, number(offset)?)),
            [file, offset, event, row] if !file.is_empty() => Ok(Self::at(
                *file,
                number(offset)?,
                u32::try_from(number(event)?).map_err(|_| invalid())?,
                u32::try_from(number(row)?).map_err(|_| invalid())?,
            )),
            _ => Err(invalid()),
        }
    }
}
