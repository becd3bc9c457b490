//! MySQL binlog source
//!
//! - [`decoder`] - binlog event framing and row decoding
//! - [`convert`] - decoded values to JSON row images
//! - [`protocol`] - replication client (handshake, auth, dump)
//! - [`source`] - [`MySqlConnector`], the live [`LogConnector`](crate::LogConnector)
//! - `snapshot` - consistent snapshot reads through `mysql_async` (`mysql` feature)

pub mod convert;
pub mod decoder;
pub mod protocol;
pub mod source;

#[cfg(feature = "mysql")]
pub mod snapshot;

pub use convert::{row_to_json, value_to_json, ServerTimeZone};
pub use decoder::{BinlogDecoder, BinlogEvent, ColumnValue, EventFramer, EventType};
pub use source::{MySqlConnector, MySqlLogReader, MySqlSourceConfig};

#[cfg(feature = "mysql")]
pub use snapshot::{binlog_position, MySqlSnapshotSource};
