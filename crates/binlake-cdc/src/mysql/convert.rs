//! Row image to JSON conversion
//!
//! TABLE_MAP carries types but no names or signedness, so conversion is
//! driven by the [`SchemaVersion`] the tracker holds for the table:
//!
//! | Column | JSON |
//! |--------|------|
//! | integer | number, reinterpreted as unsigned when the column is |
//! | DECIMAL | string with the exact canonical digits |
//! | DATE / DATETIME | `YYYY-MM-DD[ HH:MM:SS[.ffffff]]` |
//! | TIMESTAMP | same, rendered in the server time zone |
//! | TIME | `[-]HH:MM:SS[.ffffff]` |
//! | text / binary | UTF-8 string / base64 |
//! | ENUM / SET | labels |
//! | BIT | number |
//! | JSON | serialized document as a string |

use super::decoder::{ColumnValue, RowImage};
use crate::common::{CdcError, ColumnDef, Result, SchemaVersion, SqlType};
use base64::Engine;
use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Time zone TIMESTAMP columns are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ServerTimeZone {
    #[default]
    Utc,
    Fixed(FixedOffset),
    Named(Tz),
}

impl ServerTimeZone {
    /// `YYYY-MM-DD HH:MM:SS[.f]` for a UTC epoch instant.
    pub fn render(&self, seconds: i64, microsecond: u32, fsp: u8) -> String {
        let Some(utc) = DateTime::<Utc>::from_timestamp(seconds, microsecond * 1000) else {
            return ZERO_DATETIME.to_string();
        };
        let local = match self {
            ServerTimeZone::Utc => utc.naive_utc(),
            ServerTimeZone::Fixed(offset) => utc.with_timezone(offset).naive_local(),
            ServerTimeZone::Named(tz) => utc.with_timezone(tz).naive_local(),
        };
        let base = local.format("%Y-%m-%d %H:%M:%S").to_string();
        with_fraction(base, microsecond, fsp)
    }
}

impl FromStr for ServerTimeZone {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("utc") || s == "Z" {
            return Ok(ServerTimeZone::Utc);
        }
        if let Some(sign) = s.chars().next().filter(|c| *c == '+' || *c == '-') {
            let digits: String = s[1..].chars().filter(|c| *c != ':').collect();
            let (h, m) = match digits.len() {
                2 => (digits.as_str(), "00"),
                4 => digits.split_at(2),
                _ => return Err(CdcError::config(format!("invalid UTC offset '{}'", s))),
            };
            let secs = h
                .parse::<i32>()
                .ok()
                .zip(m.parse::<i32>().ok())
                .map(|(h, m)| h * 3600 + m * 60)
                .ok_or_else(|| CdcError::config(format!("invalid UTC offset '{}'", s)))?;
            let secs = if sign == '-' { -secs } else { secs };
            return FixedOffset::east_opt(secs)
                .map(ServerTimeZone::Fixed)
                .ok_or_else(|| CdcError::config(format!("UTC offset out of range '{}'", s)));
        }
        s.parse::<Tz>()
            .map(ServerTimeZone::Named)
            .map_err(|_| CdcError::config(format!("unknown time zone '{}'", s)))
    }
}

impl TryFrom<String> for ServerTimeZone {
    type Error = CdcError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ServerTimeZone> for String {
    fn from(tz: ServerTimeZone) -> Self {
        tz.to_string()
    }
}

impl fmt::Display for ServerTimeZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerTimeZone::Utc => write!(f, "UTC"),
            ServerTimeZone::Fixed(offset) => write!(f, "{}", offset),
            ServerTimeZone::Named(tz) => write!(f, "{}", tz.name()),
        }
    }
}

const ZERO_DATETIME: &str = "0000-00-00 00:00:00";

fn with_fraction(mut base: String, microsecond: u32, fsp: u8) -> String {
    if fsp > 0 {
        let digits = format!("{:06}", microsecond);
        base.push('.');
        base.push_str(&digits[..usize::from(fsp.min(6))]);
    }
    base
}

/// Convert a row image to a JSON object keyed by column name.
///
/// Columns absent from a minimal image are left out of the object.
pub fn row_to_json(schema: &SchemaVersion, image: &RowImage, tz: &ServerTimeZone) -> Result<Map<String, Value>> {
    if image.len() != schema.columns.len() {
        return Err(CdcError::schema(format!(
            "{} row has {} columns, schema version {} has {}",
            schema.table,
            image.len(),
            schema.version,
            schema.columns.len()
        )));
    }
    Ok(schema
        .columns
        .iter()
        .zip(image)
        .filter_map(|(column, value)| {
            value
                .as_ref()
                .map(|v| (column.name.clone(), value_to_json(v, column, tz)))
        })
        .collect())
}

/// Convert one decoded value using its column definition.
pub fn value_to_json(value: &ColumnValue, column: &ColumnDef, tz: &ServerTimeZone) -> Value {
    let fsp = column.sql_type.fsp();
    match value {
        ColumnValue::Null => Value::Null,
        ColumnValue::SignedInt(v) => match column.sql_type {
            SqlType::Int {
                bytes,
                unsigned: true,
            } => {
                let mask = if bytes >= 8 {
                    u64::MAX
                } else {
                    (1u64 << (u32::from(bytes) * 8)) - 1
                };
                Value::from(*v as u64 & mask)
            }
            _ => Value::from(*v),
        },
        ColumnValue::Float(v) => v
            .to_string()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ColumnValue::Double(v) => serde_json::Number::from_f64(*v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ColumnValue::Decimal(v) => Value::String(v.clone()),
        ColumnValue::Bytes(v) => {
            if column.sql_type.is_binary() {
                Value::String(base64::engine::general_purpose::STANDARD.encode(v))
            } else {
                Value::String(String::from_utf8_lossy(v).into_owned())
            }
        }
        ColumnValue::Date { year, month, day } => {
            Value::String(format!("{:04}-{:02}-{:02}", year, month, day))
        }
        ColumnValue::Time {
            negative,
            hours,
            minutes,
            seconds,
            microseconds,
        } => {
            let sign = if *negative { "-" } else { "" };
            let base = format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds);
            Value::String(with_fraction(base, *microseconds, fsp))
        }
        ColumnValue::DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
            microsecond,
        } => {
            let base = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            );
            Value::String(with_fraction(base, *microsecond, fsp))
        }
        ColumnValue::Timestamp {
            seconds,
            microsecond,
        } => {
            if *seconds == 0 && *microsecond == 0 {
                Value::String(with_fraction(ZERO_DATETIME.to_string(), 0, fsp))
            } else {
                Value::String(tz.render(i64::from(*seconds), *microsecond, fsp))
            }
        }
        ColumnValue::Year(v) => Value::from(*v),
        ColumnValue::Json(v) => Value::String(v.to_string()),
        ColumnValue::Enum(index) => match &column.sql_type {
            SqlType::Enum { values } => match *index {
                0 => Value::String(String::new()),
                i => values
                    .get(usize::from(i) - 1)
                    .map(|label| Value::String(label.clone()))
                    .unwrap_or(Value::from(i)),
            },
            _ => Value::from(*index),
        },
        ColumnValue::Set(bits) => match &column.sql_type {
            SqlType::Set { values } => Value::String(
                values
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i < 64 && bits & (1 << i) != 0)
                    .map(|(_, label)| label.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => Value::from(*bits),
        },
        ColumnValue::Bit(v) => Value::from(*v),
    }
}

/// Offset of a named zone at an instant, for diagnostics.
pub fn utc_offset_at(tz: &ServerTimeZone, seconds: i64) -> Option<FixedOffset> {
    let utc = DateTime::<Utc>::from_timestamp(seconds, 0)?;
    Some(match tz {
        ServerTimeZone::Utc => FixedOffset::east_opt(0)?,
        ServerTimeZone::Fixed(offset) => *offset,
        ServerTimeZone::Named(zone) => zone.offset_from_utc_datetime(&utc.naive_utc()).fix(),
    })
}
