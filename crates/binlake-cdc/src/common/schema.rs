//! Column model
//!
//! [`SqlType`] is the subset of MySQL's type system the pipeline has to
//! reason about: enough to decode row images, to decide whether a DDL change
//! is a widening, and to map columns to a destination type.

use crate::common::{CdcError, Result, TableId};
use serde::{Deserialize, Serialize};
use std::fmt;

const TINY_MAX: u64 = 255;
const TEXT_MAX: u64 = 65_535;
const MEDIUM_MAX: u64 = 16_777_215;
const LONG_MAX: u64 = 4_294_967_295;

/// MySQL column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SqlType {
    /// TINYINT (1), SMALLINT (2), MEDIUMINT (3), INT (4), BIGINT (8)
    Int { bytes: u8, unsigned: bool },
    Decimal { precision: u8, scale: u8 },
    Float,
    Double,
    Char { len: u32 },
    Varchar { len: u32 },
    /// TINYTEXT..LONGTEXT, by maximum byte length
    Text { max: u64 },
    Binary { len: u32 },
    Varbinary { len: u32 },
    Blob { max: u64 },
    Date,
    Time { fsp: u8 },
    DateTime { fsp: u8 },
    Timestamp { fsp: u8 },
    Year,
    Json,
    Enum { values: Vec<String> },
    Set { values: Vec<String> },
    Bit { bits: u16 },
    Other { text: String },
}

impl SqlType {
    /// Parse `information_schema.COLUMNS.COLUMN_TYPE` or DDL type text,
    /// e.g. `int(10) unsigned`, `decimal(12,2)`, `enum('a','b')`.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let lower = trimmed.to_ascii_lowercase();
        let name_end = lower
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(lower.len());
        let name = &lower[..name_end];
        if name.is_empty() {
            return Err(CdcError::schema(format!("empty column type in '{}'", text)));
        }

        let rest = trimmed[name_end..].trim_start();
        let (args, tail) = if rest.starts_with('(') {
            let close = matching_paren(rest)
                .ok_or_else(|| CdcError::schema(format!("unbalanced type arguments: {}", text)))?;
            (Some(&rest[1..close]), rest[close + 1..].to_ascii_lowercase())
        } else {
            (None, rest.to_ascii_lowercase())
        };
        let unsigned = tail.split_whitespace().any(|w| w == "unsigned");

        let nums = || -> Result<Vec<u64>> {
            match args {
                None => Ok(Vec::new()),
                Some(a) => a
                    .split(',')
                    .map(|p| {
                        p.trim().parse::<u64>().map_err(|_| {
                            CdcError::schema(format!("invalid type argument '{}' in {}", p, text))
                        })
                    })
                    .collect(),
            }
        };
        let first = |default: u64| -> Result<u64> { Ok(nums()?.first().copied().unwrap_or(default)) };
        let fsp = || -> Result<u8> { Ok(first(0)?.min(6) as u8) };

        let ty = match name {
            "bool" | "boolean" => SqlType::Int {
                bytes: 1,
                unsigned: false,
            },
            "tinyint" => SqlType::Int { bytes: 1, unsigned },
            "smallint" => SqlType::Int { bytes: 2, unsigned },
            "mediumint" => SqlType::Int { bytes: 3, unsigned },
            "int" | "integer" => SqlType::Int { bytes: 4, unsigned },
            "bigint" => SqlType::Int { bytes: 8, unsigned },
            "serial" => SqlType::Int {
                bytes: 8,
                unsigned: true,
            },
            "decimal" | "numeric" | "dec" | "fixed" => {
                let n = nums()?;
                let precision = n.first().copied().unwrap_or(10).min(65) as u8;
                let scale = n.get(1).copied().unwrap_or(0).min(30) as u8;
                SqlType::Decimal { precision, scale }
            }
            "float" => match nums()?.first() {
                Some(p) if *p > 24 => SqlType::Double,
                _ => SqlType::Float,
            },
            "double" | "real" => SqlType::Double,
            "char" => SqlType::Char {
                len: first(1)? as u32,
            },
            "varchar" => SqlType::Varchar {
                len: first(TEXT_MAX)? as u32,
            },
            "tinytext" => SqlType::Text { max: TINY_MAX },
            "text" => SqlType::Text {
                max: text_bucket(first(TEXT_MAX)?),
            },
            "mediumtext" => SqlType::Text { max: MEDIUM_MAX },
            "longtext" => SqlType::Text { max: LONG_MAX },
            "binary" => SqlType::Binary {
                len: first(1)? as u32,
            },
            "varbinary" => SqlType::Varbinary {
                len: first(TEXT_MAX)? as u32,
            },
            "tinyblob" => SqlType::Blob { max: TINY_MAX },
            "blob" => SqlType::Blob {
                max: text_bucket(first(TEXT_MAX)?),
            },
            "mediumblob" => SqlType::Blob { max: MEDIUM_MAX },
            "longblob" => SqlType::Blob { max: LONG_MAX },
            "date" => SqlType::Date,
            "time" => SqlType::Time { fsp: fsp()? },
            "datetime" => SqlType::DateTime { fsp: fsp()? },
            "timestamp" => SqlType::Timestamp { fsp: fsp()? },
            "year" => SqlType::Year,
            "json" => SqlType::Json,
            "enum" => SqlType::Enum {
                values: parse_value_list(args.unwrap_or_default())?,
            },
            "set" => SqlType::Set {
                values: parse_value_list(args.unwrap_or_default())?,
            },
            "bit" => SqlType::Bit {
                bits: first(1)?.clamp(1, 64) as u16,
            },
            _ => SqlType::Other {
                text: lower.clone(),
            },
        };
        Ok(ty)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, SqlType::Int { unsigned: true, .. })
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            SqlType::Binary { .. } | SqlType::Varbinary { .. } | SqlType::Blob { .. }
        )
    }

    /// Fractional seconds precision of a temporal type.
    pub fn fsp(&self) -> u8 {
        match self {
            SqlType::Time { fsp } | SqlType::DateTime { fsp } | SqlType::Timestamp { fsp } => *fsp,
            _ => 0,
        }
    }

    /// Decimal digits needed to hold every value of an integer type.
    fn integer_digits(&self) -> Option<u8> {
        match self {
            SqlType::Int { bytes, unsigned } => Some(match (bytes, unsigned) {
                (1, _) => 3,
                (2, _) => 5,
                (3, false) => 7,
                (3, true) => 8,
                (4, _) => 10,
                (_, false) => 19,
                (_, true) => 20,
            }),
            SqlType::Decimal { precision, scale } => Some(precision.saturating_sub(*scale)),
            _ => None,
        }
    }

    /// Maximum byte length for the string families.
    fn capacity(&self) -> Option<u64> {
        match self {
            SqlType::Char { len }
            | SqlType::Varchar { len }
            | SqlType::Binary { len }
            | SqlType::Varbinary { len } => Some(u64::from(*len)),
            SqlType::Text { max } | SqlType::Blob { max } => Some(*max),
            _ => None,
        }
    }

    /// True when every value of `self` is representable in `to` without
    /// loss, so a column can move from `self` to `to` in place.
    pub fn widens_to(&self, to: &SqlType) -> bool {
        use SqlType::*;

        if self == to {
            return true;
        }
        let cap_ok = || match (self.capacity(), to.capacity()) {
            (Some(a), Some(b)) => b >= a,
            _ => false,
        };

        match (self, to) {
            (
                Int {
                    bytes: a,
                    unsigned: ua,
                },
                Int {
                    bytes: b,
                    unsigned: ub,
                },
            ) => match (ua, ub) {
                (false, false) | (true, true) => b >= a,
                (true, false) => b > a,
                (false, true) => false,
            },
            (Int { .. }, Decimal { .. }) => {
                self.integer_digits().unwrap_or(u8::MAX) <= to.integer_digits().unwrap_or(0)
            }
            (
                Decimal { scale: sa, .. },
                Decimal { scale: sb, .. },
            ) => {
                sb >= sa
                    && self.integer_digits().unwrap_or(u8::MAX)
                        <= to.integer_digits().unwrap_or(0)
            }
            (Float, Double) => true,
            (Char { .. }, Char { .. } | Varchar { .. } | Text { .. }) => cap_ok(),
            (Varchar { .. }, Varchar { .. } | Text { .. }) => cap_ok(),
            (Text { .. }, Text { .. }) => cap_ok(),
            (Binary { .. }, Binary { .. } | Varbinary { .. } | Blob { .. }) => cap_ok(),
            (Varbinary { .. }, Varbinary { .. } | Blob { .. }) => cap_ok(),
            (Blob { .. }, Blob { .. }) => cap_ok(),
            (Time { fsp: a }, Time { fsp: b })
            | (DateTime { fsp: a }, DateTime { fsp: b })
            | (Timestamp { fsp: a }, Timestamp { fsp: b }) => b >= a,
            (Enum { values: a }, Enum { values: b }) | (Set { values: a }, Set { values: b }) => {
                b.len() >= a.len() && b.starts_with(a)
            }
            (Bit { bits: a }, Bit { bits: b }) => b >= a,
            _ => false,
        }
    }

    /// MySQL DDL spelling.
    pub fn to_sql(&self) -> String {
        match self {
            SqlType::Int { bytes, unsigned } => {
                let name = match bytes {
                    1 => "tinyint",
                    2 => "smallint",
                    3 => "mediumint",
                    4 => "int",
                    _ => "bigint",
                };
                if *unsigned {
                    format!("{} unsigned", name)
                } else {
                    name.to_string()
                }
            }
            SqlType::Decimal { precision, scale } => format!("decimal({},{})", precision, scale),
            SqlType::Float => "float".into(),
            SqlType::Double => "double".into(),
            SqlType::Char { len } => format!("char({})", len),
            SqlType::Varchar { len } => format!("varchar({})", len),
            SqlType::Text { max } => match *max {
                m if m <= TINY_MAX => "tinytext".into(),
                m if m <= TEXT_MAX => "text".into(),
                m if m <= MEDIUM_MAX => "mediumtext".into(),
                _ => "longtext".into(),
            },
            SqlType::Binary { len } => format!("binary({})", len),
            SqlType::Varbinary { len } => format!("varbinary({})", len),
            SqlType::Blob { max } => match *max {
                m if m <= TINY_MAX => "tinyblob".into(),
                m if m <= TEXT_MAX => "blob".into(),
                m if m <= MEDIUM_MAX => "mediumblob".into(),
                _ => "longblob".into(),
            },
            SqlType::Date => "date".into(),
            SqlType::Time { fsp } => with_fsp("time", *fsp),
            SqlType::DateTime { fsp } => with_fsp("datetime", *fsp),
            SqlType::Timestamp { fsp } => with_fsp("timestamp", *fsp),
            SqlType::Year => "year".into(),
            SqlType::Json => "json".into(),
            SqlType::Enum { values } => format!("enum({})", quote_values(values)),
            SqlType::Set { values } => format!("set({})", quote_values(values)),
            SqlType::Bit { bits } => format!("bit({})", bits),
            SqlType::Other { text } => text.clone(),
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

fn with_fsp(name: &str, fsp: u8) -> String {
    if fsp == 0 {
        name.to_string()
    } else {
        format!("{}({})", name, fsp)
    }
}

fn text_bucket(declared: u64) -> u64 {
    match declared {
        d if d <= TINY_MAX => TINY_MAX,
        d if d <= TEXT_MAX => TEXT_MAX,
        d if d <= MEDIUM_MAX => MEDIUM_MAX,
        _ => LONG_MAX,
    }
}

fn quote_values(values: &[String]) -> String {
    values
        .iter()
        .map(|v| format!("'{}'", v.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Index of the `)` closing the `(` at position 0, skipping quoted text.
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = s.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match quote {
            Some(q) if c == q => {
                if chars.peek().map(|(_, n)| *n) == Some(q) {
                    chars.next();
                } else {
                    quote = None;
                }
            }
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
    }
    None
}

/// `'a','b''c'` → `["a", "b'c"]`
fn parse_value_list(args: &str) -> Result<Vec<String>> {
    let mut values = Vec::new();
    let mut chars = args.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let Some(q) = chars.next() else {
            return Ok(values);
        };
        if q != '\'' && q != '"' {
            return Err(CdcError::schema(format!("unquoted value in list: {}", args)));
        }
        let mut value = String::new();
        loop {
            match chars.next() {
                Some(c) if c == q => {
                    if chars.peek() == Some(&q) {
                        chars.next();
                        value.push(q);
                    } else {
                        break;
                    }
                }
                Some('\\') => {
                    if let Some(c) = chars.next() {
                        value.push(c);
                    }
                }
                Some(c) => value.push(c),
                None => return Err(CdcError::schema(format!("unterminated value list: {}", args))),
            }
        }
        values.push(value);
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    /// Default expression as written in the DDL (`NULL` defaults are `None`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub primary_key: bool,
}

impl ColumnDef {
    /// Nullable column with no default.
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
            default: None,
            primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark as part of the primary key (implies NOT NULL).
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// A column that can be added without rewriting existing rows.
    pub fn is_backfillable(&self) -> bool {
        self.nullable || self.default.is_some()
    }
}

/// Column layout of a table at one point in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub table: TableId,
    /// Columns in ordinal order
    pub columns: Vec<ColumnDef>,
    pub version: u32,
}

impl SchemaVersion {
    pub fn new(table: TableId, columns: Vec<ColumnDef>) -> Self {
        Self {
            table,
            columns,
            version: 1,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Successor version with a new column list.
    pub fn next(&self, columns: Vec<ColumnDef>) -> Self {
        Self {
            table: self.table.clone(),
            columns,
            version: self.version + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> SqlType {
        SqlType::parse(s).unwrap()
    }

    #[test]
    fn test_parse_column_types() {
        assert_eq!(
            p("int(10) unsigned"),
            SqlType::Int {
                bytes: 4,
                unsigned: true
            }
        );
        assert_eq!(
            p("BIGINT"),
            SqlType::Int {
                bytes: 8,
                unsigned: false
            }
        );
        assert_eq!(
            p("decimal(12,2)"),
            SqlType::Decimal {
                precision: 12,
                scale: 2
            }
        );
        assert_eq!(p("varchar(64) CHARACTER SET utf8mb4"), SqlType::Varchar { len: 64 });
        assert_eq!(p("datetime(3)"), SqlType::DateTime { fsp: 3 });
        assert_eq!(p("timestamp"), SqlType::Timestamp { fsp: 0 });
        assert_eq!(p("float(53)"), SqlType::Double);
        assert_eq!(p("mediumtext"), SqlType::Text { max: MEDIUM_MAX });
        assert_eq!(
            p("enum('new','paid','it''s')"),
            SqlType::Enum {
                values: vec!["new".into(), "paid".into(), "it's".into()]
            }
        );
        assert_eq!(p("bit(5)"), SqlType::Bit { bits: 5 });
        assert_eq!(
            p("geometry"),
            SqlType::Other {
                text: "geometry".into()
            }
        );
        assert!(SqlType::parse("decimal(x,2)").is_err());
        assert!(SqlType::parse("varchar(10").is_err());
    }

    #[test]
    fn test_integer_widening() {
        assert!(p("int").widens_to(&p("bigint")));
        assert!(!p("bigint").widens_to(&p("int")));
        assert!(!p("int").widens_to(&p("int unsigned")));
        assert!(p("int unsigned").widens_to(&p("bigint")));
        assert!(!p("int unsigned").widens_to(&p("int")));
        assert!(p("int").widens_to(&p("decimal(12,2)")));
        assert!(!p("bigint").widens_to(&p("decimal(12,2)")));
    }

    #[test]
    fn test_decimal_and_string_widening() {
        assert!(p("decimal(10,2)").widens_to(&p("decimal(12,2)")));
        assert!(p("decimal(10,2)").widens_to(&p("decimal(11,3)")));
        assert!(!p("decimal(10,2)").widens_to(&p("decimal(10,3)")));
        assert!(!p("decimal(10,2)").widens_to(&p("decimal(12,1)")));
        assert!(p("float").widens_to(&p("double")));
        assert!(!p("double").widens_to(&p("float")));

        assert!(p("varchar(20)").widens_to(&p("varchar(40)")));
        assert!(!p("varchar(40)").widens_to(&p("varchar(20)")));
        assert!(p("char(10)").widens_to(&p("varchar(10)")));
        assert!(p("varchar(200)").widens_to(&p("text")));
        assert!(!p("text").widens_to(&p("varchar(65535)")));
        assert!(p("varbinary(8)").widens_to(&p("blob")));
    }

    #[test]
    fn test_temporal_and_enum_widening() {
        assert!(p("datetime").widens_to(&p("datetime(6)")));
        assert!(!p("datetime(6)").widens_to(&p("datetime(3)")));
        assert!(!p("datetime").widens_to(&p("timestamp")));
        assert!(p("enum('a','b')").widens_to(&p("enum('a','b','c')")));
        assert!(!p("enum('a','b')").widens_to(&p("enum('b','a','c')")));
    }

    #[test]
    fn test_to_sql_reparses() {
        for text in [
            "int unsigned",
            "decimal(18,4)",
            "varchar(255)",
            "datetime(6)",
            "set('x','y')",
            "longblob",
        ] {
            assert_eq!(p(&p(text).to_sql()), p(text), "{}", text);
        }
    }

    #[test]
    fn test_schema_version_helpers() {
        let v = SchemaVersion::new(
            TableId::new("shop", "orders"),
            vec![
                ColumnDef::new("id", p("bigint")).primary_key(),
                ColumnDef::new("note", p("varchar(20)")),
                ColumnDef::new("qty", p("int")).not_null().with_default("0"),
            ],
        );
        assert_eq!(v.key_columns(), vec!["id".to_string()]);
        assert_eq!(v.column_names(), vec!["id", "note", "qty"]);
        assert!(v.column("NOTE").is_some());
        assert!(v.column("qty").unwrap().is_backfillable());
        assert!(!v.column("id").unwrap().is_backfillable());
        assert_eq!(v.next(v.columns.clone()).version, 2);
    }
}
