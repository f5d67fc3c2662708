//! Tagged row values crossing the MySQL → PostgreSQL boundary.
//!
//! The source reader produces values tagged with what MySQL returned; the
//! per-column caster in [`crate::transfer::cast`] rewrites each one into the
//! tag the resolved PostgreSQL type expects before the COPY encoder sees it.

use std::borrow::Cow;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::core::schema::KeyValue;

/// Type hint carried by NULL values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    U64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    Date,
    Time,
}

/// SQL value with zero-copy text and binary payloads.
///
/// # Example
///
/// ```rust
/// use std::borrow::Cow;
/// use mysql_pg_migrate::core::SqlValue;
///
/// let borrowed: SqlValue<'_> = SqlValue::Text(Cow::Borrowed("hello"));
/// let owned: SqlValue<'static> = borrowed.into_owned();
/// assert!(!owned.is_null());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue<'a> {
    /// NULL with type hint.
    Null(SqlNullType),
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    /// Unsigned integers read from `... unsigned` columns and `BIT(n)`.
    U64(u64),
    F32(f32),
    F64(f64),
    Text(Cow<'a, str>),
    Bytes(Cow<'a, [u8]>),
    Uuid(Uuid),
    Decimal(Decimal),
    /// Timestamp without timezone.
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl<'a> SqlValue<'a> {
    /// Convert to a fully owned value with `'static` lifetime.
    #[must_use]
    pub fn into_owned(self) -> SqlValue<'static> {
        match self {
            SqlValue::Null(t) => SqlValue::Null(t),
            SqlValue::Bool(v) => SqlValue::Bool(v),
            SqlValue::I16(v) => SqlValue::I16(v),
            SqlValue::I32(v) => SqlValue::I32(v),
            SqlValue::I64(v) => SqlValue::I64(v),
            SqlValue::U64(v) => SqlValue::U64(v),
            SqlValue::F32(v) => SqlValue::F32(v),
            SqlValue::F64(v) => SqlValue::F64(v),
            SqlValue::Text(v) => SqlValue::Text(Cow::Owned(v.into_owned())),
            SqlValue::Bytes(v) => SqlValue::Bytes(Cow::Owned(v.into_owned())),
            SqlValue::Uuid(v) => SqlValue::Uuid(v),
            SqlValue::Decimal(v) => SqlValue::Decimal(v),
            SqlValue::DateTime(v) => SqlValue::DateTime(v),
            SqlValue::Date(v) => SqlValue::Date(v),
            SqlValue::Time(v) => SqlValue::Time(v),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Type hint for this value.
    #[must_use]
    pub fn null_type(&self) -> SqlNullType {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => SqlNullType::Bool,
            SqlValue::I16(_) => SqlNullType::I16,
            SqlValue::I32(_) => SqlNullType::I32,
            SqlValue::I64(_) => SqlNullType::I64,
            SqlValue::U64(_) => SqlNullType::U64,
            SqlValue::F32(_) => SqlNullType::F32,
            SqlValue::F64(_) => SqlNullType::F64,
            SqlValue::Text(_) => SqlNullType::String,
            SqlValue::Bytes(_) => SqlNullType::Bytes,
            SqlValue::Uuid(_) => SqlNullType::Uuid,
            SqlValue::Decimal(_) => SqlNullType::Decimal,
            SqlValue::DateTime(_) => SqlNullType::DateTime,
            SqlValue::Date(_) => SqlNullType::Date,
            SqlValue::Time(_) => SqlNullType::Time,
        }
    }

    /// Short tag name for error messages.
    pub fn kind(&self) -> &'static str {
        match self.null_type() {
            SqlNullType::Bool => "bool",
            SqlNullType::I16 | SqlNullType::I32 | SqlNullType::I64 => "integer",
            SqlNullType::U64 => "unsigned integer",
            SqlNullType::F32 | SqlNullType::F64 => "float",
            SqlNullType::String => "text",
            SqlNullType::Bytes => "binary",
            SqlNullType::Uuid => "uuid",
            SqlNullType::Decimal => "decimal",
            SqlNullType::DateTime => "timestamp",
            SqlNullType::Date => "date",
            SqlNullType::Time => "time",
        }
    }

    /// Interpret the value as a chunking key.
    pub fn as_key(&self) -> Option<KeyValue> {
        match self {
            SqlValue::I16(v) => Some(KeyValue::Int(*v as i64)),
            SqlValue::I32(v) => Some(KeyValue::Int(*v as i64)),
            SqlValue::I64(v) => Some(KeyValue::Int(*v)),
            SqlValue::U64(v) => i64::try_from(*v).ok().map(KeyValue::Int),
            SqlValue::Text(s) => Some(KeyValue::Text(s.to_string())),
            _ => None,
        }
    }
}

impl<'a> SqlValue<'a> {
    /// Create a text value from an owned String.
    #[must_use]
    pub fn text_owned(s: String) -> SqlValue<'static> {
        SqlValue::Text(Cow::Owned(s))
    }

    /// Create a bytes value from an owned Vec<u8>.
    #[must_use]
    pub fn bytes_owned(b: Vec<u8>) -> SqlValue<'static> {
        SqlValue::Bytes(Cow::Owned(b))
    }
}

impl From<bool> for SqlValue<'static> {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue<'static> {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue<'static> {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue<'static> {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<String> for SqlValue<'static> {
    fn from(v: String) -> Self {
        SqlValue::Text(Cow::Owned(v))
    }
}

impl<'a> From<&'a str> for SqlValue<'a> {
    fn from(v: &'a str) -> Self {
        SqlValue::Text(Cow::Borrowed(v))
    }
}

impl From<Vec<u8>> for SqlValue<'static> {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(Cow::Owned(v))
    }
}

impl From<NaiveDateTime> for SqlValue<'static> {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl From<NaiveDate> for SqlValue<'static> {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

/// A bounded slice of a chunk's rows.
#[derive(Debug, Default)]
pub struct Batch {
    /// Rows in select-list order.
    pub rows: Vec<Vec<SqlValue<'static>>>,

    /// Chunking key of the last row, for keyset continuation.
    pub last_key: Option<KeyValue>,

    /// Whether this is the final batch of the chunk.
    pub is_last: bool,
}

impl Batch {
    pub fn new(rows: Vec<Vec<SqlValue<'static>>>) -> Self {
        Self {
            rows,
            last_key: None,
            is_last: false,
        }
    }

    pub fn with_last_key(mut self, key: KeyValue) -> Self {
        self.last_key = Some(key);
        self
    }

    pub fn mark_final(mut self) -> Self {
        self.is_last = true;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_value_into_owned() {
        let borrowed: SqlValue<'_> = SqlValue::Text(Cow::Borrowed("hello"));
        let owned: SqlValue<'static> = borrowed.into_owned();
        assert_eq!(owned, SqlValue::Text(Cow::Owned("hello".to_string())));
    }

    #[test]
    fn test_as_key() {
        assert_eq!(SqlValue::I32(7).as_key(), Some(KeyValue::Int(7)));
        assert_eq!(SqlValue::U64(u64::MAX).as_key(), None);
        assert_eq!(
            SqlValue::from("abc").as_key(),
            Some(KeyValue::Text("abc".into()))
        );
        assert_eq!(SqlValue::F64(1.5).as_key(), None);
    }

    #[test]
    fn test_batch_operations() {
        let batch = Batch::new(vec![
            vec![SqlValue::I32(1), SqlValue::text_owned("a".to_string())],
            vec![SqlValue::I32(2), SqlValue::text_owned("b".to_string())],
        ])
        .with_last_key(KeyValue::Int(2));

        assert_eq!(batch.len(), 2);
        assert!(!batch.is_last);
        assert_eq!(batch.last_key, Some(KeyValue::Int(2)));
        assert!(batch.mark_final().is_last);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(SqlValue::Null(SqlNullType::Date).kind(), "date");
        assert_eq!(SqlValue::I16(1).kind(), "integer");
    }
}
