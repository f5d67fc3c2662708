//! Per-column value casting from MySQL representations to PostgreSQL ones.
//!
//! The reader tags values by how MySQL returned them (integers, floats, text
//! for temporals/decimals/json, raw bytes). A [`RowCaster`] is built once per
//! table from the resolved target types and rewrites every value into the tag
//! the target column expects, failing with `Conversion` when a value cannot be
//! represented there.

use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::schema::TableDescriptor;
use crate::core::value::{Batch, SqlNullType, SqlValue};
use crate::error::{MigrateError, Result};
use crate::typemap::TypeMap;

/// Value shape required by a PostgreSQL column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Bool,
    Int16,
    Int32,
    Int64,
    Numeric,
    Float32,
    Float64,
    Text,
    Bytes,
    Date,
    Timestamp,
    Time,
    Json,
    Uuid,
    /// `bit varying(n)` / `bit(n)` with its width.
    Bits(u32),
}

impl TargetKind {
    /// Classify a resolved type expression such as `character varying(50)`.
    ///
    /// Types the caster does not know pass through as text.
    pub fn from_pg_type(pg_type: &str) -> Self {
        let lower = pg_type.trim().to_lowercase();
        let (base, args) = match lower.find('(') {
            Some(pos) => (lower[..pos].trim(), lower[pos + 1..].trim_end_matches(')').trim()),
            None => (lower.as_str(), ""),
        };
        // array types are text in COPY format
        if base.ends_with("[]") || lower.ends_with("[]") {
            return TargetKind::Text;
        }
        match base {
            "boolean" | "bool" => TargetKind::Bool,
            "smallint" | "int2" => TargetKind::Int16,
            "integer" | "int" | "int4" => TargetKind::Int32,
            "bigint" | "int8" => TargetKind::Int64,
            "numeric" | "decimal" => TargetKind::Numeric,
            "real" | "float4" => TargetKind::Float32,
            "double precision" | "float8" => TargetKind::Float64,
            "bytea" => TargetKind::Bytes,
            "date" => TargetKind::Date,
            "json" | "jsonb" => TargetKind::Json,
            "uuid" => TargetKind::Uuid,
            "bit" | "bit varying" | "varbit" => TargetKind::Bits(args.parse().unwrap_or(1)),
            b if b.starts_with("timestamp") => TargetKind::Timestamp,
            b if b.starts_with("time") => TargetKind::Time,
            _ => TargetKind::Text,
        }
    }

    fn null_type(&self) -> SqlNullType {
        match self {
            TargetKind::Bool => SqlNullType::Bool,
            TargetKind::Int16 => SqlNullType::I16,
            TargetKind::Int32 => SqlNullType::I32,
            TargetKind::Int64 => SqlNullType::I64,
            TargetKind::Numeric => SqlNullType::Decimal,
            TargetKind::Float32 => SqlNullType::F32,
            TargetKind::Float64 => SqlNullType::F64,
            TargetKind::Bytes => SqlNullType::Bytes,
            TargetKind::Date => SqlNullType::Date,
            TargetKind::Timestamp => SqlNullType::DateTime,
            TargetKind::Time => SqlNullType::Time,
            TargetKind::Uuid => SqlNullType::Uuid,
            TargetKind::Text | TargetKind::Json | TargetKind::Bits(_) => SqlNullType::String,
        }
    }
}

#[derive(Debug, Clone)]
struct ColumnCast {
    label: String,
    kind: TargetKind,
    nullable: bool,
}

/// Converts source rows of one table into target-typed rows.
#[derive(Debug, Clone)]
pub struct RowCaster {
    columns: Vec<ColumnCast>,
}

impl RowCaster {
    /// Build from the type map, resolving every column's target type.
    pub fn new(table: &TableDescriptor, type_map: &TypeMap) -> Result<Self> {
        let types = table
            .columns
            .iter()
            .map(|c| {
                type_map
                    .resolve(&c.source_type)
                    .map_err(|e| e.at_column(table.name(), &c.name))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::for_types(table, &types)
    }

    /// Build from already resolved target types, one per column in order.
    pub fn for_types(table: &TableDescriptor, pg_types: &[String]) -> Result<Self> {
        if pg_types.len() != table.columns.len() {
            return Err(MigrateError::schema_parse(
                table.name(),
                format!(
                    "{} target types for {} columns",
                    pg_types.len(),
                    table.columns.len()
                ),
            ));
        }
        let columns = table
            .columns
            .iter()
            .zip(pg_types)
            .map(|(col, ty)| ColumnCast {
                label: format!("{}.{}", table.name(), col.name),
                kind: TargetKind::from_pg_type(ty),
                nullable: col.nullable,
            })
            .collect();
        Ok(Self { columns })
    }

    pub fn kinds(&self) -> Vec<TargetKind> {
        self.columns.iter().map(|c| c.kind).collect()
    }

    /// Cast one row in place.
    pub fn cast_row(&self, row: Vec<SqlValue<'static>>) -> Result<Vec<SqlValue<'static>>> {
        if row.len() != self.columns.len() {
            let table = self
                .columns
                .first()
                .and_then(|c| c.label.split('.').next())
                .unwrap_or("?");
            return Err(MigrateError::conversion(
                table,
                format!("row has {} values, expected {}", row.len(), self.columns.len()),
            ));
        }
        row.into_iter()
            .zip(&self.columns)
            .map(|(value, col)| cast_value(value, col))
            .collect()
    }

    /// Cast every row of a batch, keeping its continuation key and final flag.
    pub fn cast_batch(&self, batch: Batch) -> Result<Batch> {
        let Batch {
            rows,
            last_key,
            is_last,
        } = batch;
        let rows = rows
            .into_iter()
            .map(|row| self.cast_row(row))
            .collect::<Result<Vec<_>>>()?;
        Ok(Batch {
            rows,
            last_key,
            is_last,
        })
    }
}

/// Cast a batch stream on a background task.
///
/// The first conversion error is forwarded and ends the stream. Dropping
/// the returned receiver stops the task, which drops `input` in turn.
pub fn cast_stream(
    caster: Arc<RowCaster>,
    mut input: mpsc::Receiver<Result<Batch>>,
    capacity: usize,
) -> mpsc::Receiver<Result<Batch>> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            let item = item.and_then(|batch| caster.cast_batch(batch));
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });
    rx
}

fn unrepresentable(col: &ColumnCast, value: &SqlValue<'_>, detail: impl std::fmt::Display) -> MigrateError {
    MigrateError::conversion(
        col.label.clone(),
        format!("{} value cannot be stored as {:?}: {}", value.kind(), col.kind, detail),
    )
}

fn cast_value(value: SqlValue<'static>, col: &ColumnCast) -> Result<SqlValue<'static>> {
    if value.is_null() {
        return Ok(SqlValue::Null(col.kind.null_type()));
    }
    match col.kind {
        TargetKind::Bool => to_bool(value, col),
        TargetKind::Int16 => to_int(value, col).and_then(|v| {
            i16::try_from(v)
                .map(SqlValue::I16)
                .map_err(|_| overflow(col, v, "smallint"))
        }),
        TargetKind::Int32 => to_int(value, col).and_then(|v| {
            i32::try_from(v)
                .map(SqlValue::I32)
                .map_err(|_| overflow(col, v, "integer"))
        }),
        TargetKind::Int64 => to_int(value, col).and_then(|v| {
            i64::try_from(v)
                .map(SqlValue::I64)
                .map_err(|_| overflow(col, v, "bigint"))
        }),
        TargetKind::Numeric => to_numeric(value, col),
        TargetKind::Float32 => to_float(value, col).map(|v| SqlValue::F32(v as f32)),
        TargetKind::Float64 => to_float(value, col).map(SqlValue::F64),
        TargetKind::Text => to_text(value, col),
        TargetKind::Bytes => match value {
            SqlValue::Bytes(b) => Ok(SqlValue::Bytes(b)),
            SqlValue::Text(s) => Ok(SqlValue::bytes_owned(s.into_owned().into_bytes())),
            other => Err(unrepresentable(col, &other, "expected binary data")),
        },
        TargetKind::Date => to_date(value, col),
        TargetKind::Timestamp => to_timestamp(value, col),
        TargetKind::Time => to_time(value, col),
        TargetKind::Json => {
            let text = to_text(value, col)?;
            if let SqlValue::Text(s) = &text {
                serde_json::from_str::<serde_json::Value>(s)
                    .map_err(|e| MigrateError::conversion(col.label.clone(), format!("invalid JSON: {}", e)))?;
            }
            Ok(text)
        }
        TargetKind::Uuid => match value {
            SqlValue::Uuid(u) => Ok(SqlValue::Uuid(u)),
            SqlValue::Text(s) => Uuid::parse_str(s.trim())
                .map(SqlValue::Uuid)
                .map_err(|e| MigrateError::conversion(col.label.clone(), format!("invalid UUID '{}': {}", s, e))),
            SqlValue::Bytes(b) => Uuid::from_slice(&b)
                .map(SqlValue::Uuid)
                .map_err(|e| MigrateError::conversion(col.label.clone(), format!("invalid UUID bytes: {}", e))),
            other => Err(unrepresentable(col, &other, "expected a UUID")),
        },
        TargetKind::Bits(width) => to_bits(value, col, width),
    }
}

fn overflow(col: &ColumnCast, v: i128, target: &str) -> MigrateError {
    MigrateError::conversion(col.label.clone(), format!("{} overflows {}", v, target))
}

/// Integer payload widened so unsigned bigint fits before range checks.
fn to_int(value: SqlValue<'static>, col: &ColumnCast) -> Result<i128> {
    match value {
        SqlValue::Bool(b) => Ok(b as i128),
        SqlValue::I16(v) => Ok(v as i128),
        SqlValue::I32(v) => Ok(v as i128),
        SqlValue::I64(v) => Ok(v as i128),
        SqlValue::U64(v) => Ok(v as i128),
        SqlValue::Text(s) => s
            .trim()
            .parse::<i128>()
            .map_err(|e| MigrateError::conversion(col.label.clone(), format!("'{}' is not an integer: {}", s, e))),
        SqlValue::Decimal(d) if d.fract().is_zero() => i128::from_str(&d.trunc().to_string())
            .map_err(|e| MigrateError::conversion(col.label.clone(), e.to_string())),
        other => Err(unrepresentable(col, &other, "expected an integer")),
    }
}

fn to_bool(value: SqlValue<'static>, col: &ColumnCast) -> Result<SqlValue<'static>> {
    match value {
        SqlValue::Bool(b) => Ok(SqlValue::Bool(b)),
        SqlValue::I16(v) => Ok(SqlValue::Bool(v != 0)),
        SqlValue::I32(v) => Ok(SqlValue::Bool(v != 0)),
        SqlValue::I64(v) => Ok(SqlValue::Bool(v != 0)),
        SqlValue::U64(v) => Ok(SqlValue::Bool(v != 0)),
        SqlValue::Text(s) => match s.trim().to_lowercase().as_str() {
            "1" | "t" | "true" | "y" | "yes" => Ok(SqlValue::Bool(true)),
            "0" | "f" | "false" | "n" | "no" => Ok(SqlValue::Bool(false)),
            _ => Err(MigrateError::conversion(col.label.clone(), format!("'{}' is not a boolean", s))),
        },
        SqlValue::Bytes(b) if b.len() == 1 => Ok(SqlValue::Bool(b[0] != 0)),
        other => Err(unrepresentable(col, &other, "expected a boolean")),
    }
}

fn to_numeric(value: SqlValue<'static>, col: &ColumnCast) -> Result<SqlValue<'static>> {
    match value {
        SqlValue::Decimal(d) => Ok(SqlValue::Decimal(d)),
        SqlValue::I16(v) => Ok(SqlValue::Decimal(Decimal::from(v))),
        SqlValue::I32(v) => Ok(SqlValue::Decimal(Decimal::from(v))),
        SqlValue::I64(v) => Ok(SqlValue::Decimal(Decimal::from(v))),
        SqlValue::U64(v) => Ok(SqlValue::Decimal(Decimal::from(v))),
        SqlValue::F32(v) => float_decimal(v as f64, col),
        SqlValue::F64(v) => float_decimal(v, col),
        SqlValue::Text(s) => {
            let trimmed = s.trim();
            if let Ok(d) = Decimal::from_str(trimmed) {
                return Ok(SqlValue::Decimal(d));
            }
            // MySQL DECIMAL allows 65 digits; PostgreSQL numeric takes the text as is.
            if is_numeric_literal(trimmed) {
                Ok(SqlValue::text_owned(trimmed.to_string()))
            } else {
                Err(MigrateError::conversion(col.label.clone(), format!("'{}' is not numeric", s)))
            }
        }
        other => Err(unrepresentable(col, &other, "expected a number")),
    }
}

fn float_decimal(v: f64, col: &ColumnCast) -> Result<SqlValue<'static>> {
    Decimal::try_from(v)
        .map(SqlValue::Decimal)
        .map_err(|e| MigrateError::conversion(col.label.clone(), format!("{} is not representable as numeric: {}", v, e)))
}

fn is_numeric_literal(s: &str) -> bool {
    let digits = s.strip_prefix(|c: char| c == '-' || c == '+').unwrap_or(s);
    let mut parts = digits.splitn(2, '.');
    let int_part = parts.next().unwrap_or("");
    let frac_part = parts.next().unwrap_or("");
    (!int_part.is_empty() || !frac_part.is_empty())
        && int_part.bytes().all(|b| b.is_ascii_digit())
        && frac_part.bytes().all(|b| b.is_ascii_digit())
}

fn to_float(value: SqlValue<'static>, col: &ColumnCast) -> Result<f64> {
    match value {
        SqlValue::F32(v) => Ok(v as f64),
        SqlValue::F64(v) => Ok(v),
        SqlValue::I16(v) => Ok(v as f64),
        SqlValue::I32(v) => Ok(v as f64),
        SqlValue::I64(v) => Ok(v as f64),
        SqlValue::U64(v) => Ok(v as f64),
        SqlValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| MigrateError::conversion(col.label.clone(), format!("'{}' is not a float: {}", s, e))),
        other => Err(unrepresentable(col, &other, "expected a number")),
    }
}

fn to_text(value: SqlValue<'static>, col: &ColumnCast) -> Result<SqlValue<'static>> {
    let text: Cow<'static, str> = match value {
        SqlValue::Text(s) => s,
        SqlValue::Bytes(b) => match String::from_utf8(b.into_owned()) {
            Ok(s) => Cow::Owned(s),
            Err(e) => {
                return Err(MigrateError::conversion(
                    col.label.clone(),
                    format!("binary value is not valid UTF-8: {}", e),
                ))
            }
        },
        SqlValue::Bool(b) => Cow::Borrowed(if b { "1" } else { "0" }),
        SqlValue::I16(v) => Cow::Owned(v.to_string()),
        SqlValue::I32(v) => Cow::Owned(v.to_string()),
        SqlValue::I64(v) => Cow::Owned(v.to_string()),
        SqlValue::U64(v) => Cow::Owned(v.to_string()),
        SqlValue::F32(v) => Cow::Owned(v.to_string()),
        SqlValue::F64(v) => Cow::Owned(v.to_string()),
        SqlValue::Uuid(u) => Cow::Owned(u.to_string()),
        SqlValue::Decimal(d) => Cow::Owned(d.to_string()),
        SqlValue::DateTime(v) => Cow::Owned(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        SqlValue::Date(v) => Cow::Owned(v.format("%Y-%m-%d").to_string()),
        SqlValue::Time(v) => Cow::Owned(v.format("%H:%M:%S%.f").to_string()),
        SqlValue::Null(_) => return Ok(SqlValue::Null(SqlNullType::String)),
    };
    if text.contains('\0') {
        return Err(MigrateError::conversion(
            col.label.clone(),
            "text contains a NUL character, which PostgreSQL cannot store",
        ));
    }
    Ok(SqlValue::Text(text))
}

/// MySQL zero dates (`0000-00-00`, or a zero month/day) have no PostgreSQL value.
fn is_zero_date(s: &str) -> bool {
    let date = s.get(..10).unwrap_or(s);
    let mut parts = date.split('-');
    let year = parts.next().unwrap_or("");
    let month = parts.next().unwrap_or("");
    let day = parts.next().unwrap_or("");
    year.trim_start_matches('0').is_empty()
        || month.trim_start_matches('0').is_empty()
        || day.trim_start_matches('0').is_empty()
}

fn zero_date(col: &ColumnCast, s: &str) -> Result<SqlValue<'static>> {
    if col.nullable {
        Ok(SqlValue::Null(col.kind.null_type()))
    } else {
        Err(MigrateError::conversion(
            col.label.clone(),
            format!("zero date '{}' in a NOT NULL column", s),
        ))
    }
}

fn to_date(value: SqlValue<'static>, col: &ColumnCast) -> Result<SqlValue<'static>> {
    match value {
        SqlValue::Date(d) => Ok(SqlValue::Date(d)),
        SqlValue::DateTime(dt) => Ok(SqlValue::Date(dt.date())),
        SqlValue::Text(s) => {
            let s = s.trim();
            if is_zero_date(s) {
                return zero_date(col, s);
            }
            NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d")
                .map(SqlValue::Date)
                .map_err(|e| MigrateError::conversion(col.label.clone(), format!("invalid date '{}': {}", s, e)))
        }
        other => Err(unrepresentable(col, &other, "expected a date")),
    }
}

fn to_timestamp(value: SqlValue<'static>, col: &ColumnCast) -> Result<SqlValue<'static>> {
    match value {
        SqlValue::DateTime(dt) => Ok(SqlValue::DateTime(dt)),
        SqlValue::Date(d) => Ok(SqlValue::DateTime(d.and_time(NaiveTime::MIN))),
        SqlValue::Text(s) => {
            let s = s.trim();
            if is_zero_date(s) {
                return zero_date(col, s);
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::MIN)))
                .map(SqlValue::DateTime)
                .map_err(|e| MigrateError::conversion(col.label.clone(), format!("invalid timestamp '{}': {}", s, e)))
        }
        other => Err(unrepresentable(col, &other, "expected a timestamp")),
    }
}

/// PostgreSQL `time` is a time of day; MySQL TIME intervals outside it are rejected.
fn to_time(value: SqlValue<'static>, col: &ColumnCast) -> Result<SqlValue<'static>> {
    match value {
        SqlValue::Time(t) => Ok(SqlValue::Time(t)),
        SqlValue::Text(s) => {
            let s = s.trim();
            NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                .map(SqlValue::Time)
                .map_err(|_| MigrateError::conversion(col.label.clone(), format!("time '{}' is outside 00:00:00..23:59:59", s)))
        }
        other => Err(unrepresentable(col, &other, "expected a time")),
    }
}

fn to_bits(value: SqlValue<'static>, col: &ColumnCast, width: u32) -> Result<SqlValue<'static>> {
    let width = width.clamp(1, 64);
    match value {
        SqlValue::U64(v) => {
            if width < 64 && v >> width != 0 {
                return Err(MigrateError::conversion(
                    col.label.clone(),
                    format!("{} does not fit in {} bits", v, width),
                ));
            }
            Ok(SqlValue::text_owned(format!("{:0w$b}", v, w = width as usize)))
        }
        SqlValue::I64(v) if v >= 0 => to_bits(SqlValue::U64(v as u64), col, width),
        SqlValue::Text(s) if !s.is_empty() && s.bytes().all(|b| b == b'0' || b == b'1') => Ok(SqlValue::Text(s)),
        other => Err(unrepresentable(col, &other, "expected a bit string")),
    }
}
