//! Column default translation.
//!
//! MySQL reports defaults as raw text in `COLUMN_DEFAULT` (MariaDB quotes
//! string literals, MySQL does not). Only defaults with an obvious
//! PostgreSQL spelling are carried over; anything else is dropped with a
//! warning so the column still gets created.

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::core::identifier::pg_literal;
use super::cached_regex;
use crate::core::schema::ColumnDescriptor;

fn numeric_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$")
}

fn current_timestamp_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(
        &RE,
        r"(?i)^(current_timestamp|now|localtimestamp|localtime)(\s*\(\s*(\d*)\s*\))?$",
    )
}

fn bit_literal_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"(?i)^b'([01]*)'$")
}

/// Broad class of a resolved PostgreSQL type, enough to judge a default.
fn type_class(target_type: &str) -> &'static str {
    let t = target_type.to_lowercase();
    if t == "boolean" {
        "bool"
    } else if t.starts_with("bit") {
        "bit"
    } else if ["smallint", "integer", "bigint", "numeric", "real", "double precision"]
        .iter()
        .any(|p| t.starts_with(p))
    {
        "number"
    } else if t.starts_with("timestamp") || t == "date" || t.starts_with("time") {
        "temporal"
    } else if t == "bytea" {
        "binary"
    } else {
        "text"
    }
}

/// Translate a column default to a PostgreSQL expression, or `None` when
/// there is no default or it cannot be represented.
pub fn translate_default(table: &str, column: &ColumnDescriptor, target_type: &str) -> Option<String> {
    let raw = column.default.as_deref()?.trim();
    if raw.is_empty() && column.nullable {
        return None;
    }
    if raw.eq_ignore_ascii_case("null") {
        return None;
    }

    let class = type_class(target_type);
    let drop = |why: &str| {
        warn!(
            "{}.{}: dropping default {:?} ({})",
            table, column.name, raw, why
        );
        None
    };

    if let Some(caps) = current_timestamp_re().and_then(|re| re.captures(raw)) {
        if class != "temporal" {
            return drop("timestamp default on a non-temporal column");
        }
        let precision = caps.get(3).map(|m| m.as_str()).unwrap_or("");
        return Some(if precision.is_empty() {
            "CURRENT_TIMESTAMP".to_string()
        } else {
            format!("CURRENT_TIMESTAMP({})", precision)
        });
    }

    // MySQL 8 expression defaults are reported wrapped in parentheses.
    if raw.starts_with('(') && raw.ends_with(')') {
        return drop("expression default");
    }

    if let Some(caps) = bit_literal_re().and_then(|re| re.captures(raw)) {
        let bits = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        return match class {
            "bool" => Some(if bits.contains('1') { "TRUE" } else { "FALSE" }.to_string()),
            "bit" => Some(format!("B'{}'", bits)),
            "number" => u64::from_str_radix(bits, 2).ok().map(|v| v.to_string()),
            _ => drop("bit literal on a non-bit column"),
        };
    }

    let value = unquote_mariadb(raw);

    match class {
        "bool" => match value.as_str() {
            "0" => Some("FALSE".to_string()),
            "1" => Some("TRUE".to_string()),
            _ => drop("not a boolean literal"),
        },
        "number" => {
            if numeric_re().map(|re| re.is_match(&value)).unwrap_or(false) {
                Some(value)
            } else {
                drop("not a numeric literal")
            }
        }
        "temporal" => {
            if value.starts_with("0000-00-00") {
                drop("zero date")
            } else {
                Some(pg_literal(&value))
            }
        }
        "binary" => drop("binary default"),
        "bit" => drop("not a bit literal"),
        _ => Some(pg_literal(&value)),
    }
}

/// MariaDB reports string defaults as quoted literals; MySQL reports them raw.
fn unquote_mariadb(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        raw[1..raw.len() - 1].replace("''", "'").replace("\\\\", "\\")
    } else {
        raw.to_string()
    }
}
