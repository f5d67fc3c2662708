//! `COPY ... FROM STDIN` text-format encoding.

use bytes::{BufMut, BytesMut};

use crate::core::value::SqlValue;

/// Append one row: tab-separated fields, newline-terminated.
pub fn encode_row(buf: &mut BytesMut, row: &[SqlValue<'_>]) {
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b'\t');
        }
        encode_value(buf, value);
    }
    buf.put_u8(b'\n');
}

fn encode_value(buf: &mut BytesMut, value: &SqlValue<'_>) {
    match value {
        SqlValue::Null(_) => buf.put_slice(b"\\N"),
        SqlValue::Bool(b) => buf.put_u8(if *b { b't' } else { b'f' }),
        SqlValue::I16(v) => buf.put_slice(v.to_string().as_bytes()),
        SqlValue::I32(v) => buf.put_slice(v.to_string().as_bytes()),
        SqlValue::I64(v) => buf.put_slice(v.to_string().as_bytes()),
        SqlValue::U64(v) => buf.put_slice(v.to_string().as_bytes()),
        SqlValue::F32(v) => buf.put_slice(float_text(*v as f64, v.to_string()).as_bytes()),
        SqlValue::F64(v) => buf.put_slice(float_text(*v, v.to_string()).as_bytes()),
        SqlValue::Text(s) => escape_copy_text(buf, s),
        // bytea hex input; the backslash itself is escaped for COPY
        SqlValue::Bytes(b) => {
            buf.put_slice(b"\\\\x");
            buf.put_slice(hex::encode(b.as_ref()).as_bytes());
        }
        SqlValue::Uuid(u) => buf.put_slice(u.to_string().as_bytes()),
        SqlValue::Decimal(d) => buf.put_slice(d.to_string().as_bytes()),
        SqlValue::DateTime(dt) => buf.put_slice(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string().as_bytes()),
        SqlValue::Date(d) => buf.put_slice(d.format("%Y-%m-%d").to_string().as_bytes()),
        SqlValue::Time(t) => buf.put_slice(t.format("%H:%M:%S%.f").to_string().as_bytes()),
    }
}

/// PostgreSQL spells non-finite floats `NaN`, `Infinity`, `-Infinity`.
fn float_text(v: f64, display: String) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        display
    }
}

/// Escape text for the COPY text format.
fn escape_copy_text(buf: &mut BytesMut, s: &str) {
    for c in s.chars() {
        match c {
            '\\' => buf.put_slice(b"\\\\"),
            '\t' => buf.put_slice(b"\\t"),
            '\n' => buf.put_slice(b"\\n"),
            '\r' => buf.put_slice(b"\\r"),
            _ => {
                let mut tmp = [0u8; 4];
                buf.put_slice(c.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::SqlNullType;
    use chrono::NaiveDate;

    fn encode(row: &[SqlValue<'_>]) -> String {
        let mut buf = BytesMut::new();
        encode_row(&mut buf, row);
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_encode_row() {
        let row = vec![
            SqlValue::I64(1),
            SqlValue::from("a\tb\\c\nd"),
            SqlValue::Null(SqlNullType::String),
            SqlValue::Bool(true),
        ];
        assert_eq!(encode(&row), "1\ta\\tb\\\\c\\nd\t\\N\tt\n");
    }

    #[test]
    fn test_encode_bytes_and_temporals() {
        let dt = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_micro_opt(13, 5, 9, 250_000)
            .unwrap();
        let row = vec![
            SqlValue::bytes_owned(vec![0xde, 0xad]),
            SqlValue::DateTime(dt),
            SqlValue::Date(dt.date()),
        ];
        assert_eq!(encode(&row), "\\\\xdead\t2024-02-29 13:05:09.250\t2024-02-29\n");
    }

    #[test]
    fn test_encode_special_floats() {
        let row = vec![
            SqlValue::F64(f64::NAN),
            SqlValue::F64(f64::NEG_INFINITY),
            SqlValue::F32(1.5),
        ];
        assert_eq!(encode(&row), "NaN\t-Infinity\t1.5\n");
    }

    #[test]
    fn test_unicode_passes_through() {
        assert_eq!(encode(&[SqlValue::from("héllo 🐘")]), "héllo 🐘\n");
    }
}
