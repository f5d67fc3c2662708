//! Identifier validation, quoting and literal escaping.
//!
//! Identifiers (schemas, tables, columns) cannot be bound as statement
//! parameters, so every generated statement goes through these helpers.
//! Values that end up inline in DDL (defaults, enum labels, comments) go
//! through [`pg_literal`].

use crate::error::{MigrateError, Result};

/// Maximum identifier length accepted from the source (MySQL allows 64).
const MAX_IDENTIFIER_LENGTH: usize = 64;

/// PostgreSQL silently truncates identifiers beyond this many bytes.
pub const PG_MAX_IDENTIFIER_BYTES: usize = 63;

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing NUL bytes and
/// identifiers longer than MySQL permits.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a MySQL identifier using backticks.
pub fn quote_mysql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// Qualify a PostgreSQL table name with schema.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Qualify a MySQL table name with its database.
pub fn qualify_mysql(database: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mysql(database)?, quote_mysql(table)?))
}

/// Render a PostgreSQL string literal.
///
/// Uses `E''` syntax only when a backslash is present so the common case
/// stays readable in emitted DDL.
pub fn pg_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// Shorten a generated identifier to fit PostgreSQL's limit.
///
/// Cuts on a character boundary; callers that need uniqueness append
/// their own suffix before calling this.
pub fn truncate_pg_identifier(name: &str) -> String {
    if name.len() <= PG_MAX_IDENTIFIER_BYTES {
        return name.to_string();
    }
    let mut end = PG_MAX_IDENTIFIER_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Validate a check constraint definition for injection patterns.
///
/// Check clauses come from `INFORMATION_SCHEMA.CHECK_CONSTRAINTS` and are
/// inlined into `ALTER TABLE`, so only single boolean expressions pass.
pub fn validate_check_constraint(definition: &str) -> Result<()> {
    if definition.contains(';') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Check constraint contains semicolon (possible injection): {:?}",
            definition
        )));
    }

    if definition.contains("--") || definition.contains("/*") || definition.contains("*/") {
        return Err(MigrateError::Config(format!(
            "SECURITY: Check constraint contains SQL comment markers (possible injection): {:?}",
            definition
        )));
    }

    let lower = definition.to_lowercase();
    let forbidden = ["select", "insert", "update", "delete", "drop", "grant", "copy"];
    if lower
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|word| forbidden.contains(&word))
    {
        return Err(MigrateError::Config(format!(
            "SECURITY: Check constraint contains a statement keyword (possible injection): {:?}",
            definition
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("column with spaces").is_ok());
        assert!(validate_identifier("日本語").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("table\0name").is_err());
        assert!(validate_identifier(&"a".repeat(65)).is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_quote_pg_escapes_double_quote() {
        assert_eq!(quote_pg("users").unwrap(), "\"users\"");
        assert_eq!(quote_pg("table\"name").unwrap(), "\"table\"\"name\"");
    }

    #[test]
    fn test_quote_mysql_escapes_backtick() {
        assert_eq!(quote_mysql("users").unwrap(), "`users`");
        assert_eq!(quote_mysql("table`name").unwrap(), "`table``name`");
        assert_eq!(
            quote_mysql("Robert`); DROP TABLE Students;--").unwrap(),
            "`Robert``); DROP TABLE Students;--`"
        );
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify_pg("public", "users").unwrap(), "\"public\".\"users\"");
        assert_eq!(qualify_mysql("shop", "users").unwrap(), "`shop`.`users`");
    }

    #[test]
    fn test_pg_literal() {
        assert_eq!(pg_literal("plain"), "'plain'");
        assert_eq!(pg_literal("it's"), "'it''s'");
        assert_eq!(pg_literal("C:\\tmp"), "E'C:\\\\tmp'");
    }

    #[test]
    fn test_truncate_pg_identifier() {
        let long = "x".repeat(80);
        assert_eq!(truncate_pg_identifier(&long).len(), 63);
        assert_eq!(truncate_pg_identifier("short"), "short");
        // 'é' is two bytes; the cut must not split it
        let accented = format!("{}é", "a".repeat(62));
        assert_eq!(truncate_pg_identifier(&accented), "a".repeat(62));
    }

    #[test]
    fn test_validate_check_constraint() {
        assert!(validate_check_constraint("(`price` > 0)").is_ok());
        assert!(validate_check_constraint("status in ('active','inactive')").is_ok());
        assert!(validate_check_constraint("1=1; DROP TABLE users").is_err());
        assert!(validate_check_constraint("1=1 -- comment").is_err());
        assert!(validate_check_constraint("(select 1) = 1").is_err());
        // column names containing keywords as substrings are fine
        assert!(validate_check_constraint("`updated_at` > `created_at`").is_ok());
    }
}
