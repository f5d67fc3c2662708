//! Configuration validation.

use regex::Regex;

use super::Config;
use crate::core::identifier::validate_identifier;
use crate::error::{MigrateError, Result};

const SOURCE_SSL_MODES: &[&str] = &[
    "disabled",
    "preferred",
    "required",
    "verify-ca",
    "verify-identity",
];
const TARGET_SSL_MODES: &[&str] = &["disable", "prefer", "require", "verify-ca", "verify-full"];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }
    if config.source.r#type != "mysql" && config.source.r#type != "mariadb" {
        return Err(MigrateError::Config(format!(
            "source.type must be 'mysql', got '{}'",
            config.source.r#type
        )));
    }
    if !SOURCE_SSL_MODES.contains(&config.source.ssl_mode.as_str()) {
        return Err(MigrateError::Config(format!(
            "source.ssl_mode must be one of {}, got '{}'",
            SOURCE_SSL_MODES.join(", "),
            config.source.ssl_mode
        )));
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.r#type != "postgres" {
        return Err(MigrateError::Config(format!(
            "target.type must be 'postgres', got '{}'",
            config.target.r#type
        )));
    }
    if !TARGET_SSL_MODES.contains(&config.target.ssl_mode.as_str()) {
        return Err(MigrateError::Config(format!(
            "target.ssl_mode must be one of {}, got '{}'",
            TARGET_SSL_MODES.join(", "),
            config.target.ssl_mode
        )));
    }
    validate_identifier(&config.target.schema)
        .map_err(|e| MigrateError::Config(format!("target.schema: {}", e)))?;

    if config.source.host.eq_ignore_ascii_case(&config.target.host)
        && config.source.port == config.target.port
    {
        return Err(MigrateError::Config(format!(
            "source and target point at the same server ({}:{})",
            config.source.host, config.source.port
        )));
    }

    let m = &config.migration;

    // Migration config validation - only check if explicitly set
    if let Some(0) = m.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = m.max_workers_per_table {
        return Err(MigrateError::Config(
            "migration.max_workers_per_table must be at least 1".into(),
        ));
    }
    if let Some(0) = m.chunk_size {
        return Err(MigrateError::Config(
            "migration.chunk_size must be at least 1".into(),
        ));
    }
    if let Some(0) = m.chunk_size_bytes {
        return Err(MigrateError::Config(
            "migration.chunk_size_bytes must be at least 1".into(),
        ));
    }
    if let Some(0) = m.batch_size {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = m.read_ahead_batches {
        return Err(MigrateError::Config(
            "migration.read_ahead_batches must be at least 1".into(),
        ));
    }
    if m.lease_seconds == 0 {
        return Err(MigrateError::Config(
            "migration.lease_seconds must be at least 1".into(),
        ));
    }
    if let Some(0) = m.chunk_timeout_seconds {
        return Err(MigrateError::Config(
            "migration.chunk_timeout_seconds must be at least 1".into(),
        ));
    }
    for (key, value) in [
        ("migration.max_mysql_connections", m.max_mysql_connections),
        ("migration.max_pg_connections", m.max_pg_connections),
    ] {
        if value == Some(0) {
            return Err(MigrateError::Config(format!("{} must be at least 1", key)));
        }
    }

    validate_identifier(&m.state_schema)
        .map_err(|e| MigrateError::Config(format!("migration.state_schema: {}", e)))?;
    if m.state_schema == config.target.schema {
        return Err(MigrateError::Config(
            "migration.state_schema must differ from target.schema".into(),
        ));
    }

    for pattern in m.include_tables.iter().chain(&m.exclude_tables) {
        glob_to_regex(pattern)?;
    }
    for (from, to) in &m.rename_tables {
        validate_identifier(to).map_err(|e| {
            MigrateError::Config(format!("migration.rename_tables['{}']: {}", from, e))
        })?;
    }

    Ok(())
}

/// Compile a table glob (`*` any run, `?` one character) to an anchored,
/// case-insensitive regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    if pattern.is_empty() {
        return Err(MigrateError::Config("empty table pattern".into()));
    }

    let mut re = String::with_capacity(pattern.len() + 8);
    re.push_str("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');

    Regex::new(&re)
        .map_err(|e| MigrateError::Config(format!("invalid table pattern '{}': {}", pattern, e)))
}
