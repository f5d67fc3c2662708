//! Error types for the migration library.

use thiserror::Error;

/// Process exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Process exit code for unreachable or refused database connections.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Process exit code for per-table transfer or DDL failures.
pub const EXIT_TRANSFER_ERROR: u8 = 3;
/// Process exit code for a broken work pool invariant.
pub const EXIT_POOL_ERROR: u8 = 4;
/// Process exit code when the run was cancelled.
pub const EXIT_CANCELLED: u8 = 5;
/// Process exit code for state log errors.
pub const EXIT_STATE_ERROR: u8 = 6;
/// Process exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A database server could not be reached.
    #[error("Connection error ({endpoint}): {message}")]
    Connection { endpoint: String, message: String },

    /// No type map entry (and no default) covers a declared column type.
    #[error("Unmapped source type '{source_type}'{location}")]
    UnmappedType {
        source_type: String,
        /// Empty, or " (column table.col)".
        location: String,
    },

    /// Source metadata could not be interpreted.
    #[error("Schema parse error for {table}: {message}")]
    SchemaParse { table: String, message: String },

    /// DDL execution failed on the target.
    #[error("Schema apply error for {table}: {message}")]
    SchemaApply { table: String, message: String },

    /// A chunk failed in a way that is worth retrying.
    #[error("Transient error in {table} chunk {chunk_id}: {message}")]
    ChunkTransient {
        table: String,
        chunk_id: i64,
        message: String,
    },

    /// A chunk failed permanently; the table stops loading.
    #[error("Fatal data error in {table}: {message}")]
    ChunkFatal { table: String, message: String },

    /// A value could not be represented in the target column type.
    #[error("Cannot convert value for column {column}: {message}")]
    Conversion { column: String, message: String },

    /// The work pool no longer covers a table's key domain exactly.
    #[error("Work pool consistency violated: {0}")]
    PoolConsistency(String),

    /// Filters, or unreadable table metadata, left nothing to migrate.
    #[error("No tables to migrate in {0}")]
    NoMigratableTables(String),

    /// Source database query error
    #[error("Source database error: {0}")]
    Source(#[from] sqlx::Error),

    /// Target database query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Target connection pool could not hand out a connection.
    #[error("Target pool error: {0}")]
    TargetPool(#[from] deadpool_postgres::PoolError),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// State log error
    #[error("State error: {0}")]
    State(String),

    /// Plan hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Use --force to resume anyway or `run` to start fresh.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Connection error for an endpoint.
    pub fn connection(endpoint: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MigrateError::Connection {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Create an UnmappedType error without column context.
    pub fn unmapped(source_type: impl Into<String>) -> Self {
        MigrateError::UnmappedType {
            source_type: source_type.into(),
            location: String::new(),
        }
    }

    /// Create a SchemaParse error.
    pub fn schema_parse(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::SchemaParse {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a SchemaApply error.
    pub fn schema_apply(table: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MigrateError::SchemaApply {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create a ChunkFatal error.
    pub fn chunk_fatal(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::ChunkFatal {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Conversion error.
    pub fn conversion(column: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Conversion {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Attach table/column context to an UnmappedType error; other errors pass through.
    pub fn at_column(self, table: &str, column: &str) -> Self {
        match self {
            MigrateError::UnmappedType { source_type, .. } => MigrateError::UnmappedType {
                source_type,
                location: format!(" (column {}.{})", table, column),
            },
            MigrateError::SchemaParse { message, .. } => MigrateError::SchemaParse {
                table: table.to_string(),
                message: format!("column {}: {}", column, message),
            },
            other => other,
        }
    }

    /// Whether a chunk that hit this error should be requeued for another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrateError::ChunkTransient { .. } | MigrateError::TargetPool(_) => true,
            MigrateError::Pool { .. } | MigrateError::Io(_) => true,
            MigrateError::Source(e) => is_transient_mysql(e),
            MigrateError::Target(e) => is_transient_postgres(e),
            _ => false,
        }
    }

    /// Errors that must stop the whole run rather than a single table.
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            MigrateError::Config(_)
                | MigrateError::Connection { .. }
                | MigrateError::PoolConsistency(_)
                | MigrateError::NoMigratableTables(_)
                | MigrateError::State(_)
                | MigrateError::ConfigChanged
                | MigrateError::Cancelled
        )
    }

    /// Map the error to a process exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_)
            | MigrateError::Yaml(_)
            | MigrateError::ConfigChanged
            | MigrateError::NoMigratableTables(_) => EXIT_CONFIG_ERROR,
            MigrateError::Connection { .. } | MigrateError::Pool { .. } => EXIT_CONNECTION_ERROR,
            MigrateError::PoolConsistency(_) => EXIT_POOL_ERROR,
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::State(_) | MigrateError::Json(_) => EXIT_STATE_ERROR,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            _ => EXIT_TRANSFER_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

fn is_transient_mysql(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        // 1205 lock wait timeout, 1213 deadlock, 2006/2013 server gone away
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
            .map(|e| matches!(e.number(), 1205 | 1213 | 2006 | 2013))
            .unwrap_or(false),
        _ => false,
    }
}

fn is_transient_postgres(err: &tokio_postgres::Error) -> bool {
    if err.is_closed() {
        return true;
    }
    match err.code() {
        Some(state) => {
            let code = state.code();
            code.starts_with("08")
                || code == "40001"
                || code == "40P01"
                || code == "57014"
                || code == "57P01"
                || code == "53300"
        }
        None => is_io_source(std::error::Error::source(err)),
    }
}

/// Without a SQLSTATE only an I/O failure is worth retrying; to/from-SQL
/// conversion errors also carry a source but are not transient.
fn is_io_source(source: Option<&(dyn std::error::Error + 'static)>) -> bool {
    source.is_some_and(|e| e.is::<std::io::Error>())
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_type_message_carries_column() {
        let err = MigrateError::unmapped("enum('a','b')").at_column("users", "kind");
        assert_eq!(
            err.to_string(),
            "Unmapped source type 'enum('a','b')' (column users.kind)"
        );
    }

    #[test]
    fn test_transient_classification() {
        let transient = MigrateError::ChunkTransient {
            table: "t".into(),
            chunk_id: 1,
            message: "reset".into(),
        };
        assert!(transient.is_transient());
        assert!(!MigrateError::conversion("c", "overflow").is_transient());
        assert!(!MigrateError::chunk_fatal("t", "boom").is_transient());
        assert!(MigrateError::Source(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn test_only_io_sources_are_transient_without_sqlstate() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let reset: &(dyn std::error::Error + 'static) = &reset;
        assert!(is_io_source(Some(reset)));

        let boxed: Box<dyn std::error::Error + Sync + Send> =
            "cannot convert between the Rust type `i32` and the Postgres type `int8`".into();
        let conversion: &(dyn std::error::Error + 'static) = boxed.as_ref();
        assert!(!is_io_source(Some(conversion)));
        assert!(!is_io_source(None));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(
            MigrateError::PoolConsistency("overlap".into()).exit_code(),
            EXIT_POOL_ERROR
        );
        assert_eq!(MigrateError::Cancelled.exit_code(), EXIT_CANCELLED);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(MigrateError::Io(io).exit_code(), EXIT_IO_ERROR);
    }

    #[test]
    fn test_global_errors() {
        assert!(MigrateError::PoolConsistency("gap".into()).is_global());
        assert!(!MigrateError::schema_apply("t", "boom").is_global());
    }
}
