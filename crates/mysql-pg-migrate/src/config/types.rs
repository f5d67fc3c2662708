//! Configuration type definitions with auto-tuning based on system resources.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len().max(1),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database (MySQL/MariaDB).
    pub source: SourceConfig,

    /// Target database (PostgreSQL).
    pub target: TargetConfig,

    /// Migration behavior.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Source database (MySQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database type (always "mysql"; MariaDB uses the same protocol).
    #[serde(default = "default_mysql")]
    pub r#type: String,

    pub host: String,

    /// Port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Database to migrate. MySQL databases play the role of schemas.
    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// TLS mode: disabled, preferred, required, verify-ca, verify-identity.
    #[serde(default = "default_preferred")]
    pub ssl_mode: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            r#type: default_mysql(),
            host: String::new(),
            port: default_mysql_port(),
            database: String::new(),
            user: String::new(),
            password: String::new(),
            ssl_mode: default_preferred(),
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database type (always "postgres").
    #[serde(default = "default_postgres")]
    pub r#type: String,

    pub host: String,

    /// Port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: require).
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            r#type: default_postgres(),
            host: String::new(),
            port: default_pg_port(),
            database: String::new(),
            user: String::new(),
            password: String::new(),
            schema: default_public_schema(),
            ssl_mode: default_require(),
        }
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// How target identifiers are derived from source names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierCase {
    /// Fold to lower case so names need no quoting in PostgreSQL.
    #[default]
    Lower,
    /// Keep source spelling (names then require quoting).
    Preserve,
}

impl IdentifierCase {
    pub fn apply(&self, name: &str) -> String {
        match self {
            IdentifierCase::Lower => name.to_lowercase(),
            IdentifierCase::Preserve => name.to_string(),
        }
    }
}

/// How an operator type map file combines with the built-in map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeMapMode {
    /// Operator entries take precedence; built-in entries fill the rest.
    #[default]
    Merge,
    /// Only the operator file is used.
    Replace,
}

/// Migration behavior configuration.
/// Performance fields use Option<T> to distinguish "not set" (auto-tuned)
/// from "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Concurrent chunk workers. Auto-tuned from CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Cap on workers loading the same table at once. Unlimited if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers_per_table: Option<usize>,

    /// Target rows per chunk. Auto-tuned from RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    /// Optional byte budget per chunk, converted with the table's average row length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size_bytes: Option<u64>,

    /// Rows per streamed batch inside a chunk. Auto-tuned from RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Batches buffered between reader, caster and writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_ahead_batches: Option<usize>,

    /// Attempts beyond the first before a chunk is permanently failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Seconds a claimed chunk may stay in progress without a heartbeat.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    /// Base delay before a failed chunk is claimable again (doubles per retry).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Per-chunk timeout; a timeout counts as a transient failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_timeout_seconds: Option<u64>,

    /// Tables to include (glob patterns: `*`, `?`). Empty means all.
    #[serde(default)]
    pub include_tables: Vec<String>,

    /// Tables to exclude (glob patterns).
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Source table name -> target table name.
    #[serde(default)]
    pub rename_tables: BTreeMap<String, String>,

    #[serde(default)]
    pub identifier_case: IdentifierCase,

    /// YAML type map merged over (or replacing) the built-in map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_map_file: Option<PathBuf>,

    #[serde(default)]
    pub type_map_mode: TypeMapMode,

    /// Create primary keys, indexes and sequences after load (default: true).
    #[serde(default = "default_true")]
    pub create_indexes: bool,

    /// Create foreign keys after load (default: true).
    #[serde(default = "default_true")]
    pub create_foreign_keys: bool,

    /// Create check constraints after load (default: true).
    #[serde(default = "default_true")]
    pub create_check_constraints: bool,

    /// Copy table and column comments (default: true).
    #[serde(default = "default_true")]
    pub migrate_comments: bool,

    /// Translate views after all tables (default: true).
    #[serde(default = "default_true")]
    pub migrate_views: bool,

    /// Schema on the target holding the state log and work pool.
    #[serde(default = "default_state_schema")]
    pub state_schema: String,

    /// Maximum MySQL connections. Auto-tuned from workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mysql_connections: Option<usize>,

    /// Maximum PostgreSQL connections. Auto-tuned from workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pg_connections: Option<usize>,

    /// Seconds in-flight chunks get to finish after cancellation.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_workers_per_table: None,
            chunk_size: None,
            chunk_size_bytes: None,
            batch_size: None,
            read_ahead_batches: None,
            max_retries: default_max_retries(),
            lease_seconds: default_lease_seconds(),
            retry_backoff_ms: default_retry_backoff_ms(),
            chunk_timeout_seconds: None,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            rename_tables: BTreeMap::new(),
            identifier_case: IdentifierCase::default(),
            type_map_file: None,
            type_map_mode: TypeMapMode::default(),
            create_indexes: true,
            create_foreign_keys: true,
            create_check_constraints: true,
            migrate_comments: true,
            migrate_views: true,
            state_schema: default_state_schema(),
            max_mysql_connections: None,
            max_pg_connections: None,
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;
        let cores = resources.cpu_cores;

        // Workers: cores - 2, between 2 and 32
        let workers = *self
            .workers
            .get_or_insert_with(|| cores.saturating_sub(2).clamp(2, 32));

        // Chunk size: 50K rows + 25K per 8GB of RAM, capped at 200K
        let chunk_size = *self
            .chunk_size
            .get_or_insert_with(|| (50_000 + (ram_gb / 8.0) as usize * 25_000).clamp(50_000, 200_000));

        let batch_size = *self
            .batch_size
            .get_or_insert_with(|| ((ram_gb / 4.0) as usize * 2_500).clamp(5_000, 20_000));

        let read_ahead = *self
            .read_ahead_batches
            .get_or_insert_with(|| ((ram_gb / 8.0) as usize).clamp(2, 8));

        // One source and one target connection per worker, plus headroom for
        // the finaliser, state writes and the pool store.
        let mysql_conns = *self
            .max_mysql_connections
            .get_or_insert_with(|| (workers + 2).min(64));
        let pg_conns = *self
            .max_pg_connections
            .get_or_insert_with(|| (workers + 4).min(64));

        info!(
            "Auto-tuned config: workers={}, chunk_size={}, batch_size={}, read_ahead={}, \
             mysql_conns={}, pg_conns={}",
            workers, chunk_size, batch_size, read_ahead, mysql_conns, pg_conns,
        );

        self
    }

    // Effective values with fallbacks for configs that were not auto-tuned.

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(50_000)
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(5_000)
    }

    pub fn get_read_ahead_batches(&self) -> usize {
        self.read_ahead_batches.unwrap_or(4)
    }

    pub fn get_max_mysql_connections(&self) -> usize {
        self.max_mysql_connections
            .unwrap_or_else(|| self.get_workers() + 2)
    }

    pub fn get_max_pg_connections(&self) -> usize {
        self.max_pg_connections
            .unwrap_or_else(|| self.get_workers() + 4)
    }

    /// Rows per chunk for a table, honouring the optional byte budget.
    pub fn chunk_rows_for(&self, avg_row_length: i64) -> i64 {
        let rows = self.get_chunk_size() as i64;
        match self.chunk_size_bytes {
            Some(bytes) if avg_row_length > 0 => {
                let by_bytes = (bytes as i64 / avg_row_length).max(1);
                rows.min(by_bytes)
            }
            _ => rows,
        }
    }
}

// Default value functions for serde
fn default_mysql() -> String {
    "mysql".to_string()
}

fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_preferred() -> String {
    "preferred".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_lease_seconds() -> u64 {
    600
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_shutdown_grace() -> u64 {
    60
}

fn default_state_schema() -> String {
    "_mysql_pg_migrate".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tuning_respects_explicit_values() {
        let config = MigrationConfig {
            workers: Some(3),
            chunk_size: Some(100),
            ..Default::default()
        };
        let resources = SystemResources {
            total_memory_gb: 64.0,
            cpu_cores: 32,
        };
        let tuned = config.with_auto_tuning(&resources);
        assert_eq!(tuned.workers, Some(3));
        assert_eq!(tuned.chunk_size, Some(100));
        assert_eq!(tuned.max_mysql_connections, Some(5));
        assert_eq!(tuned.max_pg_connections, Some(7));
        assert!(tuned.batch_size.is_some());
    }

    #[test]
    fn test_auto_tuning_small_host() {
        let resources = SystemResources {
            total_memory_gb: 2.0,
            cpu_cores: 1,
        };
        let tuned = MigrationConfig::default().with_auto_tuning(&resources);
        assert_eq!(tuned.workers, Some(2));
        assert_eq!(tuned.chunk_size, Some(50_000));
    }

    #[test]
    fn test_chunk_rows_for_byte_budget() {
        let config = MigrationConfig {
            chunk_size: Some(10_000),
            chunk_size_bytes: Some(1_000_000),
            ..Default::default()
        };
        // 1MB / 500B = 2000 rows, smaller than the row target
        assert_eq!(config.chunk_rows_for(500), 2_000);
        // Unknown row length falls back to the row target
        assert_eq!(config.chunk_rows_for(0), 10_000);
        // Tiny rows: the row target wins
        assert_eq!(config.chunk_rows_for(10), 10_000);
    }

    #[test]
    fn test_identifier_case() {
        assert_eq!(IdentifierCase::Lower.apply("UserAccounts"), "useraccounts");
        assert_eq!(IdentifierCase::Preserve.apply("UserAccounts"), "UserAccounts");
    }
}
