//! # mysql-pg-migrate
//!
//! Resumable MySQL/MariaDB to PostgreSQL migration library.
//!
//! Each selected table moves through four recorded stages: schema creation,
//! a chunked parallel data load, deferred index creation and constraint
//! application. Progress lives in a durable state log and chunk pool (tables
//! on the target or a signed JSON state file), so an interrupted run resumes
//! without re-copying finished chunks.
//!
//! - **Type mapping** from MySQL declarations to PostgreSQL types, extendable
//!   with a YAML map
//! - **Chunked transfers** with leases, heartbeats and bounded retries
//! - **COPY loading** into PostgreSQL with per-chunk transactions
//! - **Deferred DDL** so indexes and foreign keys are built after the data
//!
//! ## Example
//!
//! ```rust,no_run
//! use mysql_pg_migrate::{Config, MigrationContext};
//!
//! #[tokio::main]
//! async fn main() -> mysql_pg_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let context = MigrationContext::connect(config, None, false).await?;
//!     let result = context.run().await?;
//!     println!("Migrated {} rows", result.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod schema;
pub mod state;
pub mod structure;
pub mod transfer;
pub mod typemap;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use core::{Batch, SourceReader, SqlValue, TargetWriter};
pub use error::{MigrateError, Result};
pub use orchestrator::{
    dry_run, health_check, status, DryRunReport, HealthCheckResult, MigrationContext,
    MigrationResult, StatusReport, Stores, TableOutcome, ValidationReport,
};
pub use pool::{WorkChunk, WorkPool};
pub use state::{Stage, StateTracker, TableStatus};
pub use typemap::TypeMap;
