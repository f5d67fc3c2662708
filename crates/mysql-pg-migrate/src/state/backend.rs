//! State backend trait for migration state storage.
//!
//! The [`StateBackend`] trait defines the interface for persisting stage
//! records and run history. Implementations:
//!
//! - **PostgreSQL**: [`super::PgStateBackend`], tables in the state schema on the target
//! - **File**: [`super::FileStore`], a signed JSON document (`--state-file`)
//! - **Memory**: [`super::MemoryStateBackend`], for dry runs and tests
//!
//! The orchestrator works with `Arc<dyn StateBackend>` without knowing the
//! concrete type.

use async_trait::async_trait;

use super::{RunInfo, StateRecord};
use crate::error::Result;

/// Trait for migration state persistence backends.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
///
/// # Example
///
/// ```rust,ignore
/// let backend: Arc<dyn StateBackend> = Arc::new(PgStateBackend::new(pool, "_mysql_pg_migrate")?);
/// backend.init_schema().await?;
/// backend.save_record(&StateRecord::new("users")).await?;
/// let records = backend.load_records().await?;
/// ```
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Initialize the state storage.
    ///
    /// This should be idempotent - safe to call multiple times.
    async fn init_schema(&self) -> Result<()>;

    /// Every stored table record.
    async fn load_records(&self) -> Result<Vec<StateRecord>>;

    /// Upsert one table record. Must be durable when it returns.
    async fn save_record(&self, record: &StateRecord) -> Result<()>;

    /// Remove every table record.
    async fn delete_all(&self) -> Result<()>;

    /// Upsert a run entry.
    async fn save_run(&self, run: &RunInfo) -> Result<()>;

    /// The most recently started run.
    async fn load_latest_run(&self) -> Result<Option<RunInfo>>;

    /// Get the backend type name for logging.
    fn backend_type(&self) -> &'static str;
}
