//! Reader and writer seams between the engine and the database drivers.
//!
//! The structure loader, work pool, scheduler and finaliser only see these
//! traits; `drivers::mysql` and `drivers::postgres` implement them for real
//! servers and the integration tests implement them in memory.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::schema::{KeyValue, TableDescriptor, ViewDescriptor};
use crate::core::value::Batch;
use crate::error::Result;
use crate::pool::{ChunkRange, WorkChunk};

/// Row count and key bounds of a table, used to lay out chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyStats {
    pub row_count: i64,
    pub min: Option<KeyValue>,
    pub max: Option<KeyValue>,
}

/// Source database operations.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Base tables in the configured source database, unfiltered.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Full metadata for one table.
    ///
    /// Target names are left equal to the source names and the chunk key is
    /// left as unordered row positions; the structure loader settles both.
    async fn describe_table(&self, table: &str) -> Result<TableDescriptor>;

    /// Views in the source database.
    async fn list_views(&self) -> Result<Vec<ViewDescriptor>>;

    /// Exact row count plus min/max of the chunk key column.
    async fn key_stats(&self, table: &TableDescriptor) -> Result<KeyStats>;

    /// Key values at every `step`-th row in key order, at most `count` of them.
    async fn sample_boundaries(
        &self,
        table: &TableDescriptor,
        step: i64,
        count: usize,
    ) -> Result<Vec<KeyValue>>;

    /// Exact row count (validation).
    async fn row_count(&self, table: &TableDescriptor) -> Result<i64>;

    /// Stream the rows of one chunk as bounded batches.
    ///
    /// A background task fills the channel; it stops when the receiver is
    /// dropped. Errors are delivered in-band and end the stream.
    fn read_chunk(
        &self,
        table: Arc<TableDescriptor>,
        range: ChunkRange,
        batch_size: usize,
    ) -> mpsc::Receiver<Result<Batch>>;

    /// Round-trip to the server.
    async fn ping(&self) -> Result<()>;

    /// Database type identifier for logging.
    fn db_type(&self) -> &str;

    /// Close connections.
    async fn close(&self) {}
}

/// Target database operations.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Execute one DDL statement.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Execute statements in order, stopping at the first failure.
    async fn execute_all(&self, statements: &[String]) -> Result<()> {
        for sql in statements {
            self.execute(sql).await?;
        }
        Ok(())
    }

    async fn create_schema(&self, schema: &str) -> Result<()>;

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()>;

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool>;

    /// Load one chunk in a single transaction and return the rows written.
    ///
    /// Implementations must make re-attempts idempotent: when
    /// `chunk.is_reattempt()` is true, rows of the chunk's key range left
    /// by an earlier committed attempt are removed first. Concurrent writers
    /// of the same chunk are serialised. Nothing is visible unless the whole
    /// chunk commits.
    async fn write_chunk(
        &self,
        table: &TableDescriptor,
        chunk: &WorkChunk,
        rows: mpsc::Receiver<Result<Batch>>,
    ) -> Result<u64>;

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64>;

    /// Round-trip to the server.
    async fn ping(&self) -> Result<()>;

    /// Database type identifier for logging.
    fn db_type(&self) -> &str;

    /// Close connections.
    async fn close(&self) {}
}
