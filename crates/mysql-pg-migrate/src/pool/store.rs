//! Durable storage for the work pool.

use async_trait::async_trait;

use super::chunk::WorkChunk;
use crate::error::Result;

/// Persistence behind [`super::WorkPool`].
///
/// The pool writes through on every transition while holding its lock, so
/// implementations only need per-call atomicity.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Create the storage if it does not exist.
    async fn init_schema(&self) -> Result<()>;

    /// Replace every chunk of a table in one step.
    async fn replace_chunks(&self, table: &str, chunks: &[WorkChunk]) -> Result<()>;

    /// Upsert one chunk.
    async fn update_chunk(&self, chunk: &WorkChunk) -> Result<()>;

    /// All chunks of a table, in chunk id order.
    async fn load_chunks(&self, table: &str) -> Result<Vec<WorkChunk>>;

    /// Remove a table's chunks.
    async fn clear(&self, table: &str) -> Result<()>;

    /// Remove every chunk.
    async fn clear_all(&self) -> Result<()>;

    /// Store type identifier for logging.
    fn backend_type(&self) -> &'static str;
}
