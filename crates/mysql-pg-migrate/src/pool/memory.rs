//! In-memory pool store for dry runs and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::chunk::WorkChunk;
use super::store::PoolStore;
use crate::error::{MigrateError, Result};

/// Chunks kept in a map; survives as long as the value does.
#[derive(Debug, Default)]
pub struct MemoryPoolStore {
    chunks: Mutex<BTreeMap<(String, i64), WorkChunk>>,
    writes: AtomicUsize,
}

impl MemoryPoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of write calls received.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of every stored chunk.
    pub fn snapshot(&self) -> Vec<WorkChunk> {
        self.chunks
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, i64), WorkChunk>>> {
        self.chunks
            .lock()
            .map_err(|_| MigrateError::State("pool store lock poisoned".into()))
    }
}

#[async_trait]
impl PoolStore for MemoryPoolStore {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn replace_chunks(&self, table: &str, chunks: &[WorkChunk]) -> Result<()> {
        let mut map = self.lock()?;
        map.retain(|(t, _), _| t != table);
        for chunk in chunks {
            map.insert((table.to_string(), chunk.chunk_id), chunk.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_chunk(&self, chunk: &WorkChunk) -> Result<()> {
        self.lock()?
            .insert((chunk.table.clone(), chunk.chunk_id), chunk.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_chunks(&self, table: &str) -> Result<Vec<WorkChunk>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn clear(&self, table: &str) -> Result<()> {
        self.lock()?.retain(|(t, _), _| t != table);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
