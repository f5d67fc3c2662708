//! In-memory state backend.
//!
//! Used for dry runs, where nothing may be written to the target, and by
//! tests. Progress is lost when the process exits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::backend::StateBackend;
use super::{RunInfo, StateRecord};
use crate::error::{MigrateError, Result};

#[derive(Debug, Default)]
pub struct MemoryStateBackend {
    records: Mutex<BTreeMap<String, StateRecord>>,
    runs: Mutex<Vec<RunInfo>>,
    writes: AtomicUsize,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of record writes received.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Stored copy of a record.
    pub fn record(&self, table: &str) -> Option<StateRecord> {
        self.records.lock().ok()?.get(table).cloned()
    }
}

fn poisoned() -> MigrateError {
    MigrateError::State("state store lock poisoned".into())
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn load_records(&self) -> Result<Vec<StateRecord>> {
        Ok(self
            .records
            .lock()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect())
    }

    async fn save_record(&self, record: &StateRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| poisoned())?
            .insert(record.table.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        self.records.lock().map_err(|_| poisoned())?.clear();
        Ok(())
    }

    async fn save_run(&self, run: &RunInfo) -> Result<()> {
        let mut runs = self.runs.lock().map_err(|_| poisoned())?;
        match runs.iter_mut().find(|r| r.run_id == run.run_id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
        Ok(())
    }

    async fn load_latest_run(&self) -> Result<Option<RunInfo>> {
        Ok(self
            .runs
            .lock()
            .map_err(|_| poisoned())?
            .iter()
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
