//! Per-table stage tracking for resumable migrations.
//!
//! Every table moves through four stages in order: schema created, data
//! loaded, indexes built, constraints applied. [`StateTracker`] keeps the
//! records in memory and writes each change through to a [`StateBackend`]
//! before returning, so a restarted process sees exactly which stages
//! finished.

mod backend;
mod db;
mod file;
mod memory;

pub use backend::StateBackend;
pub use db::PgStateBackend;
pub use file::FileStore;
pub use memory::MemoryStateBackend;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{MigrateError, Result};
use crate::pool::PoolProgress;

/// A table migration stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SchemaCreated,
    DataLoaded,
    IndexesBuilt,
    ConstraintsApplied,
}

impl Stage {
    /// Stages in execution order.
    pub const ALL: [Stage; 4] = [
        Stage::SchemaCreated,
        Stage::DataLoaded,
        Stage::IndexesBuilt,
        Stage::ConstraintsApplied,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::SchemaCreated => "schema_created",
            Stage::DataLoaded => "data_loaded",
            Stage::IndexesBuilt => "indexes_built",
            Stage::ConstraintsApplied => "constraints_applied",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| MigrateError::State(format!("unknown stage '{}'", s)))
    }

    /// Stages that must be done before this one.
    pub fn prerequisites(&self) -> &'static [Stage] {
        static ORDER: [Stage; 4] = Stage::ALL;
        let idx = ORDER.iter().position(|s| s == self).unwrap_or(0);
        &ORDER[..idx]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage completion times for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Source table name.
    pub table: String,
    pub schema_created: Option<DateTime<Utc>>,
    pub data_loaded: Option<DateTime<Utc>>,
    pub indexes_built: Option<DateTime<Utc>>,
    pub constraints_applied: Option<DateTime<Utc>>,
    /// Deferred stage whose DDL is being applied.
    #[serde(default)]
    pub started_stage: Option<Stage>,
    /// Stage that failed unrecoverably, if any.
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            schema_created: None,
            data_loaded: None,
            indexes_built: None,
            constraints_applied: None,
            started_stage: None,
            failed_stage: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    fn slot(&mut self, stage: Stage) -> &mut Option<DateTime<Utc>> {
        match stage {
            Stage::SchemaCreated => &mut self.schema_created,
            Stage::DataLoaded => &mut self.data_loaded,
            Stage::IndexesBuilt => &mut self.indexes_built,
            Stage::ConstraintsApplied => &mut self.constraints_applied,
        }
    }

    pub fn completed_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::SchemaCreated => self.schema_created,
            Stage::DataLoaded => self.data_loaded,
            Stage::IndexesBuilt => self.indexes_built,
            Stage::ConstraintsApplied => self.constraints_applied,
        }
    }

    pub fn is_done(&self, stage: Stage) -> bool {
        self.completed_at(stage).is_some()
    }

    /// Stages already complete, in order.
    pub fn done_stages(&self) -> Vec<Stage> {
        Stage::ALL.into_iter().filter(|s| self.is_done(*s)).collect()
    }

    /// Derive the table's position in the stage machine.
    pub fn status(&self, progress: Option<&PoolProgress>) -> TableStatus {
        if let Some(stage) = self.failed_stage {
            return TableStatus::Failed(stage);
        }
        if !self.is_done(Stage::SchemaCreated) {
            TableStatus::SchemaPending
        } else if !self.is_done(Stage::DataLoaded) {
            let started = progress
                .map(|p| p.done + p.in_progress + p.failed > 0)
                .unwrap_or(false);
            if started {
                TableStatus::DataLoading
            } else {
                TableStatus::SchemaDone
            }
        } else if !self.is_done(Stage::IndexesBuilt) {
            if self.started_stage == Some(Stage::IndexesBuilt) {
                TableStatus::IndexesPending
            } else {
                TableStatus::DataDone
            }
        } else if !self.is_done(Stage::ConstraintsApplied) {
            if self.started_stage == Some(Stage::ConstraintsApplied) {
                TableStatus::ConstraintsPending
            } else {
                TableStatus::IndexesDone
            }
        } else {
            TableStatus::ConstraintsDone
        }
    }
}

/// Per-table state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    SchemaPending,
    SchemaDone,
    DataLoading,
    DataDone,
    IndexesPending,
    IndexesDone,
    ConstraintsPending,
    ConstraintsDone,
    Failed(Stage),
}

impl TableStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TableStatus::ConstraintsDone | TableStatus::Failed(_))
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableStatus::SchemaPending => f.write_str("schema pending"),
            TableStatus::SchemaDone => f.write_str("schema done"),
            TableStatus::DataLoading => f.write_str("data loading"),
            TableStatus::DataDone => f.write_str("data done"),
            TableStatus::IndexesPending => f.write_str("indexes pending"),
            TableStatus::IndexesDone => f.write_str("indexes done"),
            TableStatus::ConstraintsPending => f.write_str("constraints pending"),
            TableStatus::ConstraintsDone => f.write_str("complete"),
            TableStatus::Failed(stage) => write!(f, "failed at {}", stage),
        }
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(MigrateError::State(format!("Invalid run status: {}", s))),
        }
    }
}

/// One invocation of `run` or `resume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    /// Fingerprint of the settings that shape the plan.
    pub plan_hash: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}

impl RunInfo {
    pub fn start(plan_hash: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            plan_hash: plan_hash.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
        }
    }
}

/// Tracks stage completion for every table in the plan.
pub struct StateTracker {
    backend: Arc<dyn StateBackend>,
    records: Mutex<HashMap<String, StateRecord>>,
}

impl StateTracker {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }

    /// Create backend storage and load every persisted record.
    pub async fn open(&self) -> Result<usize> {
        self.backend.init_schema().await?;
        let loaded = self.backend.load_records().await?;
        let count = loaded.len();

        let mut records = self.records.lock().await;
        records.clear();
        for record in loaded {
            records.insert(record.table.clone(), record);
        }
        debug!("Loaded {} state records from {} backend", count, self.backend_type());
        Ok(count)
    }

    /// Ensure a record exists for `table`.
    pub async fn init(&self, table: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.contains_key(table) {
            return Ok(());
        }
        let record = StateRecord::new(table);
        self.backend.save_record(&record).await?;
        records.insert(table.to_string(), record);
        Ok(())
    }

    /// Mark a stage complete.
    ///
    /// Re-marking a finished stage is a no-op and does not touch the
    /// backend. Marking a stage whose predecessors are not done is an error.
    /// Returns whether the record changed.
    pub async fn mark_done(&self, table: &str, stage: Stage) -> Result<bool> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(table)
            .ok_or_else(|| MigrateError::State(format!("{}: no state record", table)))?;

        if record.is_done(stage) {
            return Ok(false);
        }
        if let Some(missing) = stage.prerequisites().iter().find(|s| !record.is_done(**s)) {
            return Err(MigrateError::State(format!(
                "{}: cannot mark {} before {}",
                table, stage, missing
            )));
        }

        let mut updated = record.clone();
        let now = Utc::now();
        *updated.slot(stage) = Some(now);
        if updated.started_stage == Some(stage) {
            updated.started_stage = None;
        }
        if updated.failed_stage == Some(stage) {
            updated.failed_stage = None;
            updated.error = None;
        }
        updated.updated_at = now;

        self.backend.save_record(&updated).await?;
        *record = updated;
        info!("{}: {} done", table, stage);
        Ok(true)
    }

    /// Record that a deferred stage's DDL is being applied.
    pub async fn mark_started(&self, table: &str, stage: Stage) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(table)
            .ok_or_else(|| MigrateError::State(format!("{}: no state record", table)))?;
        if record.is_done(stage) || record.started_stage == Some(stage) {
            return Ok(());
        }

        let mut updated = record.clone();
        updated.started_stage = Some(stage);
        updated.updated_at = Utc::now();
        self.backend.save_record(&updated).await?;
        *record = updated;
        debug!("{}: {} started", table, stage);
        Ok(())
    }

    pub async fn is_done(&self, table: &str, stage: Stage) -> bool {
        self.records
            .lock()
            .await
            .get(table)
            .map(|r| r.is_done(stage))
            .unwrap_or(false)
    }

    /// Persist an unrecoverable failure of a stage.
    pub async fn mark_failed(&self, table: &str, stage: Stage, reason: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(table.to_string())
            .or_insert_with(|| StateRecord::new(table));

        let mut updated = record.clone();
        updated.started_stage = None;
        updated.failed_stage = Some(stage);
        updated.error = Some(reason.to_string());
        updated.updated_at = Utc::now();

        self.backend.save_record(&updated).await?;
        *record = updated;
        error!("{}: {} failed: {}", table, stage, reason);
        Ok(())
    }

    /// Clear a recorded failure before a stage is re-attempted.
    pub async fn clear_failure(&self, table: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(table) else {
            return Ok(());
        };
        if record.failed_stage.is_none() {
            return Ok(());
        }

        let mut updated = record.clone();
        updated.failed_stage = None;
        updated.error = None;
        updated.updated_at = Utc::now();
        self.backend.save_record(&updated).await?;
        *record = updated;
        Ok(())
    }

    pub async fn record(&self, table: &str) -> Option<StateRecord> {
        self.records.lock().await.get(table).cloned()
    }

    /// All records, sorted by table.
    pub async fn records(&self) -> Vec<StateRecord> {
        let mut records: Vec<StateRecord> = self.records.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.table.cmp(&b.table));
        records
    }

    /// Forget all progress (fresh run).
    pub async fn reset_all(&self) -> Result<()> {
        let mut records = self.records.lock().await;
        self.backend.delete_all().await?;
        records.clear();
        Ok(())
    }

    pub async fn save_run(&self, run: &RunInfo) -> Result<()> {
        self.backend.save_run(run).await
    }

    pub async fn latest_run(&self) -> Result<Option<RunInfo>> {
        self.backend.load_latest_run().await
    }
}
