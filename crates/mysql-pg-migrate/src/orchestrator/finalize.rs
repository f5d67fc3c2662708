//! Deferred DDL after a table's data is loaded.
//!
//! The finaliser consumes [`Settled`] events. A loaded table gets its index
//! stage (primary key, sequences, secondary indexes) right away; its
//! constraint stage waits until every table its foreign keys reference has
//! finished the index stage, so the referenced keys exist. A table whose
//! referenced table failed fails its constraint stage instead.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::traits::TargetWriter;
use crate::error::{MigrateError, Result};
use crate::pool::Settled;
use crate::schema::TableDdl;
use crate::state::{Stage, StateTracker};

pub struct Finalizer {
    target: Arc<dyn TargetWriter>,
    state: Arc<StateTracker>,
    tables: BTreeMap<String, TableDdl>,
    indexed: HashSet<String>,
    /// Tables that cannot reach the index stage in this run.
    failed: HashSet<String>,
    /// Indexed tables whose constraint stage is pending.
    waiting: BTreeSet<String>,
    skipped: BTreeMap<String, Vec<Stage>>,
    cancel: CancellationToken,
}

impl Finalizer {
    pub fn new(target: Arc<dyn TargetWriter>, state: Arc<StateTracker>, cancel: CancellationToken) -> Self {
        Self {
            target,
            state,
            tables: BTreeMap::new(),
            indexed: HashSet::new(),
            failed: HashSet::new(),
            waiting: BTreeSet::new(),
            skipped: BTreeMap::new(),
            cancel,
        }
    }

    /// Track a table whose schema exists on the target.
    pub fn add_table(&mut self, ddl: TableDdl) {
        self.tables.insert(ddl.table.clone(), ddl);
    }

    /// Record a table that will not load in this run.
    pub fn mark_unavailable(&mut self, table: &str) {
        self.failed.insert(table.to_string());
    }

    /// Consume events until the sender side closes.
    ///
    /// Returns the stages skipped because an earlier run completed them.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Settled>) -> Result<BTreeMap<String, Vec<Stage>>> {
        while let Some(event) = events.recv().await {
            self.handle(event).await?;
        }
        if !self.waiting.is_empty() {
            let pending: Vec<&str> = self.waiting.iter().map(|s| s.as_str()).collect();
            warn!(
                "Constraint stage still waiting on referenced tables for: {}",
                pending.join(", ")
            );
        }
        Ok(self.skipped)
    }

    pub async fn handle(&mut self, event: Settled) -> Result<()> {
        match event {
            Settled::AllDone { table } => {
                if self.cancel.is_cancelled() {
                    debug!("{}: cancelled, leaving deferred DDL for resume", table);
                    return Ok(());
                }
                self.index_stage(&table).await?;
            }
            Settled::Failed { table, .. } => {
                self.failed.insert(table);
            }
        }
        self.process_waiting().await
    }

    async fn index_stage(&mut self, table: &str) -> Result<()> {
        let Some(ddl) = self.tables.get(table) else {
            warn!("{}: loaded but not tracked by the finaliser", table);
            return Ok(());
        };

        if self.state.is_done(table, Stage::IndexesBuilt).await {
            self.skip(table, Stage::IndexesBuilt);
        } else {
            info!("{}: building {} deferred indexes", table, ddl.indexes.len());
            self.state.mark_started(table, Stage::IndexesBuilt).await?;
            if let Err(e) = self.apply(table, &ddl.indexes).await {
                self.state
                    .mark_failed(table, Stage::IndexesBuilt, &e.to_string())
                    .await?;
                self.failed.insert(table.to_string());
                return Ok(());
            }
            self.state.mark_done(table, Stage::IndexesBuilt).await?;
        }

        self.indexed.insert(table.to_string());
        self.waiting.insert(table.to_string());
        Ok(())
    }

    async fn process_waiting(&mut self) -> Result<()> {
        let mut ready = Vec::new();
        let mut blocked = Vec::new();
        for table in &self.waiting {
            let Some(ddl) = self.tables.get(table) else {
                continue;
            };
            let refs = ddl.referenced_tables();
            if let Some(bad) = refs
                .iter()
                .find(|r| self.failed.contains(**r) || !self.tables.contains_key(**r))
            {
                blocked.push((table.clone(), bad.to_string()));
            } else if refs.iter().all(|r| self.indexed.contains(*r)) {
                ready.push(table.clone());
            }
        }

        for (table, reference) in blocked {
            self.waiting.remove(&table);
            if self.state.is_done(&table, Stage::ConstraintsApplied).await {
                self.skip(&table, Stage::ConstraintsApplied);
                continue;
            }
            let reason = format!("referenced table {} did not load", reference);
            self.state
                .mark_failed(&table, Stage::ConstraintsApplied, &reason)
                .await?;
        }

        for table in ready {
            self.waiting.remove(&table);
            if self.cancel.is_cancelled() {
                continue;
            }
            self.constraint_stage(&table).await?;
        }
        Ok(())
    }

    async fn constraint_stage(&mut self, table: &str) -> Result<()> {
        if self.state.is_done(table, Stage::ConstraintsApplied).await {
            self.skip(table, Stage::ConstraintsApplied);
            return Ok(());
        }
        let Some(ddl) = self.tables.get(table) else {
            return Ok(());
        };
        let statements: Vec<String> = ddl.constraints.iter().map(|c| c.sql.clone()).collect();
        debug!("{}: applying {} constraints", table, statements.len());
        self.state.mark_started(table, Stage::ConstraintsApplied).await?;
        match self.apply(table, &statements).await {
            Ok(()) => {
                self.state.mark_done(table, Stage::ConstraintsApplied).await?;
            }
            Err(e) => {
                self.state
                    .mark_failed(table, Stage::ConstraintsApplied, &e.to_string())
                    .await?;
            }
        }
        Ok(())
    }

    async fn apply(&self, table: &str, statements: &[String]) -> Result<()> {
        for sql in statements {
            self.target
                .execute(sql)
                .await
                .map_err(|e| MigrateError::schema_apply(table, e))?;
        }
        Ok(())
    }

    fn skip(&mut self, table: &str, stage: Stage) {
        debug!("{}: {} already done", table, stage);
        self.skipped.entry(table.to_string()).or_default().push(stage);
    }
}
