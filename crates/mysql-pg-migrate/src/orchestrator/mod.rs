//! Migration orchestrator - drives tables through the stage machine.
//!
//! A run walks every selected table through schema creation, the chunked
//! data load, index building and constraint application. Each completed
//! stage is recorded in the state log, so a resumed run picks up where the
//! previous one stopped and reports what it skipped.

mod finalize;
mod report;

pub use finalize::Finalizer;
pub use report::{
    DryRunReport, DryRunTable, EndpointHealth, HealthCheckResult, MigrationResult, StatusReport,
    TableOutcome, TableProgress, TableReport, ValidationReport, ValidationRow,
};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use deadpool_postgres::Pool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::schema::{ChunkKey, TableDescriptor};
use crate::core::traits::{SourceReader, TargetWriter};
use crate::drivers::{build_pool, MysqlReader, PgWriter};
use crate::error::{MigrateError, Result};
use crate::pool::{
    plan_chunks, MemoryPoolStore, PgPoolStore, PoolSettings, PoolStore, Settled, WorkPool,
};
use crate::schema::{translate, translate_view, TableDdl, TranslateOptions};
use crate::state::{
    FileStore, MemoryStateBackend, PgStateBackend, RunInfo, RunStatus, Stage, StateBackend,
    StateTracker, TableStatus,
};
use crate::structure::{MigrationPlan, StructureLoader};
use crate::transfer::{RowCaster, TransferScheduler, TransferSettings, TransferSummary};
use crate::typemap::TypeMap;

/// Where stage state and the chunk pool are persisted.
pub struct Stores {
    pub state: Arc<dyn StateBackend>,
    pub pool: Arc<dyn PoolStore>,
}

impl Stores {
    /// A local state file holding both the stage log and the pool.
    ///
    /// `fresh` starts an empty file instead of loading the existing one.
    pub fn file(path: &Path, plan_hash: &str, fresh: bool) -> Result<Self> {
        let store = Arc::new(if fresh {
            FileStore::create(path, plan_hash)
        } else {
            FileStore::open(path, plan_hash)?
        });
        Ok(Self {
            state: store.clone(),
            pool: store,
        })
    }

    /// Tables in `schema` on the target database.
    pub fn postgres(pool: Pool, schema: &str) -> Result<Self> {
        Ok(Self {
            state: Arc::new(PgStateBackend::new(pool.clone(), schema)?),
            pool: Arc::new(PgPoolStore::new(pool, schema)?),
        })
    }

    /// Nothing survives the process.
    pub fn memory() -> Self {
        Self {
            state: Arc::new(MemoryStateBackend::new()),
            pool: Arc::new(MemoryPoolStore::new()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Fresh,
    Resume { force: bool },
}

/// What a run did, before it is turned into a [`MigrationResult`].
struct RunProgress {
    plan: MigrationPlan,
    transfer: TransferSummary,
    skipped: BTreeMap<String, Vec<Stage>>,
    views_created: usize,
    views_skipped: usize,
}

/// Everything a migration run needs: endpoints, type map, state log and
/// chunk pool.
pub struct MigrationContext {
    config: Config,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    type_map: Arc<TypeMap>,
    state: Arc<StateTracker>,
    pool: Arc<WorkPool>,
    cancel: CancellationToken,
}

impl MigrationContext {
    pub fn new(
        config: Config,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        stores: Stores,
    ) -> Result<Self> {
        let type_map = Arc::new(TypeMap::load(&config.migration)?);
        debug!("Type map loaded with {} entries", type_map.len());
        let pool = Arc::new(WorkPool::new(
            stores.pool,
            PoolSettings::from_config(&config.migration),
        ));
        Ok(Self {
            config,
            source,
            target,
            type_map,
            state: Arc::new(StateTracker::new(stores.state)),
            pool,
            cancel: CancellationToken::new(),
        })
    }

    /// Connect to both servers and open the state stores.
    ///
    /// With `state_file` the stage log and pool live in that file; otherwise
    /// they are tables in the configured state schema on the target.
    pub async fn connect(config: Config, state_file: Option<&Path>, fresh: bool) -> Result<Self> {
        let m = &config.migration;
        let source = MysqlReader::new(&config.source, m.get_max_mysql_connections()).await?;
        let pg_pool = build_pool(&config.target, m.get_max_pg_connections())?;
        let target = PgWriter::from_pool(pg_pool.clone());
        target
            .ping()
            .await
            .map_err(|e| MigrateError::connection(config.target.display_endpoint(), e))?;

        let stores = match state_file {
            Some(path) => {
                info!("Using state file {}", path.display());
                Stores::file(path, &config.plan_hash(), fresh)?
            }
            None => Stores::postgres(pg_pool, &m.state_schema)?,
        };
        Self::new(config, Arc::new(source), Arc::new(target), stores)
    }

    /// Stop the run when `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &Arc<StateTracker> {
        &self.state
    }

    pub fn pool(&self) -> &Arc<WorkPool> {
        &self.pool
    }

    /// Start a migration from scratch, discarding earlier progress.
    pub async fn run(&self) -> Result<MigrationResult> {
        self.execute(Mode::Fresh).await
    }

    /// Continue from recorded progress.
    ///
    /// Fails with [`MigrateError::ConfigChanged`] when the last run used a
    /// different plan, unless `force` is set.
    pub async fn resume(&self, force: bool) -> Result<MigrationResult> {
        self.execute(Mode::Resume { force }).await
    }

    async fn execute(&self, mode: Mode) -> Result<MigrationResult> {
        let started = Instant::now();
        let plan_hash = self.config.plan_hash();

        let restored = self.state.open().await?;
        self.pool.init().await?;

        let resumed = match mode {
            Mode::Fresh => {
                if restored > 0 {
                    info!("Discarding recorded state for {} tables", restored);
                }
                self.state.reset_all().await?;
                self.pool.clear_all().await?;
                false
            }
            Mode::Resume { force } => {
                match self.state.latest_run().await? {
                    Some(prev) if prev.plan_hash != plan_hash => {
                        if !force {
                            return Err(MigrateError::ConfigChanged);
                        }
                        warn!(
                            "Configuration changed since run {}; resuming anyway",
                            prev.run_id
                        );
                    }
                    Some(prev) => info!(
                        "Resuming after run {} ({})",
                        prev.run_id,
                        prev.status.as_str()
                    ),
                    None => info!("No earlier run recorded, starting from the beginning"),
                }
                true
            }
        };

        let mut run = RunInfo::start(plan_hash);
        self.state.save_run(&run).await?;
        info!("Starting migration run: {}", run.run_id);

        let outcome = self.migrate(resumed).await;
        run.completed_at = Some(Utc::now());

        let progress = match outcome {
            Ok(progress) => progress,
            Err(e) => {
                error!("Migration run {} failed: {}", run.run_id, e);
                run.status = if matches!(e, MigrateError::Cancelled) {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                if let Err(save) = self.state.save_run(&run).await {
                    warn!("Could not record run status: {}", save);
                }
                return Err(e);
            }
        };

        let result = self.build_result(&run, resumed, started, progress).await;
        run.status = match result.status.as_str() {
            "completed" => RunStatus::Completed,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        self.state.save_run(&run).await?;

        info!(
            "Run {} {}: {}/{} tables, {} rows in {:.1}s ({} rows/sec)",
            result.run_id,
            result.status,
            result.tables_success,
            result.tables_total,
            result.rows_transferred,
            result.duration_seconds,
            result.rows_per_second
        );
        Ok(result)
    }

    async fn migrate(&self, resumed: bool) -> Result<RunProgress> {
        info!("Phase 1: Reading source structure");
        let plan = StructureLoader::new(self.source.as_ref(), &self.config)
            .load()
            .await?;
        info!(
            "Found {} tables to migrate (~{} rows), {} rejected",
            plan.len(),
            plan.total_rows(),
            plan.rejected.len()
        );

        let names = plan.names();
        let options = TranslateOptions::from_config(&self.config.migration);
        let mut skipped: BTreeMap<String, Vec<Stage>> = BTreeMap::new();
        let mut finalizer = Finalizer::new(
            self.target.clone(),
            self.state.clone(),
            self.cancel.clone(),
        );
        let mut scheduler = TransferScheduler::new(
            self.source.clone(),
            self.target.clone(),
            self.pool.clone(),
            self.state.clone(),
            TransferSettings::from_config(&self.config.migration),
        )
        .with_cancel(self.cancel.clone());
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();

        for rejected in &plan.rejected {
            self.state.init(&rejected.table).await?;
            self.state
                .mark_failed(&rejected.table, Stage::SchemaCreated, &rejected.reason)
                .await?;
            finalizer.mark_unavailable(&rejected.table);
        }

        if !plan.is_empty() {
            self.target
                .create_schema(&plan.target_schema)
                .await
                .map_err(|e| MigrateError::schema_apply(&plan.target_schema, e))?;
        }

        info!("Phase 2: Creating tables and planning chunks");
        for table in &plan.tables {
            if self.cancel.is_cancelled() {
                break;
            }
            let name = table.name();
            self.state.init(name).await?;

            let ddl = match translate(table, &self.type_map, &options, &names) {
                Ok(ddl) => ddl,
                Err(e) => {
                    error!("{}: {}", name, e);
                    self.state
                        .mark_failed(name, Stage::SchemaCreated, &e.to_string())
                        .await?;
                    finalizer.mark_unavailable(name);
                    continue;
                }
            };
            let caster = RowCaster::for_types(table, &ddl.column_types)?;

            if !self.schema_stage(table, &ddl, resumed, &mut skipped).await? {
                finalizer.mark_unavailable(name);
                continue;
            }
            finalizer.add_table(ddl);

            if self.state.is_done(name, Stage::DataLoaded).await {
                note_skipped(&mut skipped, name, Stage::DataLoaded);
                let _ = settled_tx.send(Settled::AllDone {
                    table: name.to_string(),
                });
                continue;
            }

            match self.prepare_chunks(table, resumed).await {
                Ok(()) => scheduler.add_table(table.clone(), caster),
                Err(e) if e.is_global() => return Err(e),
                Err(e) => {
                    error!("{}: {}", name, e);
                    self.state
                        .mark_failed(name, Stage::DataLoaded, &e.to_string())
                        .await?;
                    finalizer.mark_unavailable(name);
                }
            }
        }

        info!("Phase 3: Transferring data");
        let finalizing = tokio::spawn(finalizer.run(settled_rx));
        let transfer = scheduler.with_settled_channel(settled_tx).run().await;
        let finalized = finalizing.await.map_err(|e| {
            MigrateError::pool(format!("finaliser task failed: {}", e), "finalize")
        })?;
        let transfer = transfer?;
        for (table, stages) in finalized? {
            for stage in stages {
                note_skipped(&mut skipped, &table, stage);
            }
        }

        let (views_created, views_skipped) = if self.config.migration.migrate_views
            && !self.cancel.is_cancelled()
        {
            self.create_views(&plan).await
        } else {
            (0, 0)
        };

        Ok(RunProgress {
            plan,
            transfer,
            skipped,
            views_created,
            views_skipped,
        })
    }

    /// Create the target table. Returns false when the table failed.
    async fn schema_stage(
        &self,
        table: &TableDescriptor,
        ddl: &TableDdl,
        resumed: bool,
        skipped: &mut BTreeMap<String, Vec<Stage>>,
    ) -> Result<bool> {
        let name = table.name();
        if resumed && self.state.is_done(name, Stage::SchemaCreated).await {
            note_skipped(skipped, name, Stage::SchemaCreated);
            return Ok(true);
        }

        let created = async {
            self.target
                .drop_table(&table.target_schema, &table.target_name)
                .await?;
            self.target.execute(&ddl.create_table).await
        }
        .await;
        if let Err(e) = created {
            let e = MigrateError::schema_apply(name, e);
            error!("{}", e);
            self.state
                .mark_failed(name, Stage::SchemaCreated, &e.to_string())
                .await?;
            return Ok(false);
        }
        for comment in &ddl.comments {
            if let Err(e) = self.target.execute(comment).await {
                warn!("{}: comment not applied: {}", name, e);
            }
        }

        // chunks from an older layout no longer describe this table
        self.pool.clear(name).await?;
        self.state.mark_done(name, Stage::SchemaCreated).await?;
        debug!("{}: created {}", name, ddl.target);
        Ok(true)
    }

    async fn prepare_chunks(&self, table: &Arc<TableDescriptor>, resumed: bool) -> Result<()> {
        let name = table.name();
        if resumed {
            let loaded = self.pool.load(name).await?;
            if loaded > 0 {
                let requeued = self.pool.requeue_failed(name).await?;
                self.state.clear_failure(name).await?;
                let progress = self.pool.progress(name).await;
                info!(
                    "{}: resuming with {}/{} chunks done, {} requeued",
                    name, progress.done, progress.total, requeued
                );
                return Ok(());
            }
        }
        let chunk_rows = self.config.migration.chunk_rows_for(table.avg_row_length);
        self.pool
            .populate(self.source.as_ref(), table, chunk_rows)
            .await?;
        Ok(())
    }

    async fn create_views(&self, plan: &MigrationPlan) -> (usize, usize) {
        let names = plan.names();
        let mut created = 0;
        let mut skipped = 0;
        for view in &plan.views {
            let Some(sql) = translate_view(view, &names) else {
                skipped += 1;
                continue;
            };
            match self.target.execute(&sql).await {
                Ok(()) => created += 1,
                Err(e) => {
                    warn!("Skipping view {}: {}", view.name, e);
                    skipped += 1;
                }
            }
        }
        if created + skipped > 0 {
            info!("Views: {} created, {} skipped", created, skipped);
        }
        (created, skipped)
    }

    async fn build_result(
        &self,
        run: &RunInfo,
        resumed: bool,
        started: Instant,
        progress: RunProgress,
    ) -> MigrationResult {
        let RunProgress {
            plan,
            transfer,
            mut skipped,
            views_created,
            views_skipped,
        } = progress;

        let mut tables = Vec::new();
        for name in plan.table_names() {
            let record = self.state.record(&name).await;
            let pool_progress = self.pool.progress(&name).await;
            let (status, error) = match &record {
                Some(record) => (record.status(Some(&pool_progress)), record.error.clone()),
                None => (TableStatus::SchemaPending, None),
            };
            let outcome = match status {
                TableStatus::ConstraintsDone => TableOutcome::Success,
                TableStatus::Failed(_) => TableOutcome::Failed,
                _ if transfer.cancelled || self.cancel.is_cancelled() => TableOutcome::Incomplete,
                _ => TableOutcome::Failed,
            };
            let target = plan
                .table(&name)
                .map(|t| format!("{}.{}", t.target_schema, t.target_name))
                .unwrap_or_default();
            tables.push(TableReport {
                rows_transferred: transfer.rows_by_table.get(&name).copied().unwrap_or(0),
                skipped_stages: skipped.remove(&name).unwrap_or_default(),
                table: name,
                target,
                status,
                outcome,
                error,
            });
        }

        let tables_success = tables
            .iter()
            .filter(|t| t.outcome == TableOutcome::Success)
            .count();
        let tables_failed = tables
            .iter()
            .filter(|t| t.outcome == TableOutcome::Failed)
            .count();
        let cancelled = transfer.cancelled || self.cancel.is_cancelled();
        let status = if cancelled {
            "cancelled"
        } else if tables_success == tables.len() {
            "completed"
        } else {
            "failed"
        };

        let elapsed = started.elapsed().as_secs_f64();
        let rows_per_second = if elapsed > 0.0 {
            (transfer.rows as f64 / elapsed) as u64
        } else {
            0
        };

        MigrationResult {
            run_id: run.run_id.clone(),
            status: status.to_string(),
            resumed,
            started_at: run.started_at,
            completed_at: run.completed_at.unwrap_or_else(Utc::now),
            duration_seconds: elapsed,
            tables_total: tables.len(),
            tables_success,
            tables_failed,
            rows_transferred: transfer.rows,
            rows_per_second,
            views_created,
            views_skipped,
            tables,
        }
    }

    /// Compare source and target row counts for every selected table.
    pub async fn validate(&self) -> Result<ValidationReport> {
        let plan = StructureLoader::new(self.source.as_ref(), &self.config)
            .load()
            .await?;
        let mut rows = Vec::with_capacity(plan.len());
        for table in &plan.tables {
            let source_rows = self.source.row_count(table).await?;
            let target_rows = if self
                .target
                .table_exists(&table.target_schema, &table.target_name)
                .await?
            {
                Some(
                    self.target
                        .row_count(&table.target_schema, &table.target_name)
                        .await?,
                )
            } else {
                None
            };
            let matches = target_rows == Some(source_rows);
            if matches {
                info!("{}: {} rows (match)", table.name(), source_rows);
            } else {
                warn!(
                    "{}: source {} rows, target {}",
                    table.name(),
                    source_rows,
                    target_rows.map_or_else(|| "missing".to_string(), |n| n.to_string())
                );
            }
            rows.push(ValidationRow {
                table: table.name().to_string(),
                source_rows,
                target_rows,
                matches,
            });
        }
        Ok(ValidationReport { tables: rows })
    }

    pub async fn close(&self) {
        self.source.close().await;
        self.target.close().await;
    }
}

fn note_skipped(skipped: &mut BTreeMap<String, Vec<Stage>>, table: &str, stage: Stage) {
    let stages = skipped.entry(table.to_string()).or_default();
    if !stages.contains(&stage) {
        stages.push(stage);
    }
}

/// Plan the migration without touching the target.
pub async fn dry_run(config: &Config, source: &dyn SourceReader) -> Result<DryRunReport> {
    let type_map = TypeMap::load(&config.migration)?;
    let plan = StructureLoader::new(source, config).load().await?;
    let names = plan.names();
    let options = TranslateOptions::from_config(&config.migration);

    let mut tables = Vec::with_capacity(plan.len() + plan.rejected.len());
    for table in &plan.tables {
        let target = format!("{}.{}", table.target_schema, table.target_name);
        let chunk_key = describe_chunk_key(&table.chunk_key);
        let entry = match translate(table, &type_map, &options, &names) {
            Ok(ddl) => {
                let chunk_rows = config.migration.chunk_rows_for(table.avg_row_length);
                let chunks = plan_chunks(source, table, chunk_rows).await?;
                let mut ddl_statements = vec![ddl.create_table.clone()];
                ddl_statements.extend(ddl.comments.iter().cloned());
                let mut deferred = ddl.indexes.clone();
                deferred.extend(ddl.constraints.iter().map(|c| c.sql.clone()));
                DryRunTable {
                    table: table.name().to_string(),
                    target,
                    chunk_key,
                    estimated_rows: chunks.iter().map(|c| c.estimated_rows).sum(),
                    chunks: chunks.len(),
                    ddl: ddl_statements,
                    deferred,
                    error: None,
                }
            }
            Err(e) => DryRunTable {
                table: table.name().to_string(),
                target,
                chunk_key,
                estimated_rows: table.row_estimate,
                chunks: 0,
                ddl: vec![],
                deferred: vec![],
                error: Some(e.to_string()),
            },
        };
        tables.push(entry);
    }
    for rejected in &plan.rejected {
        tables.push(DryRunTable {
            table: rejected.table.clone(),
            target: String::new(),
            chunk_key: String::new(),
            estimated_rows: 0,
            chunks: 0,
            ddl: vec![],
            deferred: vec![],
            error: Some(rejected.reason.clone()),
        });
    }
    tables.sort_by(|a, b| a.table.cmp(&b.table));

    let views = if config.migration.migrate_views {
        plan.views
            .iter()
            .filter_map(|v| translate_view(v, &names))
            .collect()
    } else {
        vec![]
    };

    Ok(DryRunReport {
        plan_hash: config.plan_hash(),
        tables,
        views,
    })
}

fn describe_chunk_key(key: &ChunkKey) -> String {
    match key {
        ChunkKey::Integer { column } => format!("integer ranges on {}", column),
        ChunkKey::Ordered { column } => format!("sampled ranges on {}", column),
        ChunkKey::RowPosition { order_by } if order_by.is_empty() => {
            "row positions, unordered".to_string()
        }
        ChunkKey::RowPosition { order_by } => {
            format!("row positions ordered by {}", order_by.join(", "))
        }
    }
}

/// Connect to both servers and time a round trip to each.
pub async fn health_check(config: &Config) -> HealthCheckResult {
    let source = async {
        let endpoint = config.source.display_endpoint();
        match MysqlReader::new(&config.source, 1).await {
            Ok(reader) => {
                let health = timed_ping(endpoint, reader.db_type(), reader.ping()).await;
                reader.close().await;
                health
            }
            Err(e) => unreachable_endpoint(endpoint, "mysql", e),
        }
    };
    let target = async {
        let endpoint = config.target.display_endpoint();
        match build_pool(&config.target, 1) {
            Ok(pool) => {
                let writer = PgWriter::from_pool(pool);
                let health = timed_ping(endpoint, writer.db_type(), writer.ping()).await;
                writer.close().await;
                health
            }
            Err(e) => unreachable_endpoint(endpoint, "postgres", e),
        }
    };
    let (source, target) = tokio::join!(source, target);
    let healthy = source.connected && target.connected;
    HealthCheckResult {
        source,
        target,
        healthy,
    }
}

async fn timed_ping(
    endpoint: String,
    db_type: &str,
    ping: impl std::future::Future<Output = Result<()>>,
) -> EndpointHealth {
    let start = Instant::now();
    let result = ping.await;
    let latency_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(()) => EndpointHealth {
            endpoint,
            db_type: db_type.to_string(),
            connected: true,
            latency_ms,
            error: None,
        },
        Err(e) => unreachable_endpoint(endpoint, db_type, e),
    }
}

fn unreachable_endpoint(endpoint: String, db_type: &str, error: MigrateError) -> EndpointHealth {
    EndpointHealth {
        endpoint,
        db_type: db_type.to_string(),
        connected: false,
        latency_ms: 0,
        error: Some(error.to_string()),
    }
}

/// Read stored progress without running anything.
pub async fn status(stores: Stores) -> Result<StatusReport> {
    let state = StateTracker::new(stores.state);
    state.open().await?;
    let pool = WorkPool::new(stores.pool, PoolSettings::default());
    pool.init().await?;

    let mut tables = Vec::new();
    for record in state.records().await {
        let progress = pool.stored_progress(&record.table).await?;
        tables.push(TableProgress {
            status: record.status(Some(&progress)),
            error: record.error.clone(),
            table: record.table,
            progress,
        });
    }
    Ok(StatusReport {
        run: state.latest_run().await?,
        tables,
    })
}
