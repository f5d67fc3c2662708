//! Transfer scheduler: a bounded set of workers draining the work pool.
//!
//! Each worker repeatedly claims a chunk, streams its rows from the source
//! through a per-table [`RowCaster`] into the target, and reports the outcome
//! back to the pool:
//!
//! - success: `complete` (only after the target transaction committed)
//! - transient error: `fail`, which requeues with backoff until retries run out
//! - anything else: `fail_permanently`, which halts the table
//!
//! When the pool reports a table settled, the scheduler records `DataLoaded`
//! (or the failure) in the state log and forwards the event to the finaliser,
//! which applies the deferred index and constraint stages.

pub mod cast;

pub use cast::{cast_stream, RowCaster, TargetKind};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::core::schema::TableDescriptor;
use crate::core::traits::{SourceReader, TargetWriter};
use crate::error::{MigrateError, Result};
use crate::pool::{ChunkStatus, Claim, Settled, WorkChunk, WorkPool};
use crate::state::{Stage, StateTracker};

/// Worker and streaming limits for a transfer run.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Concurrent workers (each holds one source and one target connection).
    pub workers: usize,
    /// Rows per streamed batch.
    pub batch_size: usize,
    /// Batches buffered between reader, caster and writer.
    pub read_ahead: usize,
    /// Abort a chunk attempt after this long (counts as transient).
    pub chunk_timeout: Option<Duration>,
    /// Time in-flight chunks get to finish after cancellation.
    pub shutdown_grace: Duration,
    /// Lease renewal interval while a chunk is in flight.
    pub heartbeat: Duration,
}

impl TransferSettings {
    pub fn from_config(config: &MigrationConfig) -> Self {
        let lease = Duration::from_secs(config.lease_seconds.max(1));
        Self {
            workers: config.get_workers().max(1),
            batch_size: config.get_batch_size().max(1),
            read_ahead: config.get_read_ahead_batches().max(1),
            chunk_timeout: config.chunk_timeout_seconds.map(Duration::from_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_seconds),
            heartbeat: (lease / 3).max(Duration::from_millis(100)),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 5_000,
            read_ahead: 4,
            chunk_timeout: None,
            shutdown_grace: Duration::from_secs(30),
            heartbeat: Duration::from_secs(200),
        }
    }
}

/// Counters for one scheduler run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferSummary {
    pub chunks_completed: u64,
    /// Attempts that failed transiently and were requeued.
    pub chunks_retried: u64,
    /// Chunks that ended permanently Failed.
    pub chunks_failed: u64,
    /// Commits whose claim had already been reclaimed.
    pub stale_completions: u64,
    /// In-flight chunks left for lease reclaim at shutdown.
    pub chunks_abandoned: u64,
    pub rows: u64,
    pub rows_by_table: HashMap<String, u64>,
    pub cancelled: bool,
    #[serde(skip)]
    pub elapsed: Duration,
}

struct TableJob {
    table: Arc<TableDescriptor>,
    caster: Arc<RowCaster>,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    stale: AtomicU64,
    abandoned: AtomicU64,
    rows: AtomicU64,
}

struct Shared {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    pool: Arc<WorkPool>,
    state: Arc<StateTracker>,
    tables: HashMap<String, TableJob>,
    settings: TransferSettings,
    /// Operator stop: no new claims, in-flight chunks get the grace period.
    cancel: CancellationToken,
    /// Global failure: every worker stops at once.
    abort: CancellationToken,
    counters: Counters,
    rows_by_table: Mutex<HashMap<String, u64>>,
    settled_tx: Option<mpsc::UnboundedSender<Settled>>,
}

/// How a chunk attempt ended.
enum Outcome {
    Committed(u64),
    Failed(MigrateError),
    /// Left InProgress for lease reclaim.
    Abandoned,
}

/// Drives chunk transfers for every table added to it.
pub struct TransferScheduler {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    pool: Arc<WorkPool>,
    state: Arc<StateTracker>,
    tables: HashMap<String, TableJob>,
    settings: TransferSettings,
    cancel: CancellationToken,
    settled_tx: Option<mpsc::UnboundedSender<Settled>>,
}

impl TransferScheduler {
    pub fn new(
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        pool: Arc<WorkPool>,
        state: Arc<StateTracker>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            source,
            target,
            pool,
            state,
            tables: HashMap::new(),
            settings,
            cancel: CancellationToken::new(),
            settled_tx: None,
        }
    }

    /// Stop claiming when `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Forward settled tables (after their state is recorded) to `tx`.
    pub fn with_settled_channel(mut self, tx: mpsc::UnboundedSender<Settled>) -> Self {
        self.settled_tx = Some(tx);
        self
    }

    /// Register a table whose chunks may be claimed from the pool.
    pub fn add_table(&mut self, table: Arc<TableDescriptor>, caster: RowCaster) {
        self.tables.insert(
            table.name().to_string(),
            TableJob {
                table,
                caster: Arc::new(caster),
            },
        );
    }

    /// Run workers until the pool is exhausted or the run is cancelled.
    ///
    /// Per-table failures are recorded and do not end the run; errors that
    /// make the pool or state log untrustworthy stop every worker and are
    /// returned.
    pub async fn run(self) -> Result<TransferSummary> {
        let start = Instant::now();
        let workers = self.settings.workers.max(1);
        let shared = Arc::new(Shared {
            source: self.source,
            target: self.target,
            pool: self.pool,
            state: self.state,
            tables: self.tables,
            settings: self.settings,
            cancel: self.cancel,
            abort: CancellationToken::new(),
            counters: Counters::default(),
            rows_by_table: Mutex::new(HashMap::new()),
            settled_tx: self.settled_tx,
        });

        info!(
            "Starting transfer: {} workers, {} tables",
            workers,
            shared.tables.len()
        );

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let shared = shared.clone();
            let worker_id = format!("worker-{}", i + 1);
            handles.push(tokio::spawn(async move {
                let result = worker_loop(&shared, &worker_id).await;
                if result.is_err() {
                    shared.abort.cancel();
                }
                result
            }));
        }

        let mut first_error = None;
        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(MigrateError::pool(
                    format!("worker task failed: {}", e),
                    "transfer scheduler",
                )),
            };
            if let Err(e) = result {
                shared.abort.cancel();
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        // tables settled by the last completions
        forward_settled(&shared).await?;

        let c = &shared.counters;
        let summary = TransferSummary {
            chunks_completed: c.completed.load(Ordering::Relaxed),
            chunks_retried: c.retried.load(Ordering::Relaxed),
            chunks_failed: c.failed.load(Ordering::Relaxed),
            stale_completions: c.stale.load(Ordering::Relaxed),
            chunks_abandoned: c.abandoned.load(Ordering::Relaxed),
            rows: c.rows.load(Ordering::Relaxed),
            rows_by_table: shared.rows_by_table.lock().await.clone(),
            cancelled: shared.cancel.is_cancelled(),
            elapsed: start.elapsed(),
        };

        let secs = summary.elapsed.as_secs_f64();
        let rows_per_sec = if secs > 0.0 {
            (summary.rows as f64 / secs) as u64
        } else {
            0
        };
        info!(
            "Transfer finished in {:?}: {} chunks, {} rows ({} rows/sec), {} retried, {} failed",
            summary.elapsed,
            summary.chunks_completed,
            summary.rows,
            rows_per_sec,
            summary.chunks_retried,
            summary.chunks_failed
        );
        Ok(summary)
    }
}

async fn worker_loop(shared: &Shared, worker_id: &str) -> Result<()> {
    loop {
        forward_settled(shared).await?;

        if shared.cancel.is_cancelled() || shared.abort.is_cancelled() {
            debug!("{}: stopping", worker_id);
            return Ok(());
        }

        match shared.pool.claim_next(worker_id).await? {
            Claim::Chunk(chunk) => process_chunk(shared, worker_id, chunk).await?,
            Claim::Wait(d) => {
                tokio::select! {
                    _ = shared.pool.wait(d) => {}
                    _ = shared.cancel.cancelled() => {}
                    _ = shared.abort.cancelled() => {}
                }
            }
            Claim::Exhausted => {
                debug!("{}: no work left", worker_id);
                return Ok(());
            }
        }
    }
}

/// Record settled tables in the state log and pass them on.
async fn forward_settled(shared: &Shared) -> Result<()> {
    for event in shared.pool.drain_settled().await {
        match &event {
            Settled::AllDone { table } => {
                shared.state.mark_done(table, Stage::DataLoaded).await?;
            }
            Settled::Failed { table, reason } => {
                shared
                    .state
                    .mark_failed(table, Stage::DataLoaded, reason)
                    .await?;
            }
        }
        if let Some(tx) = &shared.settled_tx {
            // finaliser gone means the run is shutting down
            let _ = tx.send(event);
        }
    }
    Ok(())
}

async fn process_chunk(shared: &Shared, worker_id: &str, chunk: WorkChunk) -> Result<()> {
    let Some(job) = shared.tables.get(&chunk.table) else {
        let reason = "table is not part of this run";
        if !shared.pool.fail_permanently(&chunk, reason).await? {
            shared.pool.halt_table(&chunk.table, reason).await;
        }
        return Ok(());
    };

    debug!(
        "{}: {} {} (attempt {})",
        worker_id,
        chunk.label(),
        chunk.range,
        chunk.attempt
    );

    let lost = CancellationToken::new();
    let heartbeat = spawn_heartbeat(
        shared.pool.clone(),
        chunk.clone(),
        shared.settings.heartbeat,
        lost.clone(),
    );

    let outcome = attempt(shared, job, &chunk, &lost).await;
    heartbeat.abort();

    match outcome {
        Outcome::Committed(rows) => {
            if shared.pool.complete(&chunk).await? {
                shared.counters.completed.fetch_add(1, Ordering::Relaxed);
                shared.counters.rows.fetch_add(rows, Ordering::Relaxed);
                *shared
                    .rows_by_table
                    .lock()
                    .await
                    .entry(chunk.table.clone())
                    .or_default() += rows;
                debug!("{}: {} done ({} rows)", worker_id, chunk.label(), rows);
            } else {
                shared.counters.stale.fetch_add(1, Ordering::Relaxed);
            }
        }
        Outcome::Abandoned => {
            shared.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{}: abandoning {} in flight; it will be reclaimed after its lease expires",
                worker_id,
                chunk.label()
            );
        }
        Outcome::Failed(e) if e.is_global() => return Err(e),
        Outcome::Failed(e) if e.is_transient() => {
            let message = e.to_string();
            match shared.pool.fail(&chunk, &message).await? {
                Some(ChunkStatus::Failed) => {
                    shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!("{}: retries exhausted: {}", chunk.label(), message);
                }
                Some(_) => {
                    shared.counters.retried.fetch_add(1, Ordering::Relaxed);
                    warn!("{}: transient failure, will retry: {}", chunk.label(), message);
                }
                None => {}
            }
        }
        Outcome::Failed(e) => {
            let message = e.to_string();
            error!("{}: fatal data error: {}", chunk.label(), message);
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            shared.pool.fail_permanently(&chunk, &message).await?;
        }
    }
    Ok(())
}

/// Stream one chunk from source to target, honouring timeout and cancellation.
async fn attempt(shared: &Shared, job: &TableJob, chunk: &WorkChunk, lost: &CancellationToken) -> Outcome {
    let work = async {
        let rows = shared.source.read_chunk(
            job.table.clone(),
            chunk.range.clone(),
            shared.settings.batch_size,
        );
        let rows = cast_stream(job.caster.clone(), rows, shared.settings.read_ahead);
        shared.target.write_chunk(&job.table, chunk, rows).await
    };
    let work = async {
        match shared.settings.chunk_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Err(MigrateError::ChunkTransient {
                    table: chunk.table.clone(),
                    chunk_id: chunk.chunk_id,
                    message: format!("timed out after {:?}", limit),
                }),
            },
            None => work.await,
        }
    };
    tokio::pin!(work);

    let result = tokio::select! {
        result = &mut work => result,
        _ = lost.cancelled() => Err(MigrateError::ChunkTransient {
            table: chunk.table.clone(),
            chunk_id: chunk.chunk_id,
            message: "lease lost to another worker".to_string(),
        }),
        _ = shared.abort.cancelled() => return Outcome::Abandoned,
        _ = shared.cancel.cancelled() => {
            let grace = shared.settings.shutdown_grace;
            info!("{}: finishing in-flight chunk (grace {:?})", chunk.label(), grace);
            tokio::select! {
                result = tokio::time::timeout(grace, &mut work) => match result {
                    Ok(result) => result,
                    Err(_) => return Outcome::Abandoned,
                },
                _ = shared.abort.cancelled() => return Outcome::Abandoned,
            }
        }
    };

    match result {
        Ok(rows) => Outcome::Committed(rows),
        Err(e) => Outcome::Failed(e),
    }
}

/// Renew the chunk's lease until aborted; cancels `lost` if another worker
/// took the chunk over.
fn spawn_heartbeat(
    pool: Arc<WorkPool>,
    chunk: WorkChunk,
    every: Duration,
    lost: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        loop {
            tick.tick().await;
            match pool.renew_lease(&chunk).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("{}: lease lost, aborting attempt {}", chunk.label(), chunk.attempt);
                    lost.cancel();
                    return;
                }
                Err(e) => warn!("{}: lease renewal failed: {}", chunk.label(), e),
            }
        }
    })
}
