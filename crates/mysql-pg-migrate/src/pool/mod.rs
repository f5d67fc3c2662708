//! Work pool: divides tables into chunks and hands them to workers.
//!
//! All chunk state lives behind one async mutex and is written through to a
//! [`PoolStore`] before any transition becomes visible, so a restarted
//! process sees exactly what the previous one committed. Claims rotate
//! across tables and respect an optional per-table worker limit. A claim
//! whose lease expires counts as a failed attempt and is requeued.

mod chunk;
mod db;
mod memory;
mod store;

pub use chunk::{
    integer_ranges, number_chunks, position_ranges, sampled_ranges, validate_coverage, ChunkRange,
    ChunkStatus, WorkChunk,
};
pub use db::PgPoolStore;
pub use memory::MemoryPoolStore;
pub use store::PoolStore;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::MigrationConfig;
use crate::core::schema::{ChunkKey, TableDescriptor};
use crate::core::traits::SourceReader;
use crate::error::{MigrateError, Result};

/// Longest a worker parks before re-checking the pool.
const MAX_WAIT: Duration = Duration::from_millis(500);

/// Retry and concurrency limits applied by the pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Failed attempts allowed before a chunk is permanently failed.
    pub max_retries: u32,
    /// How long a claim stays valid without renewal.
    pub lease: Duration,
    /// Base retry delay; doubles with every failed attempt.
    pub retry_backoff: Duration,
    /// Cap on concurrent claims per table.
    pub max_workers_per_table: Option<usize>,
}

impl PoolSettings {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            lease: Duration::from_secs(config.lease_seconds.max(1)),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_workers_per_table: config.max_workers_per_table,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            lease: Duration::from_secs(600),
            retry_backoff: Duration::from_millis(500),
            max_workers_per_table: None,
        }
    }
}

/// Outcome of [`WorkPool::claim_next`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// A chunk now leased to the caller.
    Chunk(WorkChunk),
    /// Nothing claimable yet; chunks are in flight or backing off.
    Wait(Duration),
    /// No table has work left.
    Exhausted,
}

/// A table reached a final data-stage outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    /// Every chunk is Done.
    AllDone { table: String },
    /// The table stopped loading.
    Failed { table: String, reason: String },
}

impl Settled {
    pub fn table(&self) -> &str {
        match self {
            Settled::AllDone { table } | Settled::Failed { table, .. } => table,
        }
    }
}

/// Chunk counts for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolProgress {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    pub estimated_rows: i64,
    pub done_rows: i64,
}

#[derive(Debug, Default)]
struct TableEntry {
    chunks: BTreeMap<i64, WorkChunk>,
    halted: Option<String>,
    settled: bool,
}

impl TableEntry {
    fn in_progress(&self) -> usize {
        self.chunks
            .values()
            .filter(|c| c.status == ChunkStatus::InProgress)
            .count()
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    tables: BTreeMap<String, TableEntry>,
    cursor: usize,
    settled: Vec<Settled>,
}

/// Shared pool of work chunks.
pub struct WorkPool {
    inner: Mutex<PoolInner>,
    store: Arc<dyn PoolStore>,
    settings: PoolSettings,
    notify: Notify,
}

impl WorkPool {
    pub fn new(store: Arc<dyn PoolStore>, settings: PoolSettings) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            store,
            settings,
            notify: Notify::new(),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Create the backing storage.
    pub async fn init(&self) -> Result<()> {
        self.store.init_schema().await
    }

    /// Divide a table into chunks of at most `chunk_rows` expected rows and
    /// persist them, replacing any earlier layout for the table.
    pub async fn populate(
        &self,
        source: &dyn SourceReader,
        table: &TableDescriptor,
        chunk_rows: i64,
    ) -> Result<usize> {
        let chunks = plan_chunks(source, table, chunk_rows).await?;
        let count = chunks.len();
        self.insert_table(table.name(), chunks).await?;
        info!("{}: {} chunks planned ({:?})", table.name(), count, table.chunk_key);
        Ok(count)
    }

    /// Persist and adopt a precomputed chunk layout.
    pub async fn insert_table(&self, table: &str, chunks: Vec<WorkChunk>) -> Result<()> {
        validate_coverage(table, &chunks)?;

        let mut inner = self.inner.lock().await;
        self.store.replace_chunks(table, &chunks).await?;
        let entry = TableEntry {
            chunks: chunks.into_iter().map(|c| (c.chunk_id, c)).collect(),
            ..Default::default()
        };
        inner.tables.insert(table.to_string(), entry);
        Self::check_settled(&mut inner, table);
        drop(inner);

        self.notify.notify_waiters();
        Ok(())
    }

    /// Adopt the persisted chunks of a table. Returns the chunk count, zero
    /// when nothing was stored.
    pub async fn load(&self, table: &str) -> Result<usize> {
        let chunks = self.store.load_chunks(table).await?;
        if chunks.is_empty() {
            return Ok(0);
        }
        validate_coverage(table, &chunks)?;

        let count = chunks.len();
        let mut inner = self.inner.lock().await;
        let entry = TableEntry {
            chunks: chunks.into_iter().map(|c| (c.chunk_id, c)).collect(),
            ..Default::default()
        };
        inner.tables.insert(table.to_string(), entry);
        Self::check_settled(&mut inner, table);
        drop(inner);

        self.notify.notify_waiters();
        Ok(count)
    }

    /// Give permanently failed chunks of a table a fresh retry budget.
    pub async fn requeue_failed(&self, table: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.tables.get_mut(table) else {
            return Ok(0);
        };

        let mut requeued = 0;
        for chunk in entry.chunks.values_mut() {
            if chunk.status == ChunkStatus::Failed {
                chunk.status = ChunkStatus::Pending;
                chunk.retry_count = 0;
                chunk.not_before = None;
                chunk.worker_id = None;
                self.store.update_chunk(chunk).await?;
                requeued += 1;
            }
        }
        if requeued > 0 {
            entry.halted = None;
            entry.settled = false;
            // a failure queued by `load` no longer applies
            inner.settled.retain(|s| s.table() != table);
            info!("{}: requeued {} failed chunks", table, requeued);
        }
        drop(inner);

        self.notify.notify_waiters();
        Ok(requeued)
    }

    /// Lease the next claimable chunk to `worker_id`.
    ///
    /// Expired leases are reclaimed first. Tables are visited round-robin
    /// starting after the table of the previous claim.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Claim> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        self.reclaim_expired(&mut inner, now).await?;

        let names: Vec<String> = inner.tables.keys().cloned().collect();
        if names.is_empty() {
            return Ok(Claim::Exhausted);
        }

        let mut wait: Option<Duration> = None;
        let mut note_wait = |d: Duration| {
            wait = Some(wait.map_or(d, |w| w.min(d)));
        };

        let start = inner.cursor % names.len();
        for offset in 0..names.len() {
            let idx = (start + offset) % names.len();
            let name = &names[idx];
            let Some(entry) = inner.tables.get_mut(name) else {
                continue;
            };
            if entry.halted.is_some() {
                continue;
            }

            let in_progress = entry.in_progress();
            for chunk in entry.chunks.values() {
                if chunk.status == ChunkStatus::InProgress {
                    let expires = lease_expiry(chunk, self.settings.lease);
                    note_wait(until(now, expires));
                }
            }

            let limited = self
                .settings
                .max_workers_per_table
                .map(|max| in_progress >= max)
                .unwrap_or(false);

            let mut claimable = None;
            for chunk in entry.chunks.values() {
                if chunk.status != ChunkStatus::Pending {
                    continue;
                }
                match chunk.not_before {
                    Some(t) if t > now => note_wait(until(now, t)),
                    _ if limited => note_wait(MAX_WAIT),
                    _ => {
                        claimable = Some(chunk.chunk_id);
                        break;
                    }
                }
            }

            if let Some(chunk_id) = claimable {
                let Some(chunk) = entry.chunks.get_mut(&chunk_id) else {
                    continue;
                };
                chunk.status = ChunkStatus::InProgress;
                chunk.attempt += 1;
                chunk.worker_id = Some(worker_id.to_string());
                chunk.claimed_at = Some(now);
                chunk.not_before = None;
                self.store.update_chunk(chunk).await?;

                let claimed = chunk.clone();
                inner.cursor = idx + 1;
                debug!(
                    "{} claimed {} (attempt {})",
                    worker_id,
                    claimed.label(),
                    claimed.attempt
                );
                return Ok(Claim::Chunk(claimed));
            }
        }

        Ok(match wait {
            Some(d) => Claim::Wait(d.min(MAX_WAIT)),
            None => Claim::Exhausted,
        })
    }

    /// Record a committed chunk. Returns false when the claim was stale
    /// (the lease expired and the chunk was reclaimed), in which case
    /// nothing changes.
    pub async fn complete(&self, chunk: &WorkChunk) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(current) = Self::current_claim(&mut inner, chunk) else {
            warn!(
                "Ignoring stale completion of {} (attempt {})",
                chunk.label(),
                chunk.attempt
            );
            return Ok(false);
        };

        current.status = ChunkStatus::Done;
        current.worker_id = None;
        current.error = None;
        self.store.update_chunk(current).await?;

        Self::check_settled(&mut inner, &chunk.table);
        drop(inner);

        self.notify.notify_waiters();
        Ok(true)
    }

    /// Record a failed attempt. The chunk returns to Pending with backoff,
    /// or becomes permanently Failed once retries are exhausted, which halts
    /// its table. Returns the resulting status, or None for a stale claim.
    pub async fn fail(&self, chunk: &WorkChunk, error: &str) -> Result<Option<ChunkStatus>> {
        let mut inner = self.inner.lock().await;
        let Some(current) = Self::current_claim(&mut inner, chunk) else {
            warn!("Ignoring stale failure of {}", chunk.label());
            return Ok(None);
        };

        let status = Self::apply_failure(current, error, &self.settings, Utc::now());
        self.store.update_chunk(current).await?;

        if status == ChunkStatus::Failed {
            let reason = format!(
                "chunk {} failed after {} attempts: {}",
                chunk.chunk_id,
                self.settings.max_retries + 1,
                error
            );
            Self::halt(&mut inner, &chunk.table, reason);
        }
        drop(inner);

        self.notify.notify_waiters();
        Ok(Some(status))
    }

    /// Mark a chunk permanently Failed without retrying and halt its table.
    /// Returns false for a stale claim, which changes nothing.
    pub async fn fail_permanently(&self, chunk: &WorkChunk, error: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(current) = Self::current_claim(&mut inner, chunk) else {
            warn!("Ignoring stale fatal error of {}: {}", chunk.label(), error);
            return Ok(false);
        };
        current.status = ChunkStatus::Failed;
        current.worker_id = None;
        current.error = Some(error.to_string());
        self.store.update_chunk(current).await?;

        Self::halt(&mut inner, &chunk.table, format!("chunk {}: {}", chunk.chunk_id, error));
        drop(inner);

        self.notify.notify_waiters();
        Ok(true)
    }

    /// Stop serving chunks of a table. Pending chunks stay Pending in the
    /// store so a later resume can pick them up.
    pub async fn halt_table(&self, table: &str, reason: &str) {
        let mut inner = self.inner.lock().await;
        Self::halt(&mut inner, table, reason.to_string());
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Extend the lease of a claim still held by the caller.
    pub async fn renew_lease(&self, chunk: &WorkChunk) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(current) = Self::current_claim(&mut inner, chunk) else {
            return Ok(false);
        };
        current.claimed_at = Some(Utc::now());
        self.store.update_chunk(current).await?;
        Ok(true)
    }

    /// Tables that reached a final outcome since the last call.
    pub async fn drain_settled(&self) -> Vec<Settled> {
        std::mem::take(&mut self.inner.lock().await.settled)
    }

    /// Park until the pool changes or `timeout` passes.
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    /// Chunk counts for a table.
    pub async fn progress(&self, table: &str) -> PoolProgress {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|entry| progress_of(entry.chunks.values()))
            .unwrap_or_default()
    }

    /// Snapshot of a table's chunks.
    pub async fn chunks(&self, table: &str) -> Vec<WorkChunk> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|entry| entry.chunks.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Chunk counts for a table read straight from the store.
    pub async fn stored_progress(&self, table: &str) -> Result<PoolProgress> {
        let chunks = self.store.load_chunks(table).await?;
        Ok(progress_of(chunks.iter()))
    }

    /// Forget a table and delete its stored chunks.
    pub async fn clear(&self, table: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.store.clear(table).await?;
        inner.tables.remove(table);
        Ok(())
    }

    /// Forget every table and delete all stored chunks.
    pub async fn clear_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.store.clear_all().await?;
        *inner = PoolInner::default();
        Ok(())
    }

    async fn reclaim_expired(&self, inner: &mut PoolInner, now: DateTime<Utc>) -> Result<()> {
        let mut halted = Vec::new();
        for (name, entry) in inner.tables.iter_mut() {
            if entry.halted.is_some() {
                continue;
            }
            for chunk in entry.chunks.values_mut() {
                if chunk.status != ChunkStatus::InProgress
                    || lease_expiry(chunk, self.settings.lease) > now
                {
                    continue;
                }
                warn!(
                    "Lease expired for {} held by {}; requeueing",
                    chunk.label(),
                    chunk.worker_id.as_deref().unwrap_or("unknown")
                );
                let status = Self::apply_failure(chunk, "lease expired", &self.settings, now);
                self.store.update_chunk(chunk).await?;
                if status == ChunkStatus::Failed {
                    halted.push((
                        name.clone(),
                        format!("chunk {} lease expired too often", chunk.chunk_id),
                    ));
                }
            }
        }
        for (table, reason) in halted {
            Self::halt(inner, &table, reason);
        }
        Ok(())
    }

    fn apply_failure(
        chunk: &mut WorkChunk,
        error: &str,
        settings: &PoolSettings,
        now: DateTime<Utc>,
    ) -> ChunkStatus {
        chunk.retry_count += 1;
        chunk.worker_id = None;
        chunk.error = Some(error.to_string());

        if chunk.retry_count > settings.max_retries {
            chunk.status = ChunkStatus::Failed;
            chunk.not_before = None;
        } else {
            chunk.status = ChunkStatus::Pending;
            let factor = 1u32 << (chunk.retry_count - 1).min(16);
            let delay = settings.retry_backoff.saturating_mul(factor);
            chunk.not_before = chrono::Duration::from_std(delay).ok().map(|d| now + d);
        }
        chunk.status
    }

    fn current_claim<'a>(inner: &'a mut PoolInner, chunk: &WorkChunk) -> Option<&'a mut WorkChunk> {
        inner
            .tables
            .get_mut(&chunk.table)
            .and_then(|entry| entry.chunks.get_mut(&chunk.chunk_id))
            .filter(|c| c.status == ChunkStatus::InProgress && c.attempt == chunk.attempt)
    }

    fn halt(inner: &mut PoolInner, table: &str, reason: String) {
        let Some(entry) = inner.tables.get_mut(table) else {
            return;
        };
        if entry.halted.is_none() {
            warn!("{}: halting data load: {}", table, reason);
            entry.halted = Some(reason.clone());
        }
        if !entry.settled {
            entry.settled = true;
            inner.settled.push(Settled::Failed {
                table: table.to_string(),
                reason,
            });
        }
    }

    fn check_settled(inner: &mut PoolInner, table: &str) {
        let Some(entry) = inner.tables.get_mut(table) else {
            return;
        };
        if entry.settled {
            return;
        }

        let progress = progress_of(entry.chunks.values());
        if progress.done == progress.total {
            entry.settled = true;
            inner.settled.push(Settled::AllDone {
                table: table.to_string(),
            });
        } else if progress.failed > 0 && progress.pending + progress.in_progress == 0 {
            entry.settled = true;
            let reason = entry
                .chunks
                .values()
                .filter_map(|c| c.error.clone())
                .last()
                .unwrap_or_else(|| "chunks failed".to_string());
            entry.halted.get_or_insert_with(|| reason.clone());
            inner.settled.push(Settled::Failed {
                table: table.to_string(),
                reason,
            });
        }
    }
}

fn lease_expiry(chunk: &WorkChunk, lease: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(36_500));
    chunk
        .claimed_at
        .and_then(|t| t.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

fn progress_of<'a>(chunks: impl Iterator<Item = &'a WorkChunk>) -> PoolProgress {
    let mut progress = PoolProgress::default();
    for chunk in chunks {
        progress.total += 1;
        progress.estimated_rows += chunk.estimated_rows;
        match chunk.status {
            ChunkStatus::Pending => progress.pending += 1,
            ChunkStatus::InProgress => progress.in_progress += 1,
            ChunkStatus::Done => {
                progress.done += 1;
                progress.done_rows += chunk.estimated_rows;
            }
            ChunkStatus::Failed => progress.failed += 1,
        }
    }
    progress
}

/// Compute the chunk layout for a table from its key statistics.
pub async fn plan_chunks(
    source: &dyn SourceReader,
    table: &TableDescriptor,
    chunk_rows: i64,
) -> Result<Vec<WorkChunk>> {
    let chunk_rows = chunk_rows.max(1);
    let stats = source.key_stats(table).await?;

    let ranges = match &table.chunk_key {
        ChunkKey::Integer { column } => match (&stats.min, &stats.max) {
            (Some(min), Some(max)) => {
                let (Some(min), Some(max)) = (min.as_int(), max.as_int()) else {
                    return Err(MigrateError::schema_parse(
                        table.name(),
                        format!("integer key {} returned non-integer bounds", column),
                    ));
                };
                integer_ranges(min, max, stats.row_count, chunk_rows)
            }
            _ => vec![(ChunkRange::full_key(), stats.row_count)],
        },
        ChunkKey::Ordered { .. } => {
            if stats.row_count <= chunk_rows {
                vec![(ChunkRange::full_key(), stats.row_count)]
            } else {
                let count = ((stats.row_count - 1) / chunk_rows) as usize;
                let boundaries = source.sample_boundaries(table, chunk_rows, count).await?;
                sampled_ranges(boundaries, stats.row_count, chunk_rows)
            }
        }
        ChunkKey::RowPosition { order_by } => {
            if order_by.is_empty() {
                warn!(
                    "{}: no primary or unique key; row-position chunks may miss or \
                     repeat rows if the source changes during the migration",
                    table.name()
                );
            }
            position_ranges(stats.row_count, chunk_rows)
        }
    };

    Ok(number_chunks(table.name(), ranges))
}
