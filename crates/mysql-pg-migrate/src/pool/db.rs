//! Work pool stored in PostgreSQL, next to the state log.
//!
//! One row per chunk in `<state_schema>.data_pool`. Ranges are kept as JSON
//! text so integer and text keys share one column.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use super::chunk::{ChunkRange, ChunkStatus, WorkChunk};
use super::store::PoolStore;
use crate::core::identifier::quote_pg;
use crate::error::{MigrateError, Result};

/// PostgreSQL-backed pool store.
pub struct PgPoolStore {
    pool: Pool,
    table: String,
    schema: String,
}

impl PgPoolStore {
    pub fn new(pool: Pool, schema: &str) -> Result<Self> {
        let schema = quote_pg(schema)?;
        Ok(Self {
            pool,
            table: format!("{}.data_pool", schema),
            schema,
        })
    }

    const COLUMNS: &'static str = "table_name, chunk_id, range_json, estimated_rows, status, \
         retry_count, attempt, worker_id, claimed_at, not_before, error";

    fn upsert_sql(&self) -> String {
        format!(
            "INSERT INTO {} ({})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (table_name, chunk_id) DO UPDATE SET
                range_json = EXCLUDED.range_json,
                estimated_rows = EXCLUDED.estimated_rows,
                status = EXCLUDED.status,
                retry_count = EXCLUDED.retry_count,
                attempt = EXCLUDED.attempt,
                worker_id = EXCLUDED.worker_id,
                claimed_at = EXCLUDED.claimed_at,
                not_before = EXCLUDED.not_before,
                error = EXCLUDED.error,
                updated_at = NOW()",
            self.table,
            Self::COLUMNS
        )
    }
}

fn row_to_chunk(row: &Row) -> Result<WorkChunk> {
    let range_json: String = row.get(2);
    let range: ChunkRange = serde_json::from_str(&range_json)?;
    let status: String = row.get(4);
    let retry_count: i32 = row.get(5);
    let attempt: i32 = row.get(6);

    Ok(WorkChunk {
        table: row.get(0),
        chunk_id: row.get(1),
        range,
        estimated_rows: row.get(3),
        status: ChunkStatus::parse(&status)?,
        retry_count: retry_count.max(0) as u32,
        attempt: attempt.max(0) as u32,
        worker_id: row.get(7),
        claimed_at: row.get::<_, Option<DateTime<Utc>>>(8),
        not_before: row.get::<_, Option<DateTime<Utc>>>(9),
        error: row.get(10),
    })
}

#[async_trait]
impl PoolStore for PgPoolStore {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;

        conn.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema), &[])
            .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    table_name TEXT NOT NULL,
                    chunk_id BIGINT NOT NULL,
                    range_json TEXT NOT NULL,
                    estimated_rows BIGINT NOT NULL DEFAULT 0,
                    status TEXT NOT NULL CHECK (status IN ('pending', 'in_progress', 'done', 'failed')),
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    attempt INTEGER NOT NULL DEFAULT 0,
                    worker_id TEXT,
                    claimed_at TIMESTAMPTZ,
                    not_before TIMESTAMPTZ,
                    error TEXT,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (table_name, chunk_id)
                )",
                self.table
            ),
            &[],
        )
        .await?;

        Ok(())
    }

    async fn replace_chunks(&self, table: &str, chunks: &[WorkChunk]) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            &format!("DELETE FROM {} WHERE table_name = $1", self.table),
            &[&table],
        )
        .await?;

        let stmt = tx.prepare(&self.upsert_sql()).await?;
        for chunk in chunks {
            let range_json = serde_json::to_string(&chunk.range)?;
            tx.execute(
                &stmt,
                &[
                    &chunk.table,
                    &chunk.chunk_id,
                    &range_json,
                    &chunk.estimated_rows,
                    &chunk.status.as_str(),
                    &(chunk.retry_count as i32),
                    &(chunk.attempt as i32),
                    &chunk.worker_id,
                    &chunk.claimed_at,
                    &chunk.not_before,
                    &chunk.error,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_chunk(&self, chunk: &WorkChunk) -> Result<()> {
        let conn = self.pool.get().await?;
        let range_json = serde_json::to_string(&chunk.range)?;
        conn.execute(
            &self.upsert_sql(),
            &[
                &chunk.table,
                &chunk.chunk_id,
                &range_json,
                &chunk.estimated_rows,
                &chunk.status.as_str(),
                &(chunk.retry_count as i32),
                &(chunk.attempt as i32),
                &chunk.worker_id,
                &chunk.claimed_at,
                &chunk.not_before,
                &chunk.error,
            ],
        )
        .await?;
        Ok(())
    }

    async fn load_chunks(&self, table: &str) -> Result<Vec<WorkChunk>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM {} WHERE table_name = $1 ORDER BY chunk_id",
                    Self::COLUMNS,
                    self.table
                ),
                &[&table],
            )
            .await?;

        rows.iter()
            .map(|row| {
                row_to_chunk(row).map_err(|e| {
                    MigrateError::State(format!("corrupt work pool row for {}: {}", table, e))
                })
            })
            .collect()
    }

    async fn clear(&self, table: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!("DELETE FROM {} WHERE table_name = $1", self.table),
            &[&table],
        )
        .await?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(&format!("DELETE FROM {}", self.table), &[]).await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
