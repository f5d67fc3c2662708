//! Database-backed state storage for migration runs.
//!
//! Stores the state log in PostgreSQL tables within the state schema
//! (`_mysql_pg_migrate` by default) on the target server:
//! - `state_logs`: one row per table with stage completion timestamps
//! - `migration_runs`: one row per `run`/`resume` invocation
//!
//! Every write commits before returning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use super::backend::StateBackend;
use super::{RunInfo, RunStatus, Stage, StateRecord};
use crate::core::identifier::quote_pg;
use crate::error::Result;

/// Database state backend.
pub struct PgStateBackend {
    pool: Pool,
    schema: String,
}

impl PgStateBackend {
    /// Create a backend storing its tables in `schema`.
    pub fn new(pool: Pool, schema: &str) -> Result<Self> {
        Ok(Self {
            pool,
            schema: quote_pg(schema)?,
        })
    }
}

fn row_to_record(row: &Row) -> Result<StateRecord> {
    let failed_stage: Option<String> = row.get(5);
    let started_stage: Option<String> = row.get(8);
    Ok(StateRecord {
        table: row.get(0),
        schema_created: row.get(1),
        data_loaded: row.get(2),
        indexes_built: row.get(3),
        constraints_applied: row.get(4),
        started_stage: started_stage.as_deref().map(Stage::parse).transpose()?,
        failed_stage: failed_stage.as_deref().map(Stage::parse).transpose()?,
        error: row.get(6),
        updated_at: row.get(7),
    })
}

#[async_trait]
impl StateBackend for PgStateBackend {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;

        conn.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema), &[])
            .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.state_logs (
                    table_name TEXT PRIMARY KEY,
                    schema_created TIMESTAMPTZ,
                    data_loaded TIMESTAMPTZ,
                    indexes_built TIMESTAMPTZ,
                    constraints_applied TIMESTAMPTZ,
                    failed_stage TEXT,
                    error TEXT,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    started_stage TEXT
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "ALTER TABLE {}.state_logs ADD COLUMN IF NOT EXISTS started_stage TEXT",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.migration_runs (
                    run_id TEXT PRIMARY KEY,
                    plan_hash TEXT NOT NULL,
                    started_at TIMESTAMPTZ NOT NULL,
                    completed_at TIMESTAMPTZ,
                    status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed', 'cancelled'))
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        // Create index for latest run lookups
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_migration_runs_latest
                    ON {}.migration_runs(started_at DESC)",
                self.schema
            ),
            &[],
        )
        .await?;

        Ok(())
    }

    async fn load_records(&self) -> Result<Vec<StateRecord>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT table_name, schema_created, data_loaded, indexes_built,
                            constraints_applied, failed_stage, error, updated_at,
                            started_stage
                     FROM {}.state_logs
                     ORDER BY table_name",
                    self.schema
                ),
                &[],
            )
            .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn save_record(&self, record: &StateRecord) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "INSERT INTO {}.state_logs
                 (table_name, schema_created, data_loaded, indexes_built,
                  constraints_applied, failed_stage, error, updated_at, started_stage)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (table_name) DO UPDATE SET
                    schema_created = EXCLUDED.schema_created,
                    data_loaded = EXCLUDED.data_loaded,
                    indexes_built = EXCLUDED.indexes_built,
                    constraints_applied = EXCLUDED.constraints_applied,
                    failed_stage = EXCLUDED.failed_stage,
                    error = EXCLUDED.error,
                    updated_at = EXCLUDED.updated_at,
                    started_stage = EXCLUDED.started_stage",
                self.schema
            ),
            &[
                &record.table,
                &record.schema_created,
                &record.data_loaded,
                &record.indexes_built,
                &record.constraints_applied,
                &record.failed_stage.map(|s| s.as_str()),
                &record.error,
                &record.updated_at,
                &record.started_stage.map(|s| s.as_str()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(&format!("DELETE FROM {}.state_logs", self.schema), &[])
            .await?;
        Ok(())
    }

    async fn save_run(&self, run: &RunInfo) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "INSERT INTO {}.migration_runs (run_id, plan_hash, started_at, completed_at, status)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (run_id) DO UPDATE SET
                    completed_at = EXCLUDED.completed_at,
                    status = EXCLUDED.status",
                self.schema
            ),
            &[
                &run.run_id,
                &run.plan_hash,
                &run.started_at,
                &run.completed_at,
                &run.status.as_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn load_latest_run(&self) -> Result<Option<RunInfo>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT run_id, plan_hash, started_at, completed_at, status
                     FROM {}.migration_runs
                     ORDER BY started_at DESC
                     LIMIT 1",
                    self.schema
                ),
                &[],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.get(4);
        Ok(Some(RunInfo {
            run_id: row.get(0),
            plan_hash: row.get(1),
            started_at: row.get::<_, DateTime<Utc>>(2),
            completed_at: row.get::<_, Option<DateTime<Utc>>>(3),
            status: RunStatus::parse(&status)?,
        }))
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
