//! PostgreSQL target writer.
//!
//! Implements [`TargetWriter`] over a deadpool-postgres pool. Each chunk is
//! loaded with text-format `COPY` inside one transaction guarded by a
//! transaction-scoped advisory lock on (table, chunk id), so two claims of
//! the same chunk can never interleave and nothing is visible until the
//! whole chunk commits.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Transaction};
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use super::copy::encode_row;
use super::tls::{make_connector, SslMode};
use crate::config::TargetConfig;
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::schema::{ChunkKey, TableDescriptor};
use crate::core::traits::TargetWriter;
use crate::core::value::Batch;
use crate::error::{MigrateError, Result};
use crate::pool::{ChunkRange, WorkChunk};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Flush the COPY buffer once it grows past this many bytes.
const COPY_FLUSH_BYTES: usize = 1 << 20;

/// Session-local staging table for re-attempted chunks.
const STAGE_TABLE: &str = "_migrate_chunk_stage";

/// How a chunk write protects against rows left by an earlier attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reattempt {
    /// First attempt: plain COPY into the table.
    Fresh,
    /// Integer key: delete the chunk's range before loading.
    DeleteRange(String),
    /// Other keys: load into a staging table, delete matching keys, insert.
    Stage { key_columns: Vec<String> },
    /// Unordered table: no key to deduplicate on.
    Unprotected,
}

/// Decide the re-attempt strategy for a chunk.
pub(crate) fn reattempt_plan(table: &TableDescriptor, chunk: &WorkChunk) -> Result<Reattempt> {
    if !chunk.is_reattempt() {
        return Ok(Reattempt::Fresh);
    }

    match (&table.chunk_key, &chunk.range) {
        (ChunkKey::Integer { column }, ChunkRange::Key { lower, upper }) => {
            let key = quote_pg(table.target_column(column))?;
            let mut conditions = Vec::new();
            if let Some(lower) = lower {
                conditions.push(format!("{} >= {}", key, lower.to_pg_literal()));
            }
            if let Some(upper) = upper {
                conditions.push(format!("{} < {}", key, upper.to_pg_literal()));
            }
            let mut sql = format!(
                "DELETE FROM {}",
                qualify_pg(&table.target_schema, &table.target_name)?
            );
            if !conditions.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&conditions.join(" AND "));
            }
            Ok(Reattempt::DeleteRange(sql))
        }
        // Text ranges follow the source collation, which PostgreSQL may not
        // share, so match on the loaded keys instead of the range.
        (ChunkKey::Ordered { column }, _) => Ok(Reattempt::Stage {
            key_columns: vec![table.target_column(column).to_string()],
        }),
        (ChunkKey::RowPosition { order_by }, _) if !order_by.is_empty() => Ok(Reattempt::Stage {
            key_columns: order_by
                .iter()
                .map(|c| table.target_column(c).to_string())
                .collect(),
        }),
        _ => Ok(Reattempt::Unprotected),
    }
}

/// Quoted target column list in select order.
fn column_list(table: &TableDescriptor) -> Result<String> {
    Ok(table
        .columns
        .iter()
        .map(|c| quote_pg(&c.target_name))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

pub(crate) fn copy_statement(into: &str, columns: &str) -> String {
    format!("COPY {} ({}) FROM STDIN", into, columns)
}

/// Statements that move staged rows into the table, replacing duplicates.
pub(crate) fn merge_statements(
    table: &TableDescriptor,
    key_columns: &[String],
) -> Result<(String, String)> {
    let target = qualify_pg(&table.target_schema, &table.target_name)?;
    let stage = quote_pg(STAGE_TABLE)?;
    let matches = key_columns
        .iter()
        .map(|c| quote_pg(c).map(|q| format!("t.{q} = s.{q}")))
        .collect::<Result<Vec<_>>>()?
        .join(" AND ");
    let columns = column_list(table)?;
    Ok((
        format!("DELETE FROM {} t USING {} s WHERE {}", target, stage, matches),
        format!("INSERT INTO {} ({}) SELECT {} FROM {}", target, columns, columns, stage),
    ))
}

/// PostgreSQL target writer.
#[derive(Clone)]
pub struct PgWriter {
    pool: Pool,
}

impl PgWriter {
    /// Build the pool and verify a connection.
    pub async fn connect(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let pool = build_pool(config, max_conns)?;
        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::connection(config.display_endpoint(), e))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| MigrateError::connection(config.display_endpoint(), e))?;

        info!(
            "Connected to PostgreSQL target: {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    /// The underlying pool, shared with the state and work pool stores.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn copy_rows(
        tx: &Transaction<'_>,
        chunk: &WorkChunk,
        statement: &str,
        mut rows: mpsc::Receiver<Result<Batch>>,
    ) -> Result<u64> {
        let sink = tx.copy_in::<_, Bytes>(statement).await?;
        tokio::pin!(sink);

        let mut buf = BytesMut::with_capacity(64 * 1024);
        let mut complete = false;
        while let Some(batch) = rows.recv().await {
            let batch = batch?;
            for row in &batch.rows {
                encode_row(&mut buf, row);
            }
            if !buf.is_empty() && (buf.len() >= COPY_FLUSH_BYTES || batch.is_last) {
                sink.send(buf.split().freeze()).await?;
            }
            if batch.is_last {
                complete = true;
                break;
            }
        }
        if !complete {
            // Dropping the sink aborts the COPY and the transaction rolls back.
            return Err(MigrateError::ChunkTransient {
                table: chunk.table.clone(),
                chunk_id: chunk.chunk_id,
                message: "row stream ended before the final batch".into(),
            });
        }

        Ok(sink.finish().await?)
    }
}

/// Build a deadpool-postgres pool honouring the target TLS mode.
pub fn build_pool(config: &TargetConfig, max_conns: usize) -> Result<Pool> {
    let mut pg_config = PgConfig::new();
    pg_config.host(&config.host);
    pg_config.port(config.port);
    pg_config.dbname(&config.database);
    pg_config.user(&config.user);
    pg_config.password(&config.password);
    pg_config.application_name("mysql-pg-migrate");
    pg_config.keepalives(true);
    pg_config.keepalives_idle(Duration::from_secs(30));
    pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let mode = SslMode::parse(&config.ssl_mode)?;
    let mgr = match make_connector(mode)? {
        Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
        None => {
            warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
            Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
        }
    };

    Pool::builder(mgr)
        .max_size(max_conns.max(1))
        .wait_timeout(Some(POOL_CONNECTION_TIMEOUT))
        .runtime(deadpool_postgres::Runtime::Tokio1)
        .build()
        .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))
}

#[async_trait]
impl TargetWriter for PgWriter {
    async fn execute(&self, sql: &str) -> Result<()> {
        let client = self.pool.get().await?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    async fn create_schema(&self, schema: &str) -> Result<()> {
        self.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_pg(schema)?))
            .await
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {} CASCADE", qualify_pg(schema, table)?))
            .await?;
        debug!("Dropped table {}.{}", schema, table);
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = $2)",
                &[&schema, &table],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn write_chunk(
        &self,
        table: &TableDescriptor,
        chunk: &WorkChunk,
        rows: mpsc::Receiver<Result<Batch>>,
    ) -> Result<u64> {
        let target = qualify_pg(&table.target_schema, &table.target_name)?;
        let columns = column_list(table)?;
        let plan = reattempt_plan(table, chunk)?;

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let lock_key = format!("{}.{}", table.target_schema, table.target_name);
        let chunk_id = advisory_chunk_key(chunk)?;
        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtext($1), $2)",
            &[&lock_key, &chunk_id],
        )
        .await?;

        let into = match &plan {
            Reattempt::Fresh => target.clone(),
            Reattempt::DeleteRange(sql) => {
                let removed = tx.execute(sql.as_str(), &[]).await?;
                if removed > 0 {
                    info!(
                        "{}: removed {} rows left by an earlier attempt",
                        chunk.label(),
                        removed
                    );
                }
                target.clone()
            }
            Reattempt::Stage { .. } => {
                tx.batch_execute(&format!(
                    "CREATE TEMP TABLE {} (LIKE {}) ON COMMIT DROP",
                    quote_pg(STAGE_TABLE)?,
                    target
                ))
                .await?;
                quote_pg(STAGE_TABLE)?
            }
            Reattempt::Unprotected => {
                warn!(
                    "{}: re-attempt of an unordered chunk may duplicate rows from an earlier attempt",
                    chunk.label()
                );
                target.clone()
            }
        };

        let written = Self::copy_rows(&tx, chunk, &copy_statement(&into, &columns), rows).await?;

        if let Reattempt::Stage { key_columns } = &plan {
            let (delete, insert) = merge_statements(table, key_columns)?;
            let removed = tx.execute(delete.as_str(), &[]).await?;
            if removed > 0 {
                info!(
                    "{}: replaced {} rows left by an earlier attempt",
                    chunk.label(),
                    removed
                );
            }
            tx.execute(insert.as_str(), &[]).await?;
        }

        tx.commit().await?;
        debug!("{}: committed {} rows", chunk.label(), written);
        Ok(written)
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {}", qualify_pg(schema, table)?), &[])
            .await?;
        Ok(row.get(0))
    }

    async fn ping(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// Second key of the per-chunk advisory lock. The two-int lock form takes
/// an `int4`, so larger chunk ids are rejected rather than wrapped.
fn advisory_chunk_key(chunk: &WorkChunk) -> Result<i32> {
    i32::try_from(chunk.chunk_id).map_err(|_| {
        MigrateError::chunk_fatal(
            &chunk.table,
            format!("chunk id {} does not fit an advisory lock key", chunk.chunk_id),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::tests::{make_column, make_table};
    use crate::core::schema::KeyValue;

    fn users() -> TableDescriptor {
        make_table(
            "Users",
            vec![make_column("ID", "int", 1), make_column("Name", "varchar(50)", 2)],
        )
    }

    fn chunk(range: ChunkRange, attempt: u32) -> WorkChunk {
        let mut chunk = WorkChunk::new("Users", 2, range, 100);
        chunk.attempt = attempt;
        chunk
    }

    #[test]
    fn test_advisory_key_rejects_oversized_chunk_id() {
        let range = ChunkRange::Position { offset: 0, limit: Some(10) };
        assert_eq!(advisory_chunk_key(&chunk(range.clone(), 1)).unwrap(), 2);

        let mut big = chunk(range, 1);
        big.chunk_id = i64::from(i32::MAX) + 1;
        assert!(matches!(
            advisory_chunk_key(&big),
            Err(MigrateError::ChunkFatal { .. })
        ));
    }

    #[test]
    fn test_first_attempt_is_plain_copy() {
        let range = ChunkRange::Key {
            lower: Some(KeyValue::Int(101)),
            upper: Some(KeyValue::Int(201)),
        };
        assert_eq!(reattempt_plan(&users(), &chunk(range, 1)).unwrap(), Reattempt::Fresh);
    }

    #[test]
    fn test_integer_reattempt_deletes_range() {
        let range = ChunkRange::Key {
            lower: Some(KeyValue::Int(101)),
            upper: Some(KeyValue::Int(201)),
        };
        assert_eq!(
            reattempt_plan(&users(), &chunk(range, 2)).unwrap(),
            Reattempt::DeleteRange(
                "DELETE FROM \"public\".\"users\" WHERE \"id\" >= 101 AND \"id\" < 201".into()
            )
        );

        let open = ChunkRange::Key {
            lower: None,
            upper: Some(KeyValue::Int(101)),
        };
        assert_eq!(
            reattempt_plan(&users(), &chunk(open, 3)).unwrap(),
            Reattempt::DeleteRange("DELETE FROM \"public\".\"users\" WHERE \"id\" < 101".into())
        );
    }

    #[test]
    fn test_ordered_and_composite_reattempts_stage() {
        let mut table = users();
        table.chunk_key = ChunkKey::Ordered {
            column: "Name".into(),
        };
        let range = ChunkRange::Key {
            lower: Some(KeyValue::from("f")),
            upper: None,
        };
        assert_eq!(
            reattempt_plan(&table, &chunk(range, 2)).unwrap(),
            Reattempt::Stage {
                key_columns: vec!["name".into()]
            }
        );

        table.chunk_key = ChunkKey::RowPosition {
            order_by: vec!["ID".into(), "Name".into()],
        };
        let window = ChunkRange::Position {
            offset: 100,
            limit: Some(100),
        };
        let plan = reattempt_plan(&table, &chunk(window.clone(), 2)).unwrap();
        let Reattempt::Stage { key_columns } = plan else {
            panic!("expected staging");
        };
        let (delete, insert) = merge_statements(&table, &key_columns).unwrap();
        assert_eq!(
            delete,
            "DELETE FROM \"public\".\"users\" t USING \"_migrate_chunk_stage\" s \
             WHERE t.\"id\" = s.\"id\" AND t.\"name\" = s.\"name\""
        );
        assert_eq!(
            insert,
            "INSERT INTO \"public\".\"users\" (\"id\", \"name\") SELECT \"id\", \"name\" FROM \"_migrate_chunk_stage\""
        );

        table.chunk_key = ChunkKey::RowPosition { order_by: vec![] };
        assert_eq!(
            reattempt_plan(&table, &chunk(window, 2)).unwrap(),
            Reattempt::Unprotected
        );
    }

    #[test]
    fn test_copy_statement() {
        let table = users();
        assert_eq!(
            copy_statement("\"public\".\"users\"", &column_list(&table).unwrap()),
            "COPY \"public\".\"users\" (\"id\", \"name\") FROM STDIN"
        );
    }
}
