//! In-memory source and target used by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use mysql_pg_migrate::core::schema::{
    ChunkKey, ColumnDescriptor, ForeignKeyDescriptor, KeyValue, TableDescriptor, ViewDescriptor,
};
use mysql_pg_migrate::core::{Batch, KeyStats, SourceReader, SqlValue, TargetWriter};
use mysql_pg_migrate::pool::{ChunkRange, WorkChunk};
use mysql_pg_migrate::{Config, MigrateError, Result};

pub type Row = Vec<SqlValue<'static>>;

pub fn config(extra: &str) -> Config {
    let yaml = format!(
        r#"
source:
  host: mysql.test
  database: shop
  user: migrator
target:
  host: pg.test
  database: app
  user: migrator
migration:
  workers: 4
  chunk_size: 100
  batch_size: 30
  lease_seconds: 1
  retry_backoff_ms: 10
{}
"#,
        extra
    );
    Config::from_yaml(&yaml).unwrap()
}

pub fn column(name: &str, source_type: &str, ordinal: i32, nullable: bool) -> ColumnDescriptor {
    ColumnDescriptor {
        name: name.into(),
        target_name: name.into(),
        source_type: source_type.into(),
        data_type: source_type
            .split(|c: char| c == '(' || c == ' ')
            .next()
            .unwrap_or(source_type)
            .to_string(),
        nullable,
        default: None,
        ordinal,
        auto_increment: false,
        comment: None,
    }
}

/// A table keyed on its first column.
pub fn table(name: &str, columns: Vec<ColumnDescriptor>) -> TableDescriptor {
    TableDescriptor {
        source_schema: "shop".into(),
        source_name: name.into(),
        target_schema: "shop".into(),
        target_name: name.into(),
        primary_key: vec![columns[0].name.clone()],
        columns,
        indexes: vec![],
        foreign_keys: vec![],
        checks: vec![],
        comment: None,
        row_estimate: 0,
        avg_row_length: 0,
        chunk_key: ChunkKey::RowPosition { order_by: vec![] },
    }
}

pub fn foreign_key(column: &str, ref_table: &str) -> ForeignKeyDescriptor {
    ForeignKeyDescriptor {
        name: format!("fk_{}_{}", column, ref_table),
        columns: vec![column.into()],
        ref_schema: "shop".into(),
        ref_table: ref_table.into(),
        ref_columns: vec!["id".into()],
        on_delete: "NO ACTION".into(),
        on_update: "NO ACTION".into(),
    }
}

pub fn users(count: i64) -> (TableDescriptor, Vec<Row>) {
    let table = table(
        "users",
        vec![
            column("id", "int", 1, false),
            column("name", "varchar(50)", 2, true),
        ],
    );
    let rows = (1..=count)
        .map(|id| vec![SqlValue::I64(id), SqlValue::text_owned(format!("user {}", id))])
        .collect();
    (table, rows)
}

pub fn orders(count: i64, users: i64) -> (TableDescriptor, Vec<Row>) {
    let mut table = table(
        "orders",
        vec![
            column("id", "bigint", 1, false),
            column("user_id", "int", 2, false),
        ],
    );
    table.foreign_keys = vec![foreign_key("user_id", "users")];
    let rows = (1..=count)
        .map(|id| vec![SqlValue::I64(id), SqlValue::I64((id - 1) % users + 1)])
        .collect();
    (table, rows)
}

struct SourceTable {
    descriptor: TableDescriptor,
    rows: Vec<Row>,
}

/// Source database held in memory. Rows are sorted by their first column.
#[derive(Default)]
pub struct MemorySource {
    tables: BTreeMap<String, SourceTable>,
    views: Vec<ViewDescriptor>,
    pub reads: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, (mut descriptor, rows): (TableDescriptor, Vec<Row>)) -> Self {
        descriptor.row_estimate = rows.len() as i64;
        self.tables.insert(
            descriptor.source_name.clone(),
            SourceTable { descriptor, rows },
        );
        self
    }

    pub fn with_view(mut self, name: &str, definition: &str) -> Self {
        self.views.push(ViewDescriptor {
            source_schema: "shop".into(),
            name: name.into(),
            definition: definition.into(),
        });
        self
    }

    fn rows(&self, table: &str) -> Result<&[Row]> {
        self.tables
            .get(table)
            .map(|t| t.rows.as_slice())
            .ok_or_else(|| MigrateError::schema_parse(table, "no such table"))
    }

    fn keys(&self, table: &str) -> Result<Vec<KeyValue>> {
        Ok(self
            .rows(table)?
            .iter()
            .filter_map(|row| row[0].as_key())
            .collect())
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    async fn describe_table(&self, table: &str) -> Result<TableDescriptor> {
        self.tables
            .get(table)
            .map(|t| t.descriptor.clone())
            .ok_or_else(|| MigrateError::schema_parse(table, "no such table"))
    }

    async fn list_views(&self) -> Result<Vec<ViewDescriptor>> {
        Ok(self.views.clone())
    }

    async fn key_stats(&self, table: &TableDescriptor) -> Result<KeyStats> {
        let keys = self.keys(table.name())?;
        Ok(KeyStats {
            row_count: keys.len() as i64,
            min: keys.first().cloned(),
            max: keys.last().cloned(),
        })
    }

    async fn sample_boundaries(
        &self,
        table: &TableDescriptor,
        step: i64,
        count: usize,
    ) -> Result<Vec<KeyValue>> {
        Ok(self
            .keys(table.name())?
            .into_iter()
            .skip(step as usize)
            .step_by(step.max(1) as usize)
            .take(count)
            .collect())
    }

    async fn row_count(&self, table: &TableDescriptor) -> Result<i64> {
        Ok(self.rows(table.name())?.len() as i64)
    }

    fn read_chunk(
        &self,
        table: Arc<TableDescriptor>,
        range: ChunkRange,
        batch_size: usize,
    ) -> mpsc::Receiver<Result<Batch>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(2);
        let selected: Result<Vec<Row>> = self.rows(table.name()).map(|rows| match &range {
            ChunkRange::Key { .. } => rows
                .iter()
                .filter(|row| row[0].as_key().is_some_and(|k| range.contains(&k)))
                .cloned()
                .collect(),
            ChunkRange::Position { offset, limit } => rows
                .iter()
                .skip(*offset as usize)
                .take(limit.map_or(usize::MAX, |l| l as usize))
                .cloned()
                .collect(),
        });

        tokio::spawn(async move {
            let rows = match selected {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            let mut batches: Vec<Batch> = rows
                .chunks(batch_size.max(1))
                .map(|rows| {
                    let mut batch = Batch::new(rows.to_vec());
                    if let Some(key) = rows.last().and_then(|r| r[0].as_key()) {
                        batch = batch.with_last_key(key);
                    }
                    batch
                })
                .collect();
            let last = batches.pop().unwrap_or_default().mark_final();
            batches.push(last);
            for batch in batches {
                if tx.send(Ok(batch)).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

/// Target database held in memory.
///
/// Each chunk is buffered and only becomes visible once its stream ends, and
/// a re-attempt first deletes the rows of its key range.
#[derive(Default)]
pub struct MemoryTarget {
    tables: Mutex<BTreeMap<String, Vec<Row>>>,
    pub executed: Mutex<Vec<String>>,
    /// Tables whose next write fails with a conversion error.
    pub fail_once: Mutex<HashSet<String>>,
    /// Writes that fail with a transient error before any succeeds.
    pub transient_failures: AtomicUsize,
    pub writes: Mutex<BTreeMap<String, usize>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .iter()
            .find(|(name, _)| name.ends_with(&format!(".{}", table)))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default()
    }

    /// Key values of the first column, sorted.
    pub fn ids(&self, table: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .rows(table)
            .iter()
            .filter_map(|row| row[0].as_key().and_then(|k| k.as_int()))
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn writes(&self, table: &str) -> usize {
        self.writes.lock().unwrap().get(table).copied().unwrap_or(0)
    }

    pub fn executed_matching(&self, needle: &str) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|sql| sql.contains(needle))
            .cloned()
            .collect()
    }

    /// Store rows as if an earlier attempt had committed them.
    pub fn commit(&self, table: &TableDescriptor, rows: Vec<Row>) {
        self.tables
            .lock()
            .unwrap()
            .entry(qualified(&table.target_schema, &table.target_name))
            .or_default()
            .extend(rows);
    }
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table)
}

#[async_trait]
impl TargetWriter for MemoryTarget {
    async fn execute(&self, sql: &str) -> Result<()> {
        self.executed.lock().unwrap().push(sql.to_string());
        Ok(())
    }

    async fn create_schema(&self, _schema: &str) -> Result<()> {
        Ok(())
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        self.tables.lock().unwrap().remove(&qualified(schema, table));
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .contains_key(&qualified(schema, table)))
    }

    async fn write_chunk(
        &self,
        table: &TableDescriptor,
        chunk: &WorkChunk,
        mut rows: mpsc::Receiver<Result<Batch>>,
    ) -> Result<u64> {
        *self
            .writes
            .lock()
            .unwrap()
            .entry(table.name().to_string())
            .or_default() += 1;

        if self.fail_once.lock().unwrap().remove(table.name()) {
            return Err(MigrateError::conversion(
                format!("{}.id", table.name()),
                "value out of range",
            ));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MigrateError::ChunkTransient {
                table: chunk.table.clone(),
                chunk_id: chunk.chunk_id,
                message: "connection reset by peer".into(),
            });
        }

        let mut buffered = Vec::new();
        while let Some(batch) = rows.recv().await {
            let batch = batch?;
            let last = batch.is_last;
            buffered.extend(batch.rows);
            if last {
                break;
            }
        }

        let count = buffered.len() as u64;
        let mut tables = self.tables.lock().unwrap();
        let stored = tables
            .entry(qualified(&table.target_schema, &table.target_name))
            .or_default();
        if chunk.is_reattempt() {
            stored.retain(|row| {
                !row[0]
                    .as_key()
                    .is_some_and(|key| chunk.range.contains(&key))
            });
        }
        stored.extend(buffered);
        Ok(count)
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(&qualified(schema, table))
            .map_or(0, |rows| rows.len() as i64))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}
