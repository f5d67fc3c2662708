//! MySQL/MariaDB source reader.
//!
//! Implements [`SourceReader`] over a SQLx `MySqlPool`. Metadata comes from
//! `INFORMATION_SCHEMA`; rows are streamed per chunk in bounded batches,
//! either by keyset pagination inside the chunk's key range or by
//! LIMIT/OFFSET windows for row-position chunks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Row, ValueRef};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::core::identifier::{qualify_mysql, quote_mysql};
use crate::core::schema::{
    CheckDescriptor, ChunkKey, ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, IndexKind,
    KeyValue, TableDescriptor, ViewDescriptor,
};
use crate::core::traits::{KeyStats, SourceReader};
use crate::core::value::{Batch, SqlNullType, SqlValue};
use crate::error::{MigrateError, Result};
use crate::pool::ChunkRange;

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Batches buffered between the reading task and the consumer.
const READ_CHANNEL_CAPACITY: usize = 4;

/// How a column is fetched and decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadAs {
    Signed,
    Unsigned,
    F32,
    F64,
    Text,
    Bytes,
}

impl ReadAs {
    fn null_type(self) -> SqlNullType {
        match self {
            ReadAs::Signed => SqlNullType::I64,
            ReadAs::Unsigned => SqlNullType::U64,
            ReadAs::F32 => SqlNullType::F32,
            ReadAs::F64 => SqlNullType::F64,
            ReadAs::Text => SqlNullType::String,
            ReadAs::Bytes => SqlNullType::Bytes,
        }
    }
}

/// Decode strategy for a column.
///
/// Decimals, temporals and JSON are fetched as text so that 65-digit
/// decimals and zero dates reach the caster intact.
pub(crate) fn read_as(column: &ColumnDescriptor) -> ReadAs {
    match column.data_type.to_lowercase().as_str() {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" => {
            if column.is_unsigned() {
                ReadAs::Unsigned
            } else {
                ReadAs::Signed
            }
        }
        "year" => ReadAs::Signed,
        "bit" => ReadAs::Unsigned,
        "float" => ReadAs::F32,
        "double" | "real" | "double precision" => ReadAs::F64,
        "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => ReadAs::Bytes,
        _ => ReadAs::Text,
    }
}

fn is_spatial(data_type: &str) -> bool {
    matches!(
        data_type,
        "geometry"
            | "point"
            | "linestring"
            | "polygon"
            | "multipoint"
            | "multilinestring"
            | "multipolygon"
            | "geometrycollection"
            | "geomcollection"
    )
}

/// Select-list expression for a column.
pub(crate) fn select_expr(column: &ColumnDescriptor) -> Result<String> {
    let quoted = quote_mysql(&column.name)?;
    let data_type = column.data_type.to_lowercase();
    Ok(match data_type.as_str() {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => {
            if read_as(column) == ReadAs::Unsigned {
                format!("CAST({} AS UNSIGNED)", quoted)
            } else {
                format!("CAST({} AS SIGNED)", quoted)
            }
        }
        "bit" => format!("CAST({} AS UNSIGNED)", quoted),
        "decimal" | "numeric" | "date" | "datetime" | "timestamp" | "time" | "json" => {
            format!("CAST({} AS CHAR)", quoted)
        }
        t if is_spatial(t) => format!("ST_AsText({})", quoted),
        _ => quoted,
    })
}

/// Hidden trailing column carrying the chunk key, for keyset continuation.
fn key_expr(key: &ChunkKey, column: &str) -> Result<String> {
    let quoted = quote_mysql(column)?;
    Ok(match key {
        ChunkKey::Integer { .. } => format!("CAST({} AS SIGNED)", quoted),
        _ => format!("CAST({} AS CHAR)", quoted),
    })
}

/// Keyset page inside a key range.
///
/// Placeholders, in order: the lower bound (`>=` on the first page, `>`
/// after the last key of the previous page) when present, then the upper
/// bound when present.
pub(crate) fn key_page_query(
    table: &TableDescriptor,
    key_column: &str,
    first_page: bool,
    has_lower: bool,
    has_upper: bool,
    batch_size: usize,
) -> Result<String> {
    let mut exprs = table
        .columns
        .iter()
        .map(select_expr)
        .collect::<Result<Vec<_>>>()?;
    exprs.push(key_expr(&table.chunk_key, key_column)?);

    let key = quote_mysql(key_column)?;
    let mut conditions = Vec::new();
    if has_lower {
        conditions.push(format!("{} {} ?", key, if first_page { ">=" } else { ">" }));
    }
    if has_upper {
        conditions.push(format!("{} < ?", key));
    }

    let mut sql = format!(
        "SELECT {} FROM {}",
        exprs.join(", "),
        qualify_mysql(&table.source_schema, &table.source_name)?
    );
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY {} LIMIT {}", key, batch_size));
    Ok(sql)
}

/// One LIMIT/OFFSET window of a row-position chunk.
pub(crate) fn position_page_query(
    table: &TableDescriptor,
    offset: i64,
    limit: usize,
) -> Result<String> {
    let exprs = table
        .columns
        .iter()
        .map(select_expr)
        .collect::<Result<Vec<_>>>()?;
    let mut sql = format!(
        "SELECT {} FROM {}",
        exprs.join(", "),
        qualify_mysql(&table.source_schema, &table.source_name)?
    );
    if let ChunkKey::RowPosition { order_by } = &table.chunk_key {
        if !order_by.is_empty() {
            let cols = order_by
                .iter()
                .map(|c| quote_mysql(c))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&format!(" ORDER BY {}", cols.join(", ")));
        }
    }
    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
    Ok(sql)
}

/// Every `step`-th key in key order, skipping the first row.
pub(crate) fn sample_query(table: &TableDescriptor, key_column: &str, step: i64, count: usize) -> Result<String> {
    let key = quote_mysql(key_column)?;
    Ok(format!(
        "SELECT k FROM (SELECT {} AS k, ROW_NUMBER() OVER (ORDER BY {}) AS rn FROM {}) s \
         WHERE MOD(rn - 1, {}) = 0 AND rn > 1 ORDER BY rn LIMIT {}",
        key_expr(&table.chunk_key, key_column)?,
        key,
        qualify_mysql(&table.source_schema, &table.source_name)?,
        step.max(1),
        count
    ))
}

fn parse_key(table: &TableDescriptor, raw: String) -> Result<KeyValue> {
    match table.chunk_key {
        ChunkKey::Integer { .. } => raw.trim().parse::<i64>().map(KeyValue::Int).map_err(|_| {
            MigrateError::schema_parse(
                table.name(),
                format!("key value {} does not fit a signed 64-bit integer", raw),
            )
        }),
        _ => Ok(KeyValue::Text(raw)),
    }
}

fn bind_key<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    key: &KeyValue,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    match key {
        KeyValue::Int(v) => query.bind(*v),
        KeyValue::Text(v) => query.bind(v.clone()),
    }
}

/// Decode one row into tagged values.
fn decode_row(
    table: &TableDescriptor,
    reads: &[ReadAs],
    row: &MySqlRow,
) -> Result<Vec<SqlValue<'static>>> {
    let mut values = Vec::with_capacity(reads.len());
    for (i, read) in reads.iter().enumerate() {
        let is_null = row.try_get_raw(i).map(|r| r.is_null()).unwrap_or(true);
        if is_null {
            values.push(SqlValue::Null(read.null_type()));
            continue;
        }
        let column = || {
            format!(
                "{}.{}",
                table.name(),
                table.columns.get(i).map(|c| c.name.as_str()).unwrap_or("?")
            )
        };
        let decoded = match read {
            ReadAs::Signed => row.try_get::<i64, _>(i).map(SqlValue::I64),
            ReadAs::Unsigned => row.try_get::<u64, _>(i).map(SqlValue::U64),
            ReadAs::F32 => row.try_get::<f32, _>(i).map(SqlValue::F32),
            ReadAs::F64 => row.try_get::<f64, _>(i).map(SqlValue::F64),
            ReadAs::Text => row.try_get::<String, _>(i).map(SqlValue::text_owned),
            ReadAs::Bytes => row.try_get::<Vec<u8>, _>(i).map(SqlValue::bytes_owned),
        };
        values.push(decoded.map_err(|e| MigrateError::conversion(column(), e.to_string()))?);
    }
    Ok(values)
}

/// MySQL/MariaDB source reader.
pub struct MysqlReader {
    pool: MySqlPool,
    database: String,
}

impl MysqlReader {
    /// Connect to the source and verify the connection.
    pub async fn new(config: &SourceConfig, max_conns: usize) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .charset("utf8mb4")
            .ssl_mode(ssl_mode(&config.ssl_mode)?);

        let pool = MySqlPoolOptions::new()
            .max_connections(max_conns.max(1) as u32)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::connection(config.display_endpoint(), e))?;

        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| MigrateError::connection(config.display_endpoint(), e))?;

        info!(
            "Connected to MySQL source: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            database: config.database.clone(),
        })
    }

    async fn load_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        // information_schema may report VARBINARY under some collations
        let query = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(COLUMN_TYPE AS CHAR(4096)) AS COLUMN_TYPE,
                CAST(DATA_TYPE AS CHAR(255)) AS DATA_TYPE,
                CAST(IF(IS_NULLABLE = 'YES', 1, 0) AS SIGNED) AS is_nullable,
                CAST(COLUMN_DEFAULT AS CHAR(4096)) AS COLUMN_DEFAULT,
                CAST(IF(EXTRA LIKE '%auto_increment%', 1, 0) AS SIGNED) AS is_auto_increment,
                CAST(ORDINAL_POSITION AS SIGNED) AS ORDINAL_POSITION,
                CAST(COLUMN_COMMENT AS CHAR(2048)) AS COLUMN_COMMENT
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("COLUMN_NAME")?;
            let comment: Option<String> = row.try_get("COLUMN_COMMENT")?;
            columns.push(ColumnDescriptor {
                target_name: name.clone(),
                name,
                source_type: row.try_get("COLUMN_TYPE")?,
                data_type: row.try_get::<String, _>("DATA_TYPE")?.to_lowercase(),
                nullable: row.try_get::<i64, _>("is_nullable")? == 1,
                default: row.try_get("COLUMN_DEFAULT")?,
                ordinal: row.try_get::<i64, _>("ORDINAL_POSITION")? as i32,
                auto_increment: row.try_get::<i64, _>("is_auto_increment")? == 1,
                comment: comment.filter(|c| !c.is_empty()),
            });
        }
        Ok(columns)
    }

    async fn load_primary_key(&self, table: &str) -> Result<Vec<String>> {
        let query = r#"
            SELECT CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME
            FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("COLUMN_NAME").map_err(Into::into))
            .collect()
    }

    async fn load_indexes(&self, table: &str) -> Result<Vec<IndexDescriptor>> {
        let query = r#"
            SELECT
                CAST(INDEX_NAME AS CHAR(255)) AS INDEX_NAME,
                CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(NON_UNIQUE AS SIGNED) AS NON_UNIQUE,
                CAST(INDEX_TYPE AS CHAR(32)) AS INDEX_TYPE
            FROM INFORMATION_SCHEMA.STATISTICS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND INDEX_NAME != 'PRIMARY'
            ORDER BY INDEX_NAME, SEQ_IN_INDEX
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        let mut indexes: Vec<IndexDescriptor> = Vec::new();
        for row in rows {
            let name: String = row.try_get("INDEX_NAME")?;
            // Functional key parts have no column name.
            let column: Option<String> = row.try_get("COLUMN_NAME")?;
            let Some(column) = column else {
                debug!("{}: skipping functional key part of index {}", table, name);
                continue;
            };
            match indexes.last_mut() {
                Some(index) if index.name == name => index.columns.push(column),
                _ => indexes.push(IndexDescriptor {
                    name,
                    columns: vec![column],
                    unique: row.try_get::<i64, _>("NON_UNIQUE")? == 0,
                    kind: IndexKind::from_mysql(&row.try_get::<String, _>("INDEX_TYPE")?),
                }),
            }
        }

        debug!("Loaded {} indexes for {}", indexes.len(), table);
        Ok(indexes)
    }

    async fn load_foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyDescriptor>> {
        let query = r#"
            SELECT
                CAST(rc.CONSTRAINT_NAME AS CHAR(255)) AS CONSTRAINT_NAME,
                CAST(kcu.COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(kcu.REFERENCED_TABLE_SCHEMA AS CHAR(255)) AS REFERENCED_TABLE_SCHEMA,
                CAST(kcu.REFERENCED_TABLE_NAME AS CHAR(255)) AS REFERENCED_TABLE_NAME,
                CAST(kcu.REFERENCED_COLUMN_NAME AS CHAR(255)) AS REFERENCED_COLUMN_NAME,
                CAST(rc.UPDATE_RULE AS CHAR(32)) AS UPDATE_RULE,
                CAST(rc.DELETE_RULE AS CHAR(32)) AS DELETE_RULE
            FROM INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu
                ON rc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA
                AND rc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
                AND rc.TABLE_NAME = kcu.TABLE_NAME
            WHERE rc.CONSTRAINT_SCHEMA = ? AND rc.TABLE_NAME = ?
            ORDER BY rc.CONSTRAINT_NAME, kcu.ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        let mut by_name: BTreeMap<String, ForeignKeyDescriptor> = BTreeMap::new();
        for row in rows {
            let name: String = row.try_get("CONSTRAINT_NAME")?;
            let fk = match by_name.get_mut(&name) {
                Some(fk) => fk,
                None => by_name.entry(name.clone()).or_insert(ForeignKeyDescriptor {
                    name,
                    columns: Vec::new(),
                    ref_schema: row.try_get("REFERENCED_TABLE_SCHEMA")?,
                    ref_table: row.try_get("REFERENCED_TABLE_NAME")?,
                    ref_columns: Vec::new(),
                    on_delete: row.try_get("DELETE_RULE")?,
                    on_update: row.try_get("UPDATE_RULE")?,
                }),
            };
            fk.columns.push(row.try_get("COLUMN_NAME")?);
            fk.ref_columns.push(row.try_get("REFERENCED_COLUMN_NAME")?);
        }

        debug!("Loaded {} foreign keys for {}", by_name.len(), table);
        Ok(by_name.into_values().collect())
    }

    async fn load_check_constraints(&self, table: &str) -> Result<Vec<CheckDescriptor>> {
        // CHECK_CONSTRAINTS exists from MySQL 8.0.16 / MariaDB 10.2
        let query = r#"
            SELECT
                CAST(cc.CONSTRAINT_NAME AS CHAR(255)) AS CONSTRAINT_NAME,
                CAST(cc.CHECK_CLAUSE AS CHAR(4000)) AS CHECK_CLAUSE
            FROM INFORMATION_SCHEMA.CHECK_CONSTRAINTS cc
            JOIN INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
                ON cc.CONSTRAINT_SCHEMA = tc.CONSTRAINT_SCHEMA
                AND cc.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
            WHERE tc.TABLE_SCHEMA = ? AND tc.TABLE_NAME = ?
              AND tc.CONSTRAINT_TYPE = 'CHECK'
            ORDER BY cc.CONSTRAINT_NAME
        "#;

        let rows = match sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                debug!("{}: check constraints unavailable: {}", table, e);
                return Ok(Vec::new());
            }
        };

        let mut checks = Vec::with_capacity(rows.len());
        for row in rows {
            checks.push(CheckDescriptor {
                name: row.try_get("CONSTRAINT_NAME")?,
                definition: row.try_get("CHECK_CLAUSE")?,
            });
        }
        Ok(checks)
    }

    async fn load_table_stats(&self, table: &str) -> Result<(i64, i64, Option<String>)> {
        let query = r#"
            SELECT
                CAST(COALESCE(TABLE_ROWS, 0) AS SIGNED) AS TABLE_ROWS,
                CAST(COALESCE(AVG_ROW_LENGTH, 0) AS SIGNED) AS AVG_ROW_LENGTH,
                CAST(TABLE_COMMENT AS CHAR(2048)) AS TABLE_COMMENT
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
        "#;

        let row = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let comment: Option<String> = row.try_get("TABLE_COMMENT")?;
                Ok((
                    row.try_get("TABLE_ROWS")?,
                    row.try_get("AVG_ROW_LENGTH")?,
                    comment.filter(|c| !c.is_empty()),
                ))
            }
            None => Ok((0, 0, None)),
        }
    }

    async fn read_chunk_impl(
        pool: MySqlPool,
        table: Arc<TableDescriptor>,
        range: ChunkRange,
        batch_size: usize,
        tx: mpsc::Sender<Result<Batch>>,
    ) -> Result<()> {
        let batch_size = batch_size.max(1);
        let reads: Vec<ReadAs> = table.columns.iter().map(read_as).collect();
        let started = Instant::now();
        let mut total = 0usize;

        match (&range, table.chunk_key.column()) {
            (ChunkRange::Key { lower, upper }, Some(key_column)) => {
                let key_column = key_column.to_string();
                let mut last: Option<KeyValue> = None;
                loop {
                    let first_page = last.is_none();
                    let from = last.as_ref().or(lower.as_ref());
                    let sql = key_page_query(
                        &table,
                        &key_column,
                        first_page,
                        from.is_some(),
                        upper.is_some(),
                        batch_size,
                    )?;
                    let mut query = sqlx::query(&sql);
                    if let Some(from) = from {
                        query = bind_key(query, from);
                    }
                    if let Some(upper) = upper {
                        query = bind_key(query, upper);
                    }
                    let rows: Vec<MySqlRow> = query.fetch_all(&pool).await?;

                    let key_index = reads.len();
                    let mut batch_rows = Vec::with_capacity(rows.len());
                    let mut last_key = None;
                    for row in &rows {
                        batch_rows.push(decode_row(&table, &reads, row)?);
                        last_key = Some(match table.chunk_key {
                            ChunkKey::Integer { .. } => KeyValue::Int(row.try_get::<i64, _>(key_index)?),
                            _ => KeyValue::Text(row.try_get::<String, _>(key_index)?),
                        });
                    }

                    total += batch_rows.len();
                    let is_last = batch_rows.len() < batch_size;
                    let mut batch = Batch::new(batch_rows);
                    if let Some(key) = last_key.clone() {
                        batch = batch.with_last_key(key);
                    }
                    if is_last {
                        batch = batch.mark_final();
                    }
                    if tx.send(Ok(batch)).await.is_err() || is_last {
                        break;
                    }
                    last = last_key;
                }
            }
            (ChunkRange::Position { offset, limit }, _) => {
                let mut offset = *offset;
                let mut remaining = *limit;
                loop {
                    let take = match remaining {
                        Some(r) => (r.max(0) as usize).min(batch_size),
                        None => batch_size,
                    };
                    let rows: Vec<MySqlRow> = if take == 0 {
                        Vec::new()
                    } else {
                        let sql = position_page_query(&table, offset, take)?;
                        sqlx::query(&sql).fetch_all(&pool).await?
                    };

                    let batch_rows = rows
                        .iter()
                        .map(|row| decode_row(&table, &reads, row))
                        .collect::<Result<Vec<_>>>()?;
                    let fetched = batch_rows.len();
                    total += fetched;
                    offset += fetched as i64;
                    remaining = remaining.map(|r| r - fetched as i64);

                    let is_last = fetched < take || take == 0 || remaining == Some(0);
                    let mut batch = Batch::new(batch_rows);
                    if is_last {
                        batch = batch.mark_final();
                    }
                    if tx.send(Ok(batch)).await.is_err() || is_last {
                        break;
                    }
                }
            }
            (ChunkRange::Key { .. }, None) => {
                return Err(MigrateError::chunk_fatal(
                    table.name(),
                    "key range chunk on a table without a chunk key",
                ));
            }
        }

        debug!(
            "{} {}: read {} rows in {:?}",
            table.name(),
            range,
            total,
            started.elapsed()
        );
        Ok(())
    }
}

/// Map the configured TLS mode to SQLx's.
pub(crate) fn ssl_mode(mode: &str) -> Result<MySqlSslMode> {
    match mode.to_lowercase().as_str() {
        "disabled" | "disable" => Ok(MySqlSslMode::Disabled),
        "preferred" | "prefer" => Ok(MySqlSslMode::Preferred),
        "required" | "require" => Ok(MySqlSslMode::Required),
        "verify-ca" | "verify_ca" => Ok(MySqlSslMode::VerifyCa),
        "verify-identity" | "verify_identity" => Ok(MySqlSslMode::VerifyIdentity),
        other => Err(MigrateError::Config(format!(
            "Invalid source ssl_mode '{}'. Valid values: disabled, preferred, required, verify-ca, verify-identity",
            other
        ))),
    }
}

#[async_trait]
impl SourceReader for MysqlReader {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let query = r#"
            SELECT CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("TABLE_NAME").map_err(Into::into))
            .collect()
    }

    async fn describe_table(&self, table: &str) -> Result<TableDescriptor> {
        let columns = self.load_columns(table).await?;
        if columns.is_empty() {
            return Err(MigrateError::schema_parse(table, "no columns reported"));
        }
        let primary_key = self.load_primary_key(table).await?;
        let indexes = self.load_indexes(table).await?;
        let foreign_keys = self.load_foreign_keys(table).await?;
        let checks = self.load_check_constraints(table).await?;
        let (row_estimate, avg_row_length, comment) = self.load_table_stats(table).await?;

        Ok(TableDescriptor {
            source_schema: self.database.clone(),
            source_name: table.to_string(),
            target_schema: String::new(),
            target_name: table.to_string(),
            columns,
            primary_key,
            indexes,
            foreign_keys,
            checks,
            comment,
            row_estimate,
            avg_row_length,
            chunk_key: ChunkKey::RowPosition { order_by: vec![] },
        })
    }

    async fn list_views(&self) -> Result<Vec<ViewDescriptor>> {
        let query = r#"
            SELECT
                CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME,
                CAST(VIEW_DEFINITION AS CHAR(65535)) AS VIEW_DEFINITION
            FROM INFORMATION_SCHEMA.VIEWS
            WHERE TABLE_SCHEMA = ?
            ORDER BY TABLE_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .fetch_all(&self.pool)
            .await?;

        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            views.push(ViewDescriptor {
                source_schema: self.database.clone(),
                name: row.try_get("TABLE_NAME")?,
                definition: row
                    .try_get::<Option<String>, _>("VIEW_DEFINITION")?
                    .unwrap_or_default(),
            });
        }
        Ok(views)
    }

    async fn key_stats(&self, table: &TableDescriptor) -> Result<KeyStats> {
        let from = qualify_mysql(&table.source_schema, &table.source_name)?;
        let Some(column) = table.chunk_key.column() else {
            return Ok(KeyStats {
                row_count: self.row_count(table).await?,
                min: None,
                max: None,
            });
        };

        let key = quote_mysql(column)?;
        let sql = format!(
            "SELECT COUNT(*) AS cnt, CAST(MIN({key}) AS CHAR) AS min_key, CAST(MAX({key}) AS CHAR) AS max_key FROM {from}",
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;

        let min: Option<String> = row.try_get("min_key")?;
        let max: Option<String> = row.try_get("max_key")?;
        Ok(KeyStats {
            row_count: row.try_get("cnt")?,
            min: min.map(|v| parse_key(table, v)).transpose()?,
            max: max.map(|v| parse_key(table, v)).transpose()?,
        })
    }

    async fn sample_boundaries(
        &self,
        table: &TableDescriptor,
        step: i64,
        count: usize,
    ) -> Result<Vec<KeyValue>> {
        let Some(column) = table.chunk_key.column() else {
            return Ok(Vec::new());
        };
        if count == 0 {
            return Ok(Vec::new());
        }

        let sql = sample_query(table, column, step, count)?;
        let rows: Vec<MySqlRow> = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: Option<String> = match table.chunk_key {
                ChunkKey::Integer { .. } => row.try_get::<Option<i64>, _>(0)?.map(|v| v.to_string()),
                _ => row.try_get(0)?,
            };
            if let Some(raw) = raw {
                keys.push(parse_key(table, raw)?);
            }
        }
        debug!("{}: sampled {} chunk boundaries", table.name(), keys.len());
        Ok(keys)
    }

    async fn row_count(&self, table: &TableDescriptor) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) AS cnt FROM {}",
            qualify_mysql(&table.source_schema, &table.source_name)?
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("cnt")?)
    }

    fn read_chunk(
        &self,
        table: Arc<TableDescriptor>,
        range: ChunkRange,
        batch_size: usize,
    ) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let result = Self::read_chunk_impl(pool, table, range, batch_size, tx.clone()).await;
            if let Err(e) = result {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mysql"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::tests::{make_column, make_table};

    fn orders() -> TableDescriptor {
        let mut id = make_column("id", "bigint(20) unsigned", 1);
        id.nullable = false;
        make_table(
            "orders",
            vec![
                id,
                make_column("total", "decimal(12,2)", 2),
                make_column("placed_at", "datetime", 3),
                make_column("payload", "blob", 4),
                make_column("flags", "bit(3)", 5),
                make_column("area", "polygon", 6),
            ],
        )
    }

    #[test]
    fn test_select_expressions() {
        let table = orders();
        let exprs: Vec<String> = table.columns.iter().map(|c| select_expr(c).unwrap()).collect();
        assert_eq!(
            exprs,
            vec![
                "CAST(`id` AS UNSIGNED)",
                "CAST(`total` AS CHAR)",
                "CAST(`placed_at` AS CHAR)",
                "`payload`",
                "CAST(`flags` AS UNSIGNED)",
                "ST_AsText(`area`)",
            ]
        );
    }

    #[test]
    fn test_read_as() {
        assert_eq!(read_as(&make_column("a", "int(11)", 1)), ReadAs::Signed);
        assert_eq!(read_as(&make_column("a", "int(10) unsigned", 1)), ReadAs::Unsigned);
        assert_eq!(read_as(&make_column("a", "float", 1)), ReadAs::F32);
        assert_eq!(read_as(&make_column("a", "double", 1)), ReadAs::F64);
        assert_eq!(read_as(&make_column("a", "varbinary(16)", 1)), ReadAs::Bytes);
        assert_eq!(read_as(&make_column("a", "json", 1)), ReadAs::Text);
        assert_eq!(read_as(&make_column("a", "year", 1)), ReadAs::Signed);
    }

    #[test]
    fn test_key_page_queries() {
        let mut table = make_table(
            "users",
            vec![make_column("id", "int", 1), make_column("name", "varchar(50)", 2)],
        );

        let first = key_page_query(&table, "id", true, true, true, 500).unwrap();
        assert_eq!(
            first,
            "SELECT CAST(`id` AS SIGNED), `name`, CAST(`id` AS SIGNED) FROM `shop`.`users` \
             WHERE `id` >= ? AND `id` < ? ORDER BY `id` LIMIT 500"
        );

        let next = key_page_query(&table, "id", false, true, false, 500).unwrap();
        assert!(next.contains("WHERE `id` > ? ORDER BY"));

        let open = key_page_query(&table, "id", true, false, false, 10).unwrap();
        assert!(!open.contains("WHERE"));

        table.chunk_key = ChunkKey::Ordered { column: "name".into() };
        let ordered = key_page_query(&table, "name", true, true, true, 10).unwrap();
        assert!(ordered.contains("`name`, CAST(`name` AS CHAR) FROM"));
        assert!(ordered.ends_with("ORDER BY `name` LIMIT 10"));
    }

    #[test]
    fn test_position_page_query() {
        let mut table = make_table(
            "audit",
            vec![make_column("a", "int", 1), make_column("b", "int", 2)],
        );
        table.chunk_key = ChunkKey::RowPosition {
            order_by: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            position_page_query(&table, 200, 100).unwrap(),
            "SELECT CAST(`a` AS SIGNED), CAST(`b` AS SIGNED) FROM `shop`.`audit` ORDER BY `a`, `b` LIMIT 100 OFFSET 200"
        );

        table.chunk_key = ChunkKey::RowPosition { order_by: vec![] };
        assert!(!position_page_query(&table, 0, 100).unwrap().contains("ORDER BY"));
    }

    #[test]
    fn test_sample_query() {
        let mut table = make_table("users", vec![make_column("email", "varchar(100)", 1)]);
        table.chunk_key = ChunkKey::Ordered { column: "email".into() };
        let sql = sample_query(&table, "email", 1000, 9).unwrap();
        assert!(sql.starts_with("SELECT k FROM (SELECT CAST(`email` AS CHAR) AS k, ROW_NUMBER() OVER (ORDER BY `email`)"));
        assert!(sql.ends_with("WHERE MOD(rn - 1, 1000) = 0 AND rn > 1 ORDER BY rn LIMIT 9"));
    }

    #[test]
    fn test_parse_key() {
        let table = make_table("users", vec![make_column("id", "bigint unsigned", 1)]);
        assert_eq!(parse_key(&table, "42".into()).unwrap(), KeyValue::Int(42));
        let err = parse_key(&table, "18446744073709551615".into()).unwrap_err();
        assert!(matches!(err, MigrateError::SchemaParse { .. }));
    }

    #[test]
    fn test_ssl_modes() {
        assert!(matches!(ssl_mode("disabled").unwrap(), MySqlSslMode::Disabled));
        assert!(matches!(ssl_mode("VERIFY-IDENTITY").unwrap(), MySqlSslMode::VerifyIdentity));
        assert!(ssl_mode("sometimes").is_err());
    }

    #[test]
    fn test_quoting_rejects_nul() {
        let table = make_table("users", vec![make_column("bad\0name", "int", 1)]);
        assert!(position_page_query(&table, 0, 10).is_err());
    }
}
