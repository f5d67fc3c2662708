//! Structure loading: which tables migrate, under which names, chunked how.
//!
//! [`StructureLoader::load`] turns the source catalog plus the operator's
//! filters into a [`MigrationPlan`]. The plan is built once per run and
//! shared read-only afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{glob_to_regex, Config, IdentifierCase};
use crate::core::schema::{ChunkKey, TableDescriptor, ViewDescriptor};
use crate::core::traits::SourceReader;
use crate::error::{MigrateError, Result};
use crate::schema::NameIndex;

const INTEGER_TYPES: &[&str] = &["tinyint", "smallint", "mediumint", "int", "integer", "bigint"];

/// Types whose values order the same way when compared as strings in MySQL.
const ORDERED_TYPES: &[&str] = &[
    "char",
    "varchar",
    "date",
    "datetime",
    "timestamp",
    "time",
    "decimal",
    "numeric",
];

/// Include/exclude glob filters on source table names.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TableFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: include.iter().map(|p| glob_to_regex(p)).collect::<Result<_>>()?,
            exclude: exclude.iter().map(|p| glob_to_regex(p)).collect::<Result<_>>()?,
        })
    }

    /// Empty include list means everything.
    pub fn matches(&self, name: &str) -> bool {
        (self.include.is_empty() || self.include.iter().any(|re| re.is_match(name)))
            && !self.exclude.iter().any(|re| re.is_match(name))
    }
}

/// A table the loader could not describe; it fails its schema stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedTable {
    pub table: String,
    pub reason: String,
}

/// The set of tables selected for migration.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    pub source_schema: String,
    pub target_schema: String,
    pub identifier_case: IdentifierCase,
    /// Sorted by source name.
    pub tables: Vec<Arc<TableDescriptor>>,
    /// Tables whose metadata could not be interpreted.
    pub rejected: Vec<RejectedTable>,
    pub views: Vec<ViewDescriptor>,
}

impl MigrationPlan {
    pub fn table(&self, name: &str) -> Option<&Arc<TableDescriptor>> {
        self.tables.iter().find(|t| t.name() == name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Source names of every selected table, including rejected ones.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .iter()
            .map(|t| t.name().to_string())
            .chain(self.rejected.iter().map(|r| r.table.clone()))
            .collect();
        names.sort();
        names
    }

    pub fn total_rows(&self) -> i64 {
        self.tables.iter().map(|t| t.row_estimate.max(0)).sum()
    }

    /// Name lookup for foreign keys and views.
    pub fn names(&self) -> NameIndex {
        NameIndex::new(self.tables.iter().map(|t| t.as_ref()), self.identifier_case)
    }
}

/// Builds a [`MigrationPlan`] from the source catalog.
pub struct StructureLoader<'a> {
    source: &'a dyn SourceReader,
    config: &'a Config,
}

impl<'a> StructureLoader<'a> {
    pub fn new(source: &'a dyn SourceReader, config: &'a Config) -> Self {
        Self { source, config }
    }

    /// Enumerate, filter and describe the tables to migrate.
    ///
    /// Fails with `NoMigratableTables` when the filters leave nothing or
    /// every selected table is rejected. A table whose metadata cannot be
    /// parsed is recorded in [`MigrationPlan::rejected`] instead of failing
    /// the load.
    pub async fn load(&self) -> Result<MigrationPlan> {
        let m = &self.config.migration;
        let filter = TableFilter::new(&m.include_tables, &m.exclude_tables)?;

        let mut names: Vec<String> = self
            .source
            .list_tables()
            .await?
            .into_iter()
            .filter(|name| {
                let keep = filter.matches(name);
                if !keep {
                    debug!("Filtered out table {}", name);
                }
                keep
            })
            .collect();
        names.sort();
        names.dedup();

        if names.is_empty() {
            return Err(MigrateError::NoMigratableTables(format!(
                "'{}' after applying include/exclude filters",
                self.config.source.database
            )));
        }

        for source_name in m.rename_tables.keys() {
            if !names.contains(source_name) {
                warn!("rename_tables entry {} matches no selected table", source_name);
            }
        }

        let mut plan = MigrationPlan {
            source_schema: self.config.source.database.clone(),
            target_schema: self.config.target.schema.clone(),
            identifier_case: m.identifier_case,
            ..Default::default()
        };
        let mut target_names: BTreeMap<String, String> = BTreeMap::new();

        for name in names {
            let mut table = match self.source.describe_table(&name).await {
                Ok(table) => table,
                Err(e @ MigrateError::SchemaParse { .. }) => {
                    warn!("Cannot read structure of {}: {}", name, e);
                    plan.rejected.push(RejectedTable {
                        table: name,
                        reason: e.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.apply_names(&mut table);
            if let Some(other) = target_names.insert(table.target_name.clone(), name.clone()) {
                return Err(MigrateError::Config(format!(
                    "tables {} and {} both map to target table {}",
                    other, name, table.target_name
                )));
            }

            table.chunk_key = choose_chunk_key(&table);
            if table.chunk_key == (ChunkKey::RowPosition { order_by: vec![] }) {
                warn!(
                    "{} has no usable key; chunks are row-count estimates and \
                     are not stable if the table changes during migration",
                    name
                );
            }
            debug!(
                "{} -> {}.{} ({} columns, ~{} rows, {:?})",
                name,
                table.target_schema,
                table.target_name,
                table.columns.len(),
                table.row_estimate,
                table.chunk_key
            );
            plan.tables.push(Arc::new(table));
        }

        if plan.tables.is_empty() {
            let reasons: Vec<String> = plan
                .rejected
                .iter()
                .map(|r| format!("{}: {}", r.table, r.reason))
                .collect();
            return Err(MigrateError::NoMigratableTables(format!(
                "'{}': every selected table was rejected ({})",
                self.config.source.database,
                reasons.join("; ")
            )));
        }

        if m.migrate_views {
            plan.views = self
                .source
                .list_views()
                .await?
                .into_iter()
                .filter(|v| filter.matches(&v.name))
                .collect();
            plan.views.sort_by(|a, b| a.name.cmp(&b.name));
        }

        info!(
            "Plan: {} tables (~{} rows), {} rejected, {} views",
            plan.tables.len(),
            plan.total_rows(),
            plan.rejected.len(),
            plan.views.len()
        );
        Ok(plan)
    }

    fn apply_names(&self, table: &mut TableDescriptor) {
        let m = &self.config.migration;
        table.target_schema = self.config.target.schema.clone();
        table.target_name = m
            .rename_tables
            .get(&table.source_name)
            .cloned()
            .unwrap_or_else(|| m.identifier_case.apply(&table.source_name));
        for col in &mut table.columns {
            col.target_name = m.identifier_case.apply(&col.name);
        }
    }
}

fn is_integer(table: &TableDescriptor, column: &str) -> bool {
    table
        .column(column)
        .map(|c| INTEGER_TYPES.contains(&c.data_type.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_ordered(table: &TableDescriptor, column: &str) -> bool {
    table
        .column(column)
        .map(|c| ORDERED_TYPES.contains(&c.data_type.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Pick how a table is divided into chunks.
///
/// Preference: single-column integer primary key, single-column orderable
/// primary key, single-column NOT NULL unique integer index, composite
/// primary key order, and finally unordered row positions.
pub fn choose_chunk_key(table: &TableDescriptor) -> ChunkKey {
    if let [pk] = table.primary_key.as_slice() {
        if is_integer(table, pk) {
            return ChunkKey::Integer { column: pk.clone() };
        }
        if is_ordered(table, pk) {
            return ChunkKey::Ordered { column: pk.clone() };
        }
    }

    let unique_int = table.indexes.iter().find_map(|idx| match idx.columns.as_slice() {
        [col] if idx.unique
            && is_integer(table, col)
            && table.column(col).map(|c| !c.nullable).unwrap_or(false) =>
        {
            Some(col.clone())
        }
        _ => None,
    });
    if let Some(column) = unique_int {
        return ChunkKey::Integer { column };
    }

    ChunkKey::RowPosition {
        order_by: table.primary_key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, SourceConfig, TargetConfig};
    use crate::core::schema::tests::{make_column, make_table};
    use crate::core::schema::IndexDescriptor;
    use crate::core::traits::KeyStats;
    use crate::core::value::Batch;
    use crate::core::KeyValue;
    use crate::pool::ChunkRange;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct CatalogSource {
        tables: Vec<TableDescriptor>,
        views: Vec<ViewDescriptor>,
    }

    #[async_trait]
    impl SourceReader for CatalogSource {
        async fn list_tables(&self) -> Result<Vec<String>> {
            Ok(self.tables.iter().map(|t| t.source_name.clone()).collect())
        }
        async fn describe_table(&self, table: &str) -> Result<TableDescriptor> {
            if table == "broken" {
                return Err(MigrateError::schema_parse(table, "bad column type"));
            }
            self.tables
                .iter()
                .find(|t| t.source_name == table)
                .cloned()
                .ok_or_else(|| MigrateError::schema_parse(table, "missing"))
        }
        async fn list_views(&self) -> Result<Vec<ViewDescriptor>> {
            Ok(self.views.clone())
        }
        async fn key_stats(&self, _table: &TableDescriptor) -> Result<KeyStats> {
            Ok(KeyStats::default())
        }
        async fn sample_boundaries(
            &self,
            _table: &TableDescriptor,
            _step: i64,
            _count: usize,
        ) -> Result<Vec<KeyValue>> {
            Ok(vec![])
        }
        async fn row_count(&self, _table: &TableDescriptor) -> Result<i64> {
            Ok(0)
        }
        fn read_chunk(
            &self,
            _table: Arc<TableDescriptor>,
            _range: ChunkRange,
            _batch_size: usize,
        ) -> mpsc::Receiver<Result<Batch>> {
            mpsc::channel(1).1
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        fn db_type(&self) -> &str {
            "catalog"
        }
    }

    fn config(migration: MigrationConfig) -> Config {
        Config {
            source: SourceConfig {
                host: "mysql.local".into(),
                database: "shop".into(),
                user: "root".into(),
                ..Default::default()
            },
            target: TargetConfig {
                host: "pg.local".into(),
                database: "shop".into(),
                user: "postgres".into(),
                schema: "app".into(),
                ..Default::default()
            },
            migration,
        }
    }

    fn catalog() -> CatalogSource {
        let raw = |name: &str| {
            let mut t = make_table(name, vec![make_column("ID", "int", 1)]);
            // Readers leave target names equal to source names.
            t.target_name = name.to_string();
            t.columns[0].target_name = "ID".into();
            t
        };
        CatalogSource {
            tables: vec![raw("Users"), raw("orders"), raw("tmp_import"), raw("broken")],
            views: vec![ViewDescriptor {
                source_schema: "shop".into(),
                name: "active".into(),
                definition: "select 1".into(),
            }],
        }
    }

    #[tokio::test]
    async fn test_load_applies_filters_names_and_order() {
        let mut m = MigrationConfig::default();
        m.exclude_tables = vec!["tmp_*".into()];
        m.rename_tables.insert("orders".into(), "Purchases".into());
        let config = config(m);
        let source = catalog();

        let plan = StructureLoader::new(&source, &config).load().await.unwrap();
        let names: Vec<_> = plan.tables.iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["Users", "orders"]);

        let users = plan.table("Users").unwrap();
        assert_eq!(users.target_name, "users");
        assert_eq!(users.target_schema, "app");
        assert_eq!(users.columns[0].target_name, "id");
        assert_eq!(plan.table("orders").unwrap().target_name, "Purchases");

        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].table, "broken");
        assert_eq!(plan.table_names(), vec!["Users", "broken", "orders"]);
        assert_eq!(plan.views.len(), 1);
        assert_eq!(plan.names().table("orders"), Some("Purchases"));
    }

    #[tokio::test]
    async fn test_load_preserve_case() {
        let mut m = MigrationConfig::default();
        m.identifier_case = IdentifierCase::Preserve;
        m.include_tables = vec!["Users".into()];
        m.migrate_views = false;
        let config = config(m);
        let source = catalog();

        let plan = StructureLoader::new(&source, &config).load().await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tables[0].target_name, "Users");
        assert_eq!(plan.tables[0].columns[0].target_name, "ID");
        assert!(plan.views.is_empty());
    }

    #[tokio::test]
    async fn test_empty_selection_fails() {
        let mut m = MigrationConfig::default();
        m.include_tables = vec!["nothing_*".into()];
        let config = config(m);
        let source = catalog();

        let err = StructureLoader::new(&source, &config).load().await.unwrap_err();
        assert!(matches!(err, MigrateError::NoMigratableTables(_)));
    }

    #[tokio::test]
    async fn test_all_tables_rejected_fails() {
        let mut m = MigrationConfig::default();
        m.include_tables = vec!["broken".into()];
        let config = config(m);
        let source = catalog();

        let err = StructureLoader::new(&source, &config).load().await.unwrap_err();
        assert!(matches!(err, MigrateError::NoMigratableTables(_)));
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_colliding_target_names_fail() {
        let mut m = MigrationConfig::default();
        m.rename_tables.insert("orders".into(), "users".into());
        let config = config(m);
        let source = catalog();

        let err = StructureLoader::new(&source, &config).load().await.unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[test]
    fn test_chunk_key_choice() {
        let table = make_table("t", vec![make_column("id", "bigint", 1)]);
        assert_eq!(
            choose_chunk_key(&table),
            ChunkKey::Integer {
                column: "id".into()
            }
        );

        let table = make_table("t", vec![make_column("code", "varchar(10)", 1)]);
        assert_eq!(
            choose_chunk_key(&table),
            ChunkKey::Ordered {
                column: "code".into()
            }
        );

        // Composite key
        let mut table = make_table(
            "t",
            vec![make_column("a", "int", 1), make_column("b", "int", 2)],
        );
        table.primary_key = vec!["a".into(), "b".into()];
        assert_eq!(
            choose_chunk_key(&table),
            ChunkKey::RowPosition {
                order_by: vec!["a".into(), "b".into()]
            }
        );

        // No key, but a NOT NULL unique integer index
        let mut seq = make_column("seq", "int unsigned", 2);
        seq.nullable = false;
        let mut table = make_table("t", vec![make_column("payload", "text", 1), seq]);
        table.primary_key.clear();
        table.indexes = vec![IndexDescriptor {
            name: "seq_uq".into(),
            columns: vec!["seq".into()],
            unique: true,
            kind: Default::default(),
        }];
        assert_eq!(
            choose_chunk_key(&table),
            ChunkKey::Integer {
                column: "seq".into()
            }
        );

        table.indexes.clear();
        assert!(choose_chunk_key(&table).is_unordered());
    }

    #[test]
    fn test_filter() {
        let filter = TableFilter::new(&["user*".into()], &["*_old".into()]).unwrap();
        assert!(filter.matches("users"));
        assert!(!filter.matches("users_old"));
        assert!(!filter.matches("orders"));
        assert!(TableFilter::default().matches("anything"));
    }
}
