//! MySQL to PostgreSQL DDL translation.
//!
//! [`translate`] turns a [`TableDescriptor`] into a [`TableDdl`]: the
//! `CREATE TABLE` run in the schema stage plus the statements withheld
//! until the table's data is loaded. Nothing here touches a database, so
//! dry runs and tests render exactly what a real run would execute.
//!
//! Deferred statements are idempotent. Indexes and sequences use
//! `IF NOT EXISTS`, constraints are wrapped in a `DO` block that checks
//! `pg_constraint` first, so a stage interrupted halfway can be re-applied
//! on resume.

pub mod defaults;
pub mod views;

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::{IdentifierCase, MigrationConfig};
use crate::core::identifier::{
    pg_literal, qualify_pg, quote_pg, truncate_pg_identifier, validate_check_constraint,
};
use crate::core::schema::{ForeignKeyDescriptor, IndexDescriptor, IndexKind, TableDescriptor};
use crate::error::{MigrateError, Result};
use crate::typemap::{parse_declaration, TypeMap};

pub use defaults::translate_default;
pub use views::translate_view;

/// Compile a pattern once; `None` if it does not compile.
pub(crate) fn cached_regex(
    cell: &'static OnceLock<Option<Regex>>,
    pattern: &str,
) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Which optional objects are carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslateOptions {
    pub create_indexes: bool,
    pub create_foreign_keys: bool,
    pub create_check_constraints: bool,
    pub migrate_comments: bool,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            create_indexes: true,
            create_foreign_keys: true,
            create_check_constraints: true,
            migrate_comments: true,
        }
    }
}

impl TranslateOptions {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            create_indexes: config.create_indexes,
            create_foreign_keys: config.create_foreign_keys,
            create_check_constraints: config.create_check_constraints,
            migrate_comments: config.migrate_comments,
        }
    }
}

/// Source to target name lookup across every table in the plan.
///
/// Foreign keys and views reference other tables by source name; this is
/// how they find the renamed, case-folded target.
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    source_schema: String,
    target_schema: String,
    case: IdentifierCase,
    tables: BTreeMap<String, TableNames>,
}

#[derive(Debug, Clone)]
struct TableNames {
    target: String,
    columns: BTreeMap<String, String>,
}

impl NameIndex {
    pub fn new<'a>(
        tables: impl IntoIterator<Item = &'a TableDescriptor>,
        case: IdentifierCase,
    ) -> Self {
        let mut index = NameIndex {
            case,
            ..Default::default()
        };
        for table in tables {
            index.source_schema = table.source_schema.clone();
            index.target_schema = table.target_schema.clone();
            index.tables.insert(
                table.source_name.clone(),
                TableNames {
                    target: table.target_name.clone(),
                    columns: table
                        .columns
                        .iter()
                        .map(|c| (c.name.clone(), c.target_name.clone()))
                        .collect(),
                },
            );
        }
        index
    }

    pub fn source_schema(&self) -> &str {
        &self.source_schema
    }

    pub fn target_schema(&self) -> &str {
        &self.target_schema
    }

    /// Target name of a table in the plan.
    pub fn table(&self, source_name: &str) -> Option<&str> {
        self.tables.get(source_name).map(|t| t.target.as_str())
    }

    /// Target name of a column of a table in the plan.
    pub fn column(&self, table: &str, column: &str) -> Option<&str> {
        self.tables
            .get(table)?
            .columns
            .get(column)
            .map(|c| c.as_str())
    }

    /// Target spelling for an identifier that is not a known table.
    pub fn fold(&self, name: &str) -> String {
        self.case.apply(name)
    }
}

/// A constraint-stage statement.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredConstraint {
    pub name: String,
    pub sql: String,
    /// Source name of the referenced table, for foreign keys.
    pub references: Option<String>,
}

/// Everything needed to build one table on the target.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDdl {
    /// Source table name.
    pub table: String,
    /// Qualified target name.
    pub target: String,
    /// Resolved target type per column, in ordinal order.
    pub column_types: Vec<String>,
    pub create_table: String,
    pub comments: Vec<String>,
    /// Index stage: primary key, auto-increment sequences, secondary indexes.
    pub indexes: Vec<String>,
    /// Constraint stage: checks and foreign keys.
    pub constraints: Vec<DeferredConstraint>,
}

impl TableDdl {
    /// Statements for the schema stage.
    pub fn schema_statements(&self) -> Vec<String> {
        let mut statements = vec![self.create_table.clone()];
        statements.extend(self.comments.iter().cloned());
        statements
    }

    /// Source names of tables this table's foreign keys point at.
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self
            .constraints
            .iter()
            .filter_map(|c| c.references.as_deref())
            .filter(|r| *r != self.table)
            .collect();
        refs.sort_unstable();
        refs.dedup();
        refs
    }
}

/// Translate one table.
///
/// Fails with `UnmappedType` when a column type has no mapping and with
/// `SchemaParse` when the metadata is inconsistent.
pub fn translate(
    table: &TableDescriptor,
    type_map: &TypeMap,
    options: &TranslateOptions,
    names: &NameIndex,
) -> Result<TableDdl> {
    let name = table.name();
    if table.columns.is_empty() {
        return Err(MigrateError::schema_parse(name, "table has no columns"));
    }
    if !table.has_contiguous_ordinals() {
        return Err(MigrateError::schema_parse(
            name,
            "column ordinal positions are not contiguous",
        ));
    }
    let mut seen = HashSet::new();
    for col in &table.columns {
        if !seen.insert(col.target_name.as_str()) {
            return Err(MigrateError::schema_parse(
                name,
                format!("duplicate target column name {:?}", col.target_name),
            ));
        }
    }
    for pk in &table.primary_key {
        if table.column(pk).is_none() {
            return Err(MigrateError::schema_parse(
                name,
                format!("primary key column {} does not exist", pk),
            ));
        }
    }

    let target = qualify_pg(&table.target_schema, &table.target_name)
        .map_err(|e| MigrateError::schema_parse(name, e.to_string()))?;

    let mut column_types = Vec::with_capacity(table.columns.len());
    let mut column_defs = Vec::with_capacity(table.columns.len());
    for col in &table.columns {
        let pg_type = type_map
            .resolve(&col.source_type)
            .map_err(|e| e.at_column(name, &col.name))?;

        let mut def = format!("    {} {}", quote_col(name, &col.target_name)?, pg_type);
        if !col.nullable || col.auto_increment || table.primary_key.contains(&col.name) {
            def.push_str(" NOT NULL");
        }
        if !col.auto_increment {
            if let Some(default) = translate_default(name, col, &pg_type) {
                def.push_str(" DEFAULT ");
                def.push_str(&default);
            }
        }
        column_defs.push(def);
        column_types.push(pg_type);
    }

    let create_table = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        target,
        column_defs.join(",\n")
    );

    let comments = comment_statements(table, &target, options)?;

    let mut indexes = Vec::new();
    if !table.primary_key.is_empty() {
        let pk_name = truncate_pg_identifier(&format!("{}_pkey", table.target_name));
        let cols = target_columns(table, &table.primary_key)?;
        indexes.push(guarded_constraint(
            &target,
            &pk_name,
            &format!("PRIMARY KEY ({})", cols),
        )?);
    }
    indexes.extend(sequence_statements(table, &target)?);
    if options.create_indexes {
        for idx in &table.indexes {
            if let Some(sql) = index_statement(table, idx, &target)? {
                indexes.push(sql);
            }
        }
    }

    let mut constraints = Vec::new();
    if options.create_check_constraints {
        constraints.extend(enum_checks(table, &target, &column_types)?);
        for check in &table.checks {
            let definition = convert_check_definition(table, &check.definition);
            if let Err(e) = validate_check_constraint(&definition) {
                warn!("{}: skipping check constraint {}: {}", name, check.name, e);
                continue;
            }
            let constraint_name = truncate_pg_identifier(&check.name);
            constraints.push(DeferredConstraint {
                sql: guarded_constraint(
                    &target,
                    &constraint_name,
                    &format!("CHECK ({})", strip_outer_parens(&definition)),
                )?,
                name: constraint_name,
                references: None,
            });
        }
    }
    if options.create_foreign_keys {
        for fk in &table.foreign_keys {
            if let Some(constraint) = foreign_key(table, fk, &target, names)? {
                constraints.push(constraint);
            }
        }
    }

    debug!(
        "{}: {} columns, {} deferred index statements, {} constraints",
        name,
        column_types.len(),
        indexes.len(),
        constraints.len()
    );

    Ok(TableDdl {
        table: name.to_string(),
        target,
        column_types,
        create_table,
        comments,
        indexes,
        constraints,
    })
}

fn quote_col(table: &str, name: &str) -> Result<String> {
    quote_pg(name).map_err(|e| MigrateError::schema_parse(table, e.to_string()))
}

/// Quoted, comma separated target names for source columns.
fn target_columns(table: &TableDescriptor, columns: &[String]) -> Result<String> {
    let quoted = columns
        .iter()
        .map(|c| {
            let col = table.column(c).ok_or_else(|| {
                MigrateError::schema_parse(table.name(), format!("unknown column {}", c))
            })?;
            quote_col(table.name(), &col.target_name)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

/// `ALTER TABLE ... ADD CONSTRAINT` that does nothing if the constraint exists.
fn guarded_constraint(target: &str, name: &str, body: &str) -> Result<String> {
    Ok(format!(
        "DO $migrate$ BEGIN\n\
         IF NOT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = {} AND conrelid = {}::regclass) THEN\n\
         ALTER TABLE {} ADD CONSTRAINT {} {};\n\
         END IF;\n\
         END $migrate$",
        pg_literal(name),
        pg_literal(target),
        target,
        quote_pg(name)?,
        body
    ))
}

fn comment_statements(
    table: &TableDescriptor,
    target: &str,
    options: &TranslateOptions,
) -> Result<Vec<String>> {
    let column_comments: Vec<_> = table
        .columns
        .iter()
        .filter_map(|c| c.comment.as_deref().filter(|s| !s.is_empty()).map(|s| (c, s)))
        .collect();
    let table_comment = table.comment.as_deref().filter(|s| !s.is_empty());

    if !options.migrate_comments {
        if table_comment.is_some() || !column_comments.is_empty() {
            warn!("{}: comments not migrated (migrate_comments is off)", table.name());
        }
        return Ok(Vec::new());
    }

    let mut statements = Vec::new();
    if let Some(comment) = table_comment {
        statements.push(format!("COMMENT ON TABLE {} IS {}", target, pg_literal(comment)));
    }
    for (col, comment) in column_comments {
        statements.push(format!(
            "COMMENT ON COLUMN {}.{} IS {}",
            target,
            quote_col(table.name(), &col.target_name)?,
            pg_literal(comment)
        ));
    }
    Ok(statements)
}

/// Sequence backing an auto-increment column, positioned past the loaded data.
fn sequence_statements(table: &TableDescriptor, target: &str) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    for col in table.auto_increment_columns() {
        let seq_name = truncate_pg_identifier(&format!("{}_{}_seq", table.target_name, col.target_name));
        let seq = qualify_pg(&table.target_schema, &seq_name)
            .map_err(|e| MigrateError::schema_parse(table.name(), e.to_string()))?;
        let column = quote_col(table.name(), &col.target_name)?;

        statements.push(format!("CREATE SEQUENCE IF NOT EXISTS {}", seq));
        statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT nextval({}::regclass)",
            target,
            column,
            pg_literal(&seq)
        ));
        statements.push(format!("ALTER SEQUENCE {} OWNED BY {}.{}", seq, target, column));
        statements.push(format!(
            "SELECT setval({}::regclass, COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
            pg_literal(&seq),
            column,
            target
        ));
    }
    Ok(statements)
}

fn index_statement(
    table: &TableDescriptor,
    idx: &IndexDescriptor,
    target: &str,
) -> Result<Option<String>> {
    let index_name = quote_pg(&truncate_pg_identifier(&format!(
        "{}_{}_idx",
        table.target_name, idx.name
    )))?;

    let sql = match idx.kind {
        IndexKind::Spatial => {
            warn!(
                "{}: skipping SPATIAL index {} (no PostgreSQL equivalent without PostGIS)",
                table.name(),
                idx.name
            );
            return Ok(None);
        }
        IndexKind::FullText => {
            let document = idx
                .columns
                .iter()
                .map(|c| {
                    let col = table.column(c).map(|c| c.target_name.as_str()).unwrap_or(c);
                    Ok(format!("coalesce({}, '')", quote_col(table.name(), col)?))
                })
                .collect::<Result<Vec<_>>>()?
                .join(" || ' ' || ");
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} USING gin (to_tsvector('simple', {}))",
                index_name, target, document
            )
        }
        IndexKind::Hash if idx.columns.len() == 1 && !idx.unique => format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING hash ({})",
            index_name,
            target,
            target_columns(table, &idx.columns)?
        ),
        _ => format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if idx.unique { "UNIQUE " } else { "" },
            index_name,
            target,
            target_columns(table, &idx.columns)?
        ),
    };
    Ok(Some(sql))
}

/// Enum columns mapped to a text type keep their value set as a CHECK.
fn enum_checks(
    table: &TableDescriptor,
    target: &str,
    column_types: &[String],
) -> Result<Vec<DeferredConstraint>> {
    let mut checks = Vec::new();
    for (col, pg_type) in table.columns.iter().zip(column_types) {
        let parsed = parse_declaration(&col.source_type).map_err(|e| e.at_column(table.name(), &col.name))?;
        if parsed.base != "enum" {
            continue;
        }
        let lower = pg_type.to_lowercase();
        if !(lower == "text" || lower.starts_with("character varying") || lower.starts_with("varchar")) {
            continue;
        }
        let labels = parsed.labels();
        if labels.is_empty() {
            continue;
        }
        let name = truncate_pg_identifier(&format!("{}_{}_check", table.target_name, col.target_name));
        let values: Vec<String> = labels.iter().map(|l| pg_literal(l)).collect();
        checks.push(DeferredConstraint {
            sql: guarded_constraint(
                target,
                &name,
                &format!(
                    "CHECK ({} IN ({}))",
                    quote_col(table.name(), &col.target_name)?,
                    values.join(", ")
                ),
            )?,
            name,
            references: None,
        });
    }
    Ok(checks)
}

fn foreign_key(
    table: &TableDescriptor,
    fk: &ForeignKeyDescriptor,
    target: &str,
    names: &NameIndex,
) -> Result<Option<DeferredConstraint>> {
    if !fk.ref_schema.eq_ignore_ascii_case(&table.source_schema) {
        warn!(
            "{}: skipping foreign key {} (references another database {})",
            table.name(),
            fk.name,
            fk.ref_schema
        );
        return Ok(None);
    }
    let Some(ref_target) = names.table(&fk.ref_table) else {
        warn!(
            "{}: skipping foreign key {} (referenced table {} is not migrated)",
            table.name(),
            fk.name,
            fk.ref_table
        );
        return Ok(None);
    };
    if fk.columns.is_empty() || fk.columns.len() != fk.ref_columns.len() {
        return Err(MigrateError::schema_parse(
            table.name(),
            format!("foreign key {} has mismatched column lists", fk.name),
        ));
    }

    let ref_cols = fk
        .ref_columns
        .iter()
        .map(|c| {
            let col = names.column(&fk.ref_table, c).unwrap_or(c);
            quote_col(table.name(), col)
        })
        .collect::<Result<Vec<_>>>()?;
    let ref_qualified = qualify_pg(&table.target_schema, ref_target)
        .map_err(|e| MigrateError::schema_parse(table.name(), e.to_string()))?;

    let name = truncate_pg_identifier(&fk.name);
    let body = format!(
        "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
        target_columns(table, &fk.columns)?,
        ref_qualified,
        ref_cols.join(", "),
        map_referential_action(&fk.on_delete),
        map_referential_action(&fk.on_update)
    );
    Ok(Some(DeferredConstraint {
        sql: guarded_constraint(target, &name, &body)?,
        name,
        references: Some(fk.ref_table.clone()),
    }))
}

/// Map a MySQL referential action (`SET NULL`, `SET_NULL`, ...).
fn map_referential_action(action: &str) -> &'static str {
    match action.to_uppercase().replace('_', " ").trim() {
        "CASCADE" => "CASCADE",
        "SET NULL" => "SET NULL",
        "SET DEFAULT" => "SET DEFAULT",
        "RESTRICT" => "RESTRICT",
        _ => "NO ACTION",
    }
}

/// Rewrite a MySQL check clause for PostgreSQL: backtick identifiers become
/// quoted target column names and charset introducers are dropped.
fn convert_check_definition(table: &TableDescriptor, definition: &str) -> String {
    static INTRODUCER: OnceLock<Option<Regex>> = OnceLock::new();
    static BACKTICK: OnceLock<Option<Regex>> = OnceLock::new();

    let mut result = definition.to_string();
    if let Some(re) = cached_regex(&INTRODUCER, r"_(utf8mb4|utf8mb3|utf8|latin1|binary|ascii)'") {
        result = re.replace_all(&result, "'").into_owned();
    }
    if let Some(re) = cached_regex(&BACKTICK, r"`((?:[^`]|``)+)`") {
        result = re
            .replace_all(&result, |caps: &regex::Captures<'_>| {
                let source = caps[1].replace("``", "`");
                let target = table.target_column(&source);
                format!("\"{}\"", target.replace('"', "\"\""))
            })
            .into_owned();
    }
    result
}

fn strip_outer_parens(definition: &str) -> &str {
    let trimmed = definition.trim();
    if trimmed.starts_with('(') && trimmed.ends_with(')') {
        // Only strip when the outer pair encloses the whole clause.
        let mut depth = 0i32;
        for (i, c) in trimmed.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 && i != trimmed.len() - 1 {
                        return trimmed;
                    }
                }
                _ => {}
            }
        }
        return trimmed[1..trimmed.len() - 1].trim();
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::tests::{make_column, make_table};
    use crate::core::schema::{CheckDescriptor, ColumnDescriptor};

    fn users() -> TableDescriptor {
        let mut id = make_column("id", "int", 1);
        id.nullable = false;
        id.auto_increment = true;
        let mut name = make_column("Name", "varchar(50)", 2);
        name.comment = Some("display name".into());
        let bio = make_column("bio", "text", 3);
        let mut table = make_table("Users", vec![id, name, bio]);
        table.comment = Some("people".into());
        table
    }

    fn translate_default_opts(table: &TableDescriptor) -> Result<TableDdl> {
        let names = NameIndex::new([table], IdentifierCase::Lower);
        translate(
            table,
            &TypeMap::builtin().unwrap(),
            &TranslateOptions::default(),
            &names,
        )
    }

    #[test]
    fn test_create_table_keeps_column_order_and_types() {
        let ddl = translate_default_opts(&users()).unwrap();
        assert_eq!(ddl.target, "\"public\".\"users\"");
        assert_eq!(
            ddl.column_types,
            vec!["integer", "character varying(50)", "text"]
        );
        assert_eq!(
            ddl.create_table,
            "CREATE TABLE IF NOT EXISTS \"public\".\"users\" (\n    \"id\" integer NOT NULL,\n    \"name\" character varying(50),\n    \"bio\" text\n)"
        );
    }

    #[test]
    fn test_deferred_statements() {
        let ddl = translate_default_opts(&users()).unwrap();
        assert!(ddl.indexes[0].contains("ADD CONSTRAINT \"users_pkey\" PRIMARY KEY (\"id\")"));
        assert!(ddl.indexes[0].contains("IF NOT EXISTS (SELECT 1 FROM pg_constraint"));
        assert!(ddl
            .indexes
            .iter()
            .any(|s| s == "CREATE SEQUENCE IF NOT EXISTS \"public\".\"users_id_seq\""));
        assert!(ddl.indexes.iter().any(|s| s.contains("OWNED BY \"public\".\"users\".\"id\"")));
        assert!(ddl.indexes.iter().any(|s| s.starts_with("SELECT setval(")));
        assert!(!ddl.create_table.contains("nextval"));
    }

    #[test]
    fn test_comments() {
        let ddl = translate_default_opts(&users()).unwrap();
        assert_eq!(
            ddl.comments,
            vec![
                "COMMENT ON TABLE \"public\".\"users\" IS 'people'".to_string(),
                "COMMENT ON COLUMN \"public\".\"users\".\"name\" IS 'display name'".to_string(),
            ]
        );
        assert_eq!(ddl.schema_statements().len(), 3);

        let options = TranslateOptions {
            migrate_comments: false,
            ..Default::default()
        };
        let table = users();
        let names = NameIndex::new([&table], IdentifierCase::Lower);
        let ddl = translate(&table, &TypeMap::builtin().unwrap(), &options, &names).unwrap();
        assert!(ddl.comments.is_empty());
    }

    #[test]
    fn test_unmapped_type_names_the_column() {
        let table = make_table(
            "t",
            vec![make_column("id", "int", 1), make_column("status", "enum('a','b')", 2)],
        );
        let map = TypeMap::from_yaml("types:\n  - source: int\n    target: integer\n").unwrap();
        let names = NameIndex::new([&table], IdentifierCase::Lower);
        let err = translate(&table, &map, &TranslateOptions::default(), &names).unwrap_err();
        assert!(matches!(err, MigrateError::UnmappedType { .. }));
        assert!(err.to_string().contains("t.status"));
    }

    #[test]
    fn test_non_contiguous_ordinals_rejected() {
        let table = make_table(
            "t",
            vec![make_column("id", "int", 1), make_column("b", "int", 3)],
        );
        let err = translate_default_opts(&table).unwrap_err();
        assert!(matches!(err, MigrateError::SchemaParse { .. }));
    }

    #[test]
    fn test_duplicate_folded_names_rejected() {
        let table = make_table(
            "t",
            vec![make_column("Name", "int", 1), make_column("name", "int", 2)],
        );
        assert!(matches!(
            translate_default_opts(&table),
            Err(MigrateError::SchemaParse { .. })
        ));
    }

    #[test]
    fn test_indexes() {
        let mut table = make_table(
            "posts",
            vec![
                make_column("id", "int", 1),
                make_column("title", "varchar(100)", 2),
                make_column("body", "text", 3),
                make_column("geo", "point", 4),
            ],
        );
        table.indexes = vec![
            IndexDescriptor {
                name: "title_uq".into(),
                columns: vec!["title".into()],
                unique: true,
                kind: IndexKind::BTree,
            },
            IndexDescriptor {
                name: "ft".into(),
                columns: vec!["title".into(), "body".into()],
                unique: false,
                kind: IndexKind::FullText,
            },
            IndexDescriptor {
                name: "g".into(),
                columns: vec!["geo".into()],
                unique: false,
                kind: IndexKind::Spatial,
            },
        ];
        let ddl = translate_default_opts(&table).unwrap();
        assert!(ddl.indexes.contains(
            &"CREATE UNIQUE INDEX IF NOT EXISTS \"posts_title_uq_idx\" ON \"public\".\"posts\" (\"title\")"
                .to_string()
        ));
        assert!(ddl.indexes.iter().any(|s| s.contains(
            "USING gin (to_tsvector('simple', coalesce(\"title\", '') || ' ' || coalesce(\"body\", '')))"
        )));
        assert!(!ddl.indexes.iter().any(|s| s.contains("posts_g_idx")));
    }

    #[test]
    fn test_index_names_truncated() {
        let mut table = make_table("t", vec![make_column("id", "int", 1)]);
        table.indexes = vec![IndexDescriptor {
            name: "x".repeat(70),
            columns: vec!["id".into()],
            unique: false,
            kind: IndexKind::BTree,
        }];
        let ddl = translate_default_opts(&table).unwrap();
        let stmt = ddl.indexes.last().unwrap();
        let name = stmt.split('"').nth(1).unwrap();
        assert_eq!(name.len(), 63);
    }

    #[test]
    fn test_enum_and_check_constraints() {
        let mut table = make_table(
            "orders",
            vec![
                make_column("id", "int", 1),
                make_column("state", "enum('new','it''s')", 2),
                make_column("Price", "decimal(10,2)", 3),
            ],
        );
        table.checks = vec![
            CheckDescriptor {
                name: "price_positive".into(),
                definition: "(`Price` > 0)".into(),
            },
            CheckDescriptor {
                name: "sneaky".into(),
                definition: "1); DROP TABLE x; --".into(),
            },
        ];
        let ddl = translate_default_opts(&table).unwrap();
        assert_eq!(ddl.constraints.len(), 2);
        assert!(ddl.constraints[0]
            .sql
            .contains("CHECK (\"state\" IN ('new', 'it''s'))"));
        assert!(ddl.constraints[1].sql.contains("CHECK (\"price\" > 0)"));
    }

    #[test]
    fn test_foreign_keys() {
        let users = make_table("users", vec![make_column("ID", "int", 1)]);
        let mut orders = make_table(
            "orders",
            vec![make_column("id", "int", 1), make_column("user_id", "int", 2)],
        );
        orders.foreign_keys = vec![
            ForeignKeyDescriptor {
                name: "fk_user".into(),
                columns: vec!["user_id".into()],
                ref_schema: "shop".into(),
                ref_table: "users".into(),
                ref_columns: vec!["ID".into()],
                on_delete: "SET NULL".into(),
                on_update: "RESTRICT".into(),
            },
            ForeignKeyDescriptor {
                name: "fk_missing".into(),
                columns: vec!["user_id".into()],
                ref_schema: "shop".into(),
                ref_table: "accounts".into(),
                ref_columns: vec!["id".into()],
                on_delete: "CASCADE".into(),
                on_update: "CASCADE".into(),
            },
            ForeignKeyDescriptor {
                name: "fk_other_db".into(),
                columns: vec!["user_id".into()],
                ref_schema: "crm".into(),
                ref_table: "users".into(),
                ref_columns: vec!["id".into()],
                on_delete: "CASCADE".into(),
                on_update: "CASCADE".into(),
            },
        ];
        let names = NameIndex::new([&users, &orders], IdentifierCase::Lower);
        let ddl = translate(
            &orders,
            &TypeMap::builtin().unwrap(),
            &TranslateOptions::default(),
            &names,
        )
        .unwrap();
        assert_eq!(ddl.constraints.len(), 1);
        let fk = &ddl.constraints[0];
        assert_eq!(fk.references.as_deref(), Some("users"));
        assert!(fk.sql.contains(
            "FOREIGN KEY (\"user_id\") REFERENCES \"public\".\"users\" (\"id\") ON DELETE SET NULL ON UPDATE RESTRICT"
        ));
        assert_eq!(ddl.referenced_tables(), vec!["users"]);
    }

    #[test]
    fn test_optional_objects_disabled() {
        let mut table = users();
        table.indexes = vec![IndexDescriptor {
            name: "bio".into(),
            columns: vec!["bio".into()],
            unique: false,
            kind: IndexKind::BTree,
        }];
        let options = TranslateOptions {
            create_indexes: false,
            create_foreign_keys: false,
            create_check_constraints: false,
            migrate_comments: true,
        };
        let names = NameIndex::new([&table], IdentifierCase::Lower);
        let ddl = translate(&table, &TypeMap::builtin().unwrap(), &options, &names).unwrap();
        // Primary key and sequence survive; the secondary index does not.
        assert!(!ddl.indexes.iter().any(|s| s.contains("users_bio_idx")));
        assert!(ddl.indexes.iter().any(|s| s.contains("PRIMARY KEY")));
        assert!(ddl.constraints.is_empty());
    }

    #[test]
    fn test_defaults_in_create_table() {
        let mut status: ColumnDescriptor = make_column("status", "varchar(10)", 2);
        status.default = Some("active".into());
        status.nullable = false;
        let table = make_table("t", vec![make_column("id", "int", 1), status]);
        let ddl = translate_default_opts(&table).unwrap();
        assert!(ddl
            .create_table
            .contains("\"status\" character varying(10) NOT NULL DEFAULT 'active'"));
    }

    #[test]
    fn test_referential_actions() {
        assert_eq!(map_referential_action("SET_NULL"), "SET NULL");
        assert_eq!(map_referential_action("set default"), "SET DEFAULT");
        assert_eq!(map_referential_action("RESTRICT"), "RESTRICT");
        assert_eq!(map_referential_action("NO ACTION"), "NO ACTION");
    }

    #[test]
    fn test_strip_outer_parens() {
        assert_eq!(strip_outer_parens("(a > 0)"), "a > 0");
        assert_eq!(strip_outer_parens("(a > 0) and (b > 0)"), "(a > 0) and (b > 0)");
    }
}
