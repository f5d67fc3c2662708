//! Schema metadata for the tables selected for migration.
//!
//! Descriptors keep source names (used when reading MySQL) next to target
//! names (used in PostgreSQL DDL and COPY), so a plan can be rendered for
//! either side without re-deriving renames or case folding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A chunking key value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum KeyValue {
    /// Integer key (tinyint through bigint, unsigned up to i64::MAX).
    Int(i64),
    /// Any other orderable key, compared with the source collation.
    Text(String),
}

impl KeyValue {
    /// Render as a PostgreSQL literal for inline predicates.
    pub fn to_pg_literal(&self) -> String {
        match self {
            KeyValue::Int(v) => v.to_string(),
            KeyValue::Text(v) => crate::core::identifier::pg_literal(v),
        }
    }

    /// Integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            KeyValue::Int(v) => Some(*v),
            KeyValue::Text(_) => None,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Text(v) => write!(f, "'{}'", v),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

/// How a table's rows are divided into chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ChunkKey {
    /// Single integer key: evenly spaced half-open ranges over `[min, max]`.
    Integer { column: String },
    /// Single orderable non-integer key: boundaries sampled from the data.
    Ordered { column: String },
    /// No usable key: LIMIT/OFFSET windows, ordered by `order_by` when it is
    /// non-empty (composite primary key) and not ordered at all otherwise.
    RowPosition { order_by: Vec<String> },
}

impl ChunkKey {
    /// Key column for range-based strategies.
    pub fn column(&self) -> Option<&str> {
        match self {
            ChunkKey::Integer { column } | ChunkKey::Ordered { column } => Some(column),
            ChunkKey::RowPosition { .. } => None,
        }
    }

    /// Row-position chunks are estimates and are not stable under concurrent writes.
    pub fn is_unordered(&self) -> bool {
        matches!(self, ChunkKey::RowPosition { .. })
    }
}

/// Table metadata plus its migration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Source database (MySQL schema).
    pub source_schema: String,
    /// Source table name.
    pub source_name: String,
    /// Target PostgreSQL schema.
    pub target_schema: String,
    /// Target table name after renames and case folding.
    pub target_name: String,
    /// Columns in ordinal order.
    pub columns: Vec<ColumnDescriptor>,
    /// Primary key column names (source names), in key order.
    pub primary_key: Vec<String>,
    pub indexes: Vec<IndexDescriptor>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
    pub checks: Vec<CheckDescriptor>,
    pub comment: Option<String>,
    /// Row count estimate from table statistics.
    pub row_estimate: i64,
    /// Average row length in bytes from table statistics.
    pub avg_row_length: i64,
    pub chunk_key: ChunkKey,
}

impl TableDescriptor {
    /// Name used for logging, state records and work pool entries.
    pub fn name(&self) -> &str {
        &self.source_name
    }

    /// Find a column by source name.
    pub fn column(&self, source_name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == source_name)
    }

    /// Target name for a source column, falling back to the source name.
    pub fn target_column<'a>(&'a self, source_name: &'a str) -> &'a str {
        self.column(source_name)
            .map(|c| c.target_name.as_str())
            .unwrap_or(source_name)
    }

    /// Position of a column in the select list.
    pub fn column_index(&self, source_name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == source_name)
    }

    /// Auto-increment columns (at most one in MySQL).
    pub fn auto_increment_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.auto_increment)
    }

    /// Ordinal positions must run 1..=n without gaps.
    pub fn has_contiguous_ordinals(&self) -> bool {
        self.columns
            .iter()
            .enumerate()
            .all(|(i, c)| c.ordinal == i as i32 + 1)
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Source column name.
    pub name: String,
    /// Target column name.
    pub target_name: String,
    /// Full declared type, e.g. `varchar(255)` or `int(10) unsigned`.
    pub source_type: String,
    /// Base type name, e.g. `varchar`.
    pub data_type: String,
    pub nullable: bool,
    /// Raw default expression as reported by the source.
    pub default: Option<String>,
    /// 1-based position.
    pub ordinal: i32,
    pub auto_increment: bool,
    pub comment: Option<String>,
}

impl ColumnDescriptor {
    /// Whether the declared type carries the `unsigned` attribute.
    pub fn is_unsigned(&self) -> bool {
        self.source_type.to_lowercase().contains("unsigned")
    }
}

/// Kind of secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    #[default]
    BTree,
    Hash,
    FullText,
    Spatial,
}

impl IndexKind {
    /// Parse MySQL's `INDEX_TYPE`.
    pub fn from_mysql(index_type: &str) -> Self {
        match index_type.to_uppercase().as_str() {
            "HASH" => IndexKind::Hash,
            "FULLTEXT" => IndexKind::FullText,
            "SPATIAL" => IndexKind::Spatial,
            _ => IndexKind::BTree,
        }
    }
}

/// Secondary index metadata (the primary key is tracked separately).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    /// Source column names in index order.
    pub columns: Vec<String>,
    pub unique: bool,
    pub kind: IndexKind,
}

/// Foreign key metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub ref_schema: String,
    /// Referenced table (source name).
    pub ref_table: String,
    pub ref_columns: Vec<String>,
    pub on_delete: String,
    pub on_update: String,
}

/// Check constraint metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckDescriptor {
    pub name: String,
    /// Clause as reported by MySQL (backtick-quoted identifiers).
    pub definition: String,
}

/// View metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDescriptor {
    pub source_schema: String,
    pub name: String,
    /// `VIEW_DEFINITION` from the source.
    pub definition: String,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn make_column(name: &str, source_type: &str, ordinal: i32) -> ColumnDescriptor {
        let data_type = source_type
            .split(|c: char| c == '(' || c == ' ')
            .next()
            .unwrap_or(source_type)
            .to_string();
        ColumnDescriptor {
            name: name.to_string(),
            target_name: name.to_lowercase(),
            source_type: source_type.to_string(),
            data_type,
            nullable: true,
            default: None,
            ordinal,
            auto_increment: false,
            comment: None,
        }
    }

    pub(crate) fn make_table(name: &str, columns: Vec<ColumnDescriptor>) -> TableDescriptor {
        let pk = columns.first().map(|c| c.name.clone());
        TableDescriptor {
            source_schema: "shop".to_string(),
            source_name: name.to_string(),
            target_schema: "public".to_string(),
            target_name: name.to_lowercase(),
            chunk_key: match &pk {
                Some(column) => ChunkKey::Integer {
                    column: column.clone(),
                },
                None => ChunkKey::RowPosition { order_by: vec![] },
            },
            primary_key: pk.into_iter().collect(),
            columns,
            indexes: vec![],
            foreign_keys: vec![],
            checks: vec![],
            comment: None,
            row_estimate: 0,
            avg_row_length: 0,
        }
    }

    #[test]
    fn test_key_value_literals() {
        assert_eq!(KeyValue::Int(42).to_pg_literal(), "42");
        assert_eq!(KeyValue::from("o'neil").to_pg_literal(), "'o''neil'");
        assert!(KeyValue::Int(1) < KeyValue::Int(2));
        assert!(KeyValue::from("a") < KeyValue::from("b"));
    }

    #[test]
    fn test_chunk_key_helpers() {
        let key = ChunkKey::Integer {
            column: "id".into(),
        };
        assert_eq!(key.column(), Some("id"));
        assert!(!key.is_unordered());
        assert!(ChunkKey::RowPosition { order_by: vec![] }.is_unordered());
    }

    #[test]
    fn test_table_column_lookup() {
        let table = make_table(
            "Users",
            vec![make_column("ID", "int", 1), make_column("Name", "varchar(50)", 2)],
        );
        assert_eq!(table.target_column("Name"), "name");
        assert_eq!(table.target_column("missing"), "missing");
        assert_eq!(table.column_index("Name"), Some(1));
        assert!(table.has_contiguous_ordinals());
    }

    #[test]
    fn test_unsigned_detection() {
        assert!(make_column("n", "int(10) unsigned", 1).is_unsigned());
        assert!(!make_column("n", "int(11)", 1).is_unsigned());
    }

    #[test]
    fn test_index_kind_from_mysql() {
        assert_eq!(IndexKind::from_mysql("FULLTEXT"), IndexKind::FullText);
        assert_eq!(IndexKind::from_mysql("BTREE"), IndexKind::BTree);
        assert_eq!(IndexKind::from_mysql("SPATIAL"), IndexKind::Spatial);
    }
}
