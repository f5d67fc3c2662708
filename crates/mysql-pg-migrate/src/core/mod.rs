//! Core types shared by every stage of a migration.
//!
//! - [`schema`]: table, column, index and constraint descriptors
//! - [`value`]: tagged row values and batches
//! - [`traits`]: the `SourceReader` / `TargetWriter` seams
//! - [`identifier`]: quoting and literal escaping

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{
    CheckDescriptor, ChunkKey, ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, IndexKind,
    KeyValue, TableDescriptor, ViewDescriptor,
};
pub use traits::{KeyStats, SourceReader, TargetWriter};
pub use value::{Batch, SqlNullType, SqlValue};
