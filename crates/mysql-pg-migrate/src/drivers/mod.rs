//! Database drivers behind the [`SourceReader`](crate::core::SourceReader)
//! and [`TargetWriter`](crate::core::TargetWriter) seams.
//!
//! - [`mysql`]: SQLx-based MySQL/MariaDB source reader
//! - [`postgres`]: deadpool-postgres target writer with COPY loading

pub mod mysql;
pub mod postgres;

pub use mysql::MysqlReader;
pub use postgres::{build_pool, PgWriter, SslMode};
