//! PostgreSQL target driver.
//!
//! - [`PgWriter`]: chunk loader and DDL executor
//! - [`build_pool`]: deadpool-postgres pool shared with the state and work pool stores

mod copy;
mod tls;
mod writer;

pub use tls::SslMode;
pub use writer::{build_pool, PgWriter};
