//! MySQL/MariaDB source driver.
//!
//! # Supported Versions
//!
//! - MySQL 8.0+ (window functions are used to sample chunk boundaries)
//! - MariaDB 10.2+
//!
//! Connections go through SQLx with `utf8mb4`; TLS follows the source
//! `ssl_mode` (`disabled`, `preferred`, `required`, `verify-ca`,
//! `verify-identity`).

mod reader;

pub use reader::MysqlReader;
