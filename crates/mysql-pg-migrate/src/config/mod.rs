//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;
pub use validation::glob_to_regex;

use crate::error::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA-256 over the settings that shape the plan, DDL and chunk layout.
    ///
    /// Worker counts, timeouts and other runtime knobs are left out so a
    /// resume may change them freely.
    pub fn plan_hash(&self) -> String {
        #[derive(Serialize)]
        struct Fingerprint<'a> {
            source: (&'a str, u16, &'a str),
            target: (&'a str, u16, &'a str, &'a str),
            include: &'a [String],
            exclude: &'a [String],
            renames: &'a BTreeMap<String, String>,
            case: IdentifierCase,
            chunk_size: usize,
            chunk_size_bytes: Option<u64>,
            type_map_file: Option<&'a PathBuf>,
            type_map_mode: TypeMapMode,
        }

        let m = &self.migration;
        let fingerprint = Fingerprint {
            source: (&self.source.host, self.source.port, &self.source.database),
            target: (
                &self.target.host,
                self.target.port,
                &self.target.database,
                &self.target.schema,
            ),
            include: &m.include_tables,
            exclude: &m.exclude_tables,
            renames: &m.rename_tables,
            case: m.identifier_case,
            chunk_size: m.get_chunk_size(),
            chunk_size_bytes: m.chunk_size_bytes,
            type_map_file: m.type_map_file.as_ref(),
            type_map_mode: m.type_map_mode,
        };

        let json = serde_json::to_string(&fingerprint).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl TargetConfig {
    /// Connection string for tokio-postgres (password omitted).
    pub fn display_endpoint(&self) -> String {
        format!("postgres://{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

impl SourceConfig {
    /// Connection endpoint for logs and errors (password omitted).
    pub fn display_endpoint(&self) -> String {
        format!("mysql://{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  host: mysql.internal
  database: shop
  user: reader
  password: secret
target:
  host: pg.internal
  database: shop
  user: writer
  password: secret
migration:
  chunk_size: 100
  include_tables: ["user*"]
"#;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.port, 3306);
        assert_eq!(config.source.r#type, "mysql");
        assert_eq!(config.target.schema, "public");
        assert_eq!(config.migration.chunk_size, Some(100));
        assert_eq!(config.migration.max_retries, 3);
        assert_eq!(config.migration.state_schema, "_mysql_pg_migrate");
        assert!(config.migration.create_foreign_keys);
    }

    #[test]
    fn test_plan_hash_ignores_runtime_knobs() {
        let a = Config::from_yaml(YAML).unwrap();
        let mut b = a.clone();
        b.migration.workers = Some(12);
        b.migration.lease_seconds = 5;
        assert_eq!(a.plan_hash(), b.plan_hash());

        b.migration.chunk_size = Some(200);
        assert_ne!(a.plan_hash(), b.plan_hash());
    }

    #[test]
    fn test_display_endpoint_hides_password() {
        let config = Config::from_yaml(YAML).unwrap();
        let endpoint = config.source.display_endpoint();
        assert_eq!(endpoint, "mysql://reader@mysql.internal:3306/shop");
        assert!(!endpoint.contains("secret"));
    }
}
