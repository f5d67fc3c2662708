//! File-based state and work pool storage for `--state-file`.
//!
//! One pretty-printed JSON document holds the state log, the work pool and
//! the run history. Every write rewrites the document atomically (temp file,
//! then rename) and signs it with HMAC-SHA256 keyed on the plan hash it
//! records, so edits made outside the tool are detected on load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use super::backend::StateBackend;
use super::{RunInfo, StateRecord};
use crate::error::{MigrateError, Result};
use crate::pool::{PoolStore, WorkChunk};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateDocument {
    /// Plan hash of the run that last wrote the file; also the HMAC key.
    #[serde(default)]
    plan_hash: String,
    #[serde(default)]
    records: BTreeMap<String, StateRecord>,
    #[serde(default)]
    chunks: BTreeMap<String, Vec<WorkChunk>>,
    #[serde(default)]
    runs: Vec<RunInfo>,
    /// HMAC-SHA256 over the document with this field unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hmac: Option<String>,
}

impl StateDocument {
    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)?;
        let mut mac = HmacSha256::new_from_slice(self.plan_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// JSON file store implementing both [`StateBackend`] and [`PoolStore`].
pub struct FileStore {
    path: PathBuf,
    doc: Mutex<StateDocument>,
}

impl FileStore {
    /// Open an existing state file, verifying its signature, or start an
    /// empty document if the file does not exist.
    pub fn open(path: impl AsRef<Path>, plan_hash: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let doc: StateDocument = serde_json::from_str(&content)?;
            match &doc.hmac {
                Some(stored) if *stored == doc.compute_hmac()? => {}
                Some(_) => {
                    return Err(MigrateError::State(format!(
                        "State file {} integrity check failed: HMAC mismatch (possible tampering)",
                        path.display()
                    )))
                }
                None => {
                    return Err(MigrateError::State(format!(
                        "State file {} is not signed",
                        path.display()
                    )))
                }
            }
            debug!(
                "Loaded state file {} ({} tables)",
                path.display(),
                doc.records.len()
            );
            doc
        } else {
            StateDocument {
                plan_hash: plan_hash.to_string(),
                ..Default::default()
            }
        };

        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    /// Start a new document, ignoring any existing file (fresh run).
    pub fn create(path: impl AsRef<Path>, plan_hash: &str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            doc: Mutex::new(StateDocument {
                plan_hash: plan_hash.to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` to the document and persist the result.
    fn update<T>(&self, f: impl FnOnce(&mut StateDocument) -> T) -> Result<T> {
        let mut doc = self
            .doc
            .lock()
            .map_err(|_| MigrateError::State("state file lock poisoned".into()))?;
        let out = f(&mut doc);
        self.persist(&mut doc)?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&StateDocument) -> T) -> Result<T> {
        let doc = self
            .doc
            .lock()
            .map_err(|_| MigrateError::State("state file lock poisoned".into()))?;
        Ok(f(&doc))
    }

    fn persist(&self, doc: &mut StateDocument) -> Result<()> {
        doc.hmac = None;
        doc.hmac = Some(doc.compute_hmac()?);
        let content = serde_json::to_string_pretty(&*doc)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl StateBackend for FileStore {
    async fn init_schema(&self) -> Result<()> {
        self.update(|_| ())
    }

    async fn load_records(&self) -> Result<Vec<StateRecord>> {
        self.read(|doc| doc.records.values().cloned().collect())
    }

    async fn save_record(&self, record: &StateRecord) -> Result<()> {
        self.update(|doc| {
            doc.records.insert(record.table.clone(), record.clone());
        })
    }

    async fn delete_all(&self) -> Result<()> {
        self.update(|doc| doc.records.clear())
    }

    async fn save_run(&self, run: &RunInfo) -> Result<()> {
        self.update(|doc| {
            doc.plan_hash = run.plan_hash.clone();
            match doc.runs.iter_mut().find(|r| r.run_id == run.run_id) {
                Some(existing) => *existing = run.clone(),
                None => doc.runs.push(run.clone()),
            }
        })
    }

    async fn load_latest_run(&self) -> Result<Option<RunInfo>> {
        self.read(|doc| doc.runs.iter().max_by_key(|r| r.started_at).cloned())
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[async_trait]
impl PoolStore for FileStore {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn replace_chunks(&self, table: &str, chunks: &[WorkChunk]) -> Result<()> {
        self.update(|doc| {
            doc.chunks.insert(table.to_string(), chunks.to_vec());
        })
    }

    async fn update_chunk(&self, chunk: &WorkChunk) -> Result<()> {
        self.update(|doc| {
            let chunks = doc.chunks.entry(chunk.table.clone()).or_default();
            match chunks.iter_mut().find(|c| c.chunk_id == chunk.chunk_id) {
                Some(existing) => *existing = chunk.clone(),
                None => {
                    chunks.push(chunk.clone());
                    chunks.sort_by_key(|c| c.chunk_id);
                }
            }
        })
    }

    async fn load_chunks(&self, table: &str) -> Result<Vec<WorkChunk>> {
        self.read(|doc| doc.chunks.get(table).cloned().unwrap_or_default())
    }

    async fn clear(&self, table: &str) -> Result<()> {
        self.update(|doc| {
            doc.chunks.remove(table);
        })
    }

    async fn clear_all(&self) -> Result<()> {
        self.update(|doc| doc.chunks.clear())
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
