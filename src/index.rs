//! Persistent sync baselines
//!
//! The [`SyncIndex`] remembers, per vault path, the [`SyncRecord`] written
//! after the last successful pull or push. The planner compares both sides
//! against it to tell "changed here", "changed there" and "changed on both".
//!
//! The index lives in one bincode file inside the state directory and is
//! rewritten atomically. It is bound to a database name: an index written
//! for another database is ignored, since its revisions mean nothing there.

use crate::error::Result;
use crate::types::SyncRecord;
use crate::utils::atomic_write;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};

/// File name of the index inside the state directory
pub const INDEX_FILE_NAME: &str = "sync-index.bin";

const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    database: String,
    records: BTreeMap<String, SyncRecord>,
}

/// Baselines keyed by vault path
#[derive(Debug)]
pub struct SyncIndex {
    /// Backing file, `None` for an index that is never saved
    path: Option<PathBuf>,
    /// Database the baselines belong to
    database: String,
    records: RwLock<BTreeMap<String, SyncRecord>>,
    dirty: AtomicBool,
}

impl SyncIndex {
    /// Open the index in `state_dir`, starting empty if there is none
    ///
    /// An unreadable index is logged and replaced by an empty one; the only
    /// cost is that the next run plans without baselines.
    pub fn open(state_dir: &Path, database: &str) -> Result<Self> {
        let path = state_dir.join(INDEX_FILE_NAME);
        let records = match std::fs::read(&path) {
            Ok(bytes) => match decode(&bytes) {
                Ok(file) if file.version == INDEX_FORMAT_VERSION && file.database == database => {
                    debug!("Loaded {} baselines from {:?}", file.records.len(), path);
                    file.records
                }
                Ok(file) if file.database != database => {
                    info!(
                        "Index {:?} belongs to database {}, starting fresh for {}",
                        path, file.database, database
                    );
                    BTreeMap::new()
                }
                Ok(file) => {
                    warn!("Index {:?} has unsupported version {}, starting fresh", path, file.version);
                    BTreeMap::new()
                }
                Err(e) => {
                    warn!("Index {:?} is unreadable ({}), starting fresh", path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            database: database.to_string(),
            records: RwLock::new(records),
            dirty: AtomicBool::new(false),
        })
    }

    /// Index that lives only in memory
    pub fn in_memory(database: &str) -> Self {
        Self {
            path: None,
            database: database.to_string(),
            records: RwLock::new(BTreeMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Baseline of a path
    pub fn get(&self, vault_path: &str) -> Option<SyncRecord> {
        self.records.read().get(vault_path).cloned()
    }

    /// Set the baseline of a path
    pub fn insert(&self, vault_path: &str, record: SyncRecord) {
        trace!("Baseline for {} at {}", vault_path, record.revision);
        self.records.write().insert(vault_path.to_string(), record);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Forget a path
    pub fn remove(&self, vault_path: &str) -> Option<SyncRecord> {
        let removed = self.records.write().remove(vault_path);
        if removed.is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    /// Number of baselines
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether there are no baselines
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Paths with a baseline, sorted
    pub fn paths(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    /// Whether there are unsaved changes
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Write the index if it changed since the last save
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.is_dirty() {
            return Ok(());
        }

        let records = self.records.read();
        let file = IndexFile {
            version: INDEX_FORMAT_VERSION,
            database: self.database.clone(),
            records: records.clone(),
        };
        let bytes = bincode::serde::encode_to_vec(&file, bincode::config::standard())?;
        atomic_write(path, &bytes)?;
        self.dirty.store(false, Ordering::SeqCst);
        debug!("Saved {} baselines to {:?}", records.len(), path);
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> Result<IndexFile> {
    let (file, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(file)
}
