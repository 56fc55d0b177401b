//! Remote to local transfer of one document
//!
//! Chunks missing from the [`ChunkCache`] are fetched in parallel on the
//! run's worker pool, then the content is assembled strictly in `children`
//! order and written atomically.

use crate::cache::ChunkCache;
use crate::chunk_id::ChunkId;
use crate::chunking::document_chunk_ids;
use crate::collections::{HashSet, HashSetExt};
use crate::error::{Result, SyncError};
use crate::store::ChunkStore;
use crate::types::{Document, SyncRecord};
use crate::utils::{atomic_write, file_times_ms, set_file_mtime, vault_path_to_abs};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Result of pulling one document
#[derive(Debug, Clone)]
pub struct PullOutcome {
    /// Vault path
    pub path: String,
    /// Destination on disk
    pub destination: PathBuf,
    /// Whether the file did not exist before
    pub created: bool,
    /// Content size in bytes
    pub bytes: u64,
    /// Chunks requested from the store
    pub chunks_fetched: usize,
    /// New baseline; `None` for dry runs
    pub record: Option<SyncRecord>,
}

/// Writes remote documents into the vault
pub struct Puller<'a> {
    store: &'a dyn ChunkStore,
    cache: &'a ChunkCache,
    pool: &'a ThreadPool,
    vault_root: &'a Path,
    dry_run: bool,
}

impl<'a> Puller<'a> {
    /// Puller writing below `vault_root`
    pub fn new(store: &'a dyn ChunkStore, cache: &'a ChunkCache, pool: &'a ThreadPool, vault_root: &'a Path) -> Self {
        Self {
            store,
            cache,
            pool,
            vault_root,
            dry_run: false,
        }
    }

    /// Read everything but write nothing
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Fetch chunks that are not cached yet
    ///
    /// Repeated ids are requested once. Returns how many were requested.
    pub fn prefetch(&self, doc: &Document) -> Result<usize> {
        let mut seen = HashSet::with_capacity(doc.children.len());
        let missing: Vec<&ChunkId> = doc
            .children
            .iter()
            .filter(|id| !self.cache.contains(id) && seen.insert(*id))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let store = self.store;
        let fetched: Vec<(&ChunkId, Option<String>)> = self.pool.install(|| {
            missing
                .par_iter()
                .map(|id| store.get_chunk(id).map(|data| (*id, data)))
                .collect::<Result<Vec<_>>>()
        })?;

        for (id, data) in fetched {
            match data {
                Some(data) => {
                    self.cache.insert(id.clone(), data);
                }
                None => {
                    return Err(SyncError::Corruption {
                        path: doc.vault_path().to_string(),
                        chunk_id: id.to_string(),
                    })
                }
            }
        }
        trace!("Fetched {} chunks for {}", missing.len(), doc.vault_path());
        Ok(missing.len())
    }

    /// Reassemble a document's content
    ///
    /// Returns the content and the number of chunks requested from the store.
    pub fn assemble(&self, doc: &Document) -> Result<(String, usize)> {
        if doc.is_inline() {
            return Ok((doc.data.clone().unwrap_or_default(), 0));
        }

        let fetched = self.prefetch(doc)?;
        let mut content = String::with_capacity(doc.size as usize);
        for id in &doc.children {
            let chunk = self.cache.get(id).ok_or_else(|| SyncError::Corruption {
                path: doc.vault_path().to_string(),
                chunk_id: id.to_string(),
            })?;
            content.push_str(&chunk);
        }
        Ok((content, fetched))
    }

    /// Pull one document into the vault
    pub fn pull(&self, doc: &Document) -> Result<PullOutcome> {
        let path = doc.vault_path().to_string();
        let destination = vault_path_to_abs(self.vault_root, &path)?;
        let (content, chunks_fetched) = self.assemble(doc)?;
        let created = !destination.exists();

        let record = if self.dry_run {
            debug!("[dry-run] would write {} ({} bytes)", path, content.len());
            None
        } else {
            atomic_write(&destination, content.as_bytes())?;
            if doc.mtime > 0 {
                set_file_mtime(&destination, doc.mtime)?;
            }
            let (local_mtime, _) = file_times_ms(&std::fs::metadata(&destination)?)?;
            let mut record = SyncRecord::from_document(doc, local_mtime)?;
            if doc.is_inline() {
                record.chunk_ids = document_chunk_ids(&content);
            }
            debug!("Pulled {} ({} bytes, {} chunks fetched)", path, content.len(), chunks_fetched);
            Some(record)
        };

        Ok(PullOutcome {
            path,
            destination,
            created,
            bytes: content.len() as u64,
            chunks_fetched,
            record,
        })
    }
}
