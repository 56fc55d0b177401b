//! Regeneration of documents with non-canonical chunk ids
//!
//! Documents written by older tools may reference chunks whose ids do not
//! follow the canonical scheme, which defeats deduplication with the plugin.
//! Repair rewrites them in two steps:
//!
//! 1. upload the canonical chunks of the document's content (existing
//!    chunks with identical bytes are reused), then switch `children` with a
//!    revision-conditioned write;
//! 2. once every document is switched, delete the legacy chunk ids that no
//!    document in the full listing references any more.
//!
//! A crash before the switch leaves the old document intact; the new chunks
//! are simply unreferenced until the next attempt.

use crate::cache::ChunkCache;
use crate::chunk_id::ChunkId;
use crate::chunking::chunk_document;
use crate::collections::{HashSet, HashSetExt};
use crate::error::{Result, SyncError};
use crate::index::SyncIndex;
use crate::store::{ChunkPut, ChunkStore};
use crate::types::{Document, PathError};
use crate::verification::{DocumentStatus, DocumentVerifier};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// One regenerated (or to-be-regenerated) document
#[derive(Debug, Clone)]
pub struct RepairAction {
    /// Vault path
    pub path: String,
    /// Why it needed repair
    pub status: DocumentStatus,
    /// Chunk count before
    pub old_chunks: usize,
    /// Chunk count after
    pub new_chunks: usize,
    /// Canonical chunks that had to be created
    pub chunks_uploaded: usize,
    /// Revision after the switch; `None` for dry runs
    pub revision: Option<String>,
}

/// What a repair pass did (or would do)
#[derive(Debug, Clone, Default)]
pub struct RepairReport {
    /// Whether writes were suppressed
    pub dry_run: bool,
    /// Documents examined
    pub examined: usize,
    /// Documents regenerated
    pub repaired: Vec<RepairAction>,
    /// Documents with missing chunks, which cannot be rebuilt
    pub corrupt: Vec<String>,
    /// Per-document failures
    pub errors: Vec<PathError>,
    /// Legacy chunk ids deleted (or deletable, for dry runs)
    pub legacy_chunks_deleted: usize,
    /// Legacy chunk ids kept because another document still uses them
    pub legacy_chunks_retained: usize,
}

impl RepairReport {
    /// No errors and no corrupt documents
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.corrupt.is_empty()
    }
}

/// Rewrites documents to canonical chunk ids
pub struct Repairer<'a> {
    store: &'a dyn ChunkStore,
    cache: &'a ChunkCache,
    pool: &'a ThreadPool,
    index: Option<&'a SyncIndex>,
    dry_run: bool,
}

impl<'a> Repairer<'a> {
    /// Repairer without baseline updates
    pub fn new(store: &'a dyn ChunkStore, cache: &'a ChunkCache, pool: &'a ThreadPool) -> Self {
        Self {
            store,
            cache,
            pool,
            index: None,
            dry_run: false,
        }
    }

    /// Keep baselines of repaired paths in step with the new revision
    pub fn with_index(mut self, index: &'a SyncIndex) -> Self {
        self.index = Some(index);
        self
    }

    /// Report without writing
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Repair every live chunked document under a prefix
    pub fn run(&self, prefix: Option<&str>) -> Result<RepairReport> {
        let mut report = RepairReport {
            dry_run: self.dry_run,
            ..Default::default()
        };

        let mut docs: Vec<Document> = self
            .store
            .list_docs(prefix)?
            .into_iter()
            .filter(|doc| !doc.is_deleted() && !doc.is_unreadable() && !doc.children.is_empty())
            .collect();
        docs.sort_by(|a, b| a.vault_path().cmp(b.vault_path()));
        report.examined = docs.len();

        let verifier = DocumentVerifier::new(self.store, self.cache, self.pool);
        let mut legacy: BTreeSet<ChunkId> = BTreeSet::new();

        for doc in &docs {
            let path = doc.vault_path().to_string();
            let result = verifier.verify_document(doc).and_then(|(verification, content)| {
                match verification.status {
                    DocumentStatus::Corrupt { .. } => {
                        report.corrupt.push(path.clone());
                        Ok(None)
                    }
                    status if status.is_repairable() => {
                        let content = content.ok_or_else(|| SyncError::internal(format!("no content for {}", path)))?;
                        self.repair_document(doc, &content, status).map(Some)
                    }
                    _ => Ok(None),
                }
            });

            match result {
                Ok(Some((action, new_ids))) => {
                    legacy.extend(doc.children.iter().filter(|id| !new_ids.contains(*id)).cloned());
                    report.repaired.push(action);
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Repair of {} failed: {}", path, e);
                    report.errors.push(PathError {
                        path,
                        message: e.to_string(),
                    });
                }
            }
        }

        if !legacy.is_empty() {
            self.collect_legacy(legacy, &mut report)?;
        }

        info!(
            "Repair: {} examined, {} repaired, {} corrupt, {} legacy chunks removed",
            report.examined,
            report.repaired.len(),
            report.corrupt.len(),
            report.legacy_chunks_deleted
        );
        Ok(report)
    }

    /// Upload canonical chunks and switch the document to them
    fn repair_document(
        &self,
        doc: &Document,
        content: &str,
        status: DocumentStatus,
    ) -> Result<(RepairAction, HashSet<ChunkId>)> {
        let path = doc.vault_path().to_string();
        let chunked = chunk_document(content);
        let new_ids: HashSet<ChunkId> = chunked.ids.iter().cloned().collect();

        let mut action = RepairAction {
            path: path.clone(),
            status,
            old_chunks: doc.children.len(),
            new_chunks: chunked.len(),
            chunks_uploaded: 0,
            revision: None,
        };

        if self.dry_run {
            info!("[dry-run] would regenerate {} ({} -> {} chunks)", path, action.old_chunks, action.new_chunks);
            return Ok((action, new_ids));
        }

        let mut seen = HashSet::with_capacity(chunked.len());
        let unique: Vec<(&ChunkId, &str)> = chunked.iter().filter(|(id, _)| seen.insert(*id)).collect();
        let store = self.store;
        let puts: Vec<ChunkPut> = self.pool.install(|| {
            unique
                .par_iter()
                .map(|(id, text)| store.put_chunk_if_absent(id, text))
                .collect::<Result<Vec<_>>>()
        })?;
        action.chunks_uploaded = puts.iter().filter(|p| **p == ChunkPut::Created).count();

        let mut updated = doc.clone();
        updated.children = chunked.ids.clone();
        updated.size = content.len() as u64;
        let revision = self.store.put_doc(&updated, doc.revision.as_deref())?;
        debug!("Regenerated {} at {}", path, revision);

        if let Some(index) = self.index {
            if let Some(mut record) = index.get(&path) {
                if doc.revision.as_deref() == Some(record.revision.as_str()) {
                    record.revision = revision.clone();
                    record.chunk_ids = chunked.ids.clone();
                    index.insert(&path, record);
                }
            }
        }

        action.revision = Some(revision);
        Ok((action, new_ids))
    }

    /// Delete legacy ids nothing references any more
    fn collect_legacy(&self, legacy: BTreeSet<ChunkId>, report: &mut RepairReport) -> Result<()> {
        // In a dry run the repaired documents still carry their old ids
        let switched: BTreeSet<&str> = report.repaired.iter().map(|a| a.path.as_str()).collect();
        let referenced: HashSet<ChunkId> = self
            .store
            .list_docs(None)?
            .into_iter()
            .filter(|doc| !(self.dry_run && switched.contains(doc.vault_path())))
            .flat_map(|doc| doc.children)
            .collect();

        for id in legacy {
            if referenced.contains(&id) {
                report.legacy_chunks_retained += 1;
                continue;
            }
            if self.dry_run {
                report.legacy_chunks_deleted += 1;
                continue;
            }
            match self.store.delete_chunk(&id) {
                Ok(true) => report.legacy_chunks_deleted += 1,
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Could not delete legacy chunk {}: {}", id, e),
            }
        }
        Ok(())
    }
}
