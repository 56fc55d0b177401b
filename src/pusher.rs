//! Local to remote transfer of one file
//!
//! A push uploads the chunks the remote side does not reference yet, then
//! replaces the document with a revision-conditioned write. Until that write
//! succeeds the remote document is untouched; uploaded chunks are harmless
//! because nothing references them.
//!
//! When the write loses a race the current document is fetched and the
//! path re-planned against what this push started from:
//!
//! - remote already holds the same content: done, nothing to write
//! - remote content unchanged, only the revision moved: retry with it
//! - remote content changed: conflict, left for the operator

use crate::chunk_id::ChunkId;
use crate::chunking::{chunk_document, chunk_document_with_ids};
use crate::collections::{HashSet, HashSetExt};
use crate::error::{Result, SyncError};
use crate::planner::{NoOpReason, SyncPlan, SyncPlanner};
use crate::store::{ChunkPut, ChunkStore};
use crate::types::{Document, LocalFileState, SyncDirection, SyncRecord, PLAIN_DOC_TYPE};
use crate::utils::set_file_mtime;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, info, warn};

/// Document writes attempted before a lost race becomes a conflict
pub const MAX_WRITE_ATTEMPTS: usize = 3;

/// Result of pushing one file
#[derive(Debug, Clone)]
pub struct PushOutcome {
    /// Vault path
    pub path: String,
    /// Whether no remote document existed before
    pub created: bool,
    /// Chunks uploaded (or that would be, for dry runs)
    pub chunks_uploaded: usize,
    /// Bytes in those chunks
    pub bytes_uploaded: u64,
    /// Whether the document was written
    pub document_written: bool,
    /// New baseline; `None` for dry runs
    pub record: Option<SyncRecord>,
}

/// Uploads local files
pub struct Pusher<'a> {
    store: &'a dyn ChunkStore,
    pool: &'a ThreadPool,
    dry_run: bool,
}

impl<'a> Pusher<'a> {
    /// Pusher using `pool` for chunk uploads
    pub fn new(store: &'a dyn ChunkStore, pool: &'a ThreadPool) -> Self {
        Self {
            store,
            pool,
            dry_run: false,
        }
    }

    /// Compute the upload but change nothing
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Push `local`, replacing `known` if given
    pub fn push(&self, local: &LocalFileState, known: Option<&Document>) -> Result<PushOutcome> {
        self.push_planned(local, known, None)
    }

    /// Push `local` reusing chunk ids the planner already derived
    pub fn push_planned(
        &self,
        local: &LocalFileState,
        known: Option<&Document>,
        local_ids: Option<Vec<ChunkId>>,
    ) -> Result<PushOutcome> {
        let chunked = match local_ids {
            Some(ids) => chunk_document_with_ids(&local.content, ids),
            None => chunk_document(&local.content),
        };
        let known_ids: HashSet<&ChunkId> = known.map(|d| d.children.iter().collect()).unwrap_or_default();

        let mut seen = HashSet::with_capacity(chunked.len());
        let pending: Vec<(&ChunkId, &str)> = chunked
            .iter()
            .filter(|(id, _)| !known_ids.contains(id) && seen.insert(*id))
            .collect();
        let pending_bytes: u64 = pending.iter().map(|(_, text)| text.len() as u64).sum();

        if self.dry_run {
            debug!(
                "[dry-run] {}: {} of {} chunks to upload",
                local.path,
                pending.len(),
                chunked.len()
            );
            return Ok(PushOutcome {
                path: local.path.clone(),
                created: known.is_none(),
                chunks_uploaded: pending.len(),
                bytes_uploaded: pending_bytes,
                document_written: false,
                record: None,
            });
        }

        let store = self.store;
        let results: Vec<(u64, ChunkPut)> = self.pool.install(|| {
            pending
                .par_iter()
                .map(|(id, text)| store.put_chunk_if_absent(id, text).map(|put| (text.len() as u64, put)))
                .collect::<Result<Vec<_>>>()
        })?;
        let (chunks_uploaded, bytes_uploaded) = results
            .iter()
            .filter(|(_, put)| *put == ChunkPut::Created)
            .fold((0usize, 0u64), |(n, b), (len, _)| (n + 1, b + len));

        // A document missing from the listing may still exist
        let fetched;
        let base = match known {
            Some(doc) => Some(doc),
            None => {
                fetched = self.store.get_doc(&local.path)?;
                fetched.as_ref()
            }
        };
        let created = base.is_none();

        let mut doc = build_document(local, chunked.ids.clone(), base);
        let mut expected = base.and_then(|d| d.revision.clone());
        let origin = baseline_of(base);

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            match self.store.put_doc(&doc, expected.as_deref()) {
                Ok(revision) => {
                    doc.revision = Some(revision);
                    let local_mtime = if doc.mtime > local.mtime {
                        set_file_mtime(&local.abs_path, doc.mtime)?;
                        doc.mtime
                    } else {
                        local.mtime
                    };
                    debug!(
                        "Pushed {} ({} new chunks, rev {:?})",
                        local.path, chunks_uploaded, doc.revision
                    );
                    return Ok(PushOutcome {
                        path: local.path.clone(),
                        created,
                        chunks_uploaded,
                        bytes_uploaded,
                        document_written: true,
                        record: Some(SyncRecord::from_document(&doc, local_mtime)?),
                    });
                }
                Err(err) if err.is_conflict() => {
                    let current = self.store.get_doc(&local.path)?;
                    let replan = SyncPlanner::new(SyncDirection::Push, true).plan(
                        &local.path,
                        Some(local.clone()),
                        current.clone(),
                        Some(&origin),
                    );
                    match replan {
                        SyncPlan::NoOp {
                            reason: NoOpReason::ContentEqual,
                            record,
                            ..
                        } => {
                            info!("{}: remote already has this content", local.path);
                            return Ok(PushOutcome {
                                path: local.path.clone(),
                                created,
                                chunks_uploaded,
                                bytes_uploaded,
                                document_written: false,
                                record,
                            });
                        }
                        SyncPlan::Push { .. } => {
                            warn!(
                                "{}: revision moved without content change, retrying (attempt {}/{})",
                                local.path, attempt, MAX_WRITE_ATTEMPTS
                            );
                            expected = current.as_ref().and_then(|d| d.revision.clone());
                            if let Some(current) = current.as_ref() {
                                doc.mtime = doc.mtime.max(current.mtime + 1);
                            }
                        }
                        _ => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(SyncError::conflict(&local.path))
    }
}

/// Document describing `local` with the given chunk ids
///
/// Fields of the replaced document that this crate does not manage are kept.
pub fn build_document(local: &LocalFileState, ids: Vec<ChunkId>, base: Option<&Document>) -> Document {
    let mut doc = match base {
        Some(base) => base.clone(),
        None => Document::new(&local.path),
    };
    if doc.path.is_empty() {
        doc.path = local.path.clone();
    }
    doc.children = ids;
    doc.data = None;
    doc.mtime = match base {
        Some(base) => local.mtime.max(base.mtime + 1),
        None => local.mtime,
    };
    if doc.ctime <= 0 {
        doc.ctime = local.ctime;
    }
    doc.size = local.size;
    doc.doc_type = PLAIN_DOC_TYPE.to_string();
    doc.deleted = false;
    doc
}

/// The state a push started from, in baseline form
fn baseline_of(base: Option<&Document>) -> SyncRecord {
    SyncRecord {
        revision: base.and_then(|d| d.revision.clone()).unwrap_or_default(),
        chunk_ids: base.map(|d| d.children.clone()).unwrap_or_default(),
        local_mtime: 0,
        remote_mtime: base.map(|d| d.mtime).unwrap_or_default(),
        synced_at: 0,
    }
}
