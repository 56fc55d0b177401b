//! Chunk-scheme verification of remote documents
//!
//! Verification reads a sample of remote documents and checks that their
//! recorded chunk ids are what the canonical algorithm produces:
//!
//! 1. **Chunk level**: every chunk's id is recomputed from its bytes
//! 2. **Document level**: the reassembled content is re-chunked and the
//!    resulting id sequence compared with `children`
//! 3. **Local copy**: when the file exists in the vault, its canonical ids
//!    are compared with `children` too
//!
//! Nothing is written. Documents failing 1 or 2 are candidates for
//! [`repair`](crate::repair).
//!
//! ```rust,no_run
//! # use vaultsync::{VaultSyncBuilder, SyncOptions};
//! # fn main() -> vaultsync::Result<()> {
//! # let sync = VaultSyncBuilder::from_env(None, None)?.build()?;
//! let report = sync.verify(Some("Notes/"), 10)?;
//! if !report.is_valid() {
//!     println!("{}", report.summary());
//! }
//! # Ok(())
//! # }
//! ```

use crate::cache::ChunkCache;
use crate::chunk_id::ChunkId;
use crate::chunking::document_chunk_ids;
use crate::collections::{HashSet, HashSetExt};
use crate::error::{Result, SyncError};
use crate::file_tracking::FileTracker;
use crate::store::ChunkStore;
use crate::types::Document;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Documents verified when no limit is given
pub const DEFAULT_SAMPLE_LIMIT: usize = 10;

/// Classification of a remote document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DocumentStatus {
    /// Recorded ids are canonical
    Match,
    /// Some recorded ids are not the id of the chunk's bytes
    ChunkIdMismatch {
        /// Number of such chunks
        mismatched: usize,
    },
    /// Chunk ids are valid but the content is split differently
    SchemeMismatch {
        /// Canonical chunk count
        expected: usize,
        /// Recorded chunk count
        recorded: usize,
        /// Index of the first differing id
        first_difference: usize,
    },
    /// Referenced chunks are missing from the store
    Corrupt {
        /// Missing chunk ids
        missing: Vec<String>,
    },
}

impl DocumentStatus {
    /// Whether repair can regenerate the document
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            DocumentStatus::ChunkIdMismatch { .. } | DocumentStatus::SchemeMismatch { .. }
        )
    }
}

/// How the vault copy compares to a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LocalStatus {
    /// No local copy, or not checked
    Absent,
    /// Local canonical ids equal `children`
    Match,
    /// Local content chunks differently
    Differs {
        /// Local canonical chunk count
        local: usize,
        /// Recorded chunk count
        remote: usize,
    },
    /// Local copy could not be read
    Unreadable(String),
}

/// Verification result for one document
#[derive(Debug, Clone, Serialize)]
pub struct DocumentVerification {
    /// Vault path
    pub path: String,
    /// Remote classification
    pub status: DocumentStatus,
    /// Vault copy classification
    pub local: LocalStatus,
    /// Chunks fetched and checked
    pub chunks_checked: usize,
}

impl DocumentVerification {
    /// Whether both the document and the local copy check out
    pub fn is_valid(&self) -> bool {
        self.status == DocumentStatus::Match && !matches!(self.local, LocalStatus::Differs { .. })
    }

    /// Error describing a failed remote check, `None` for a matching document
    pub fn error(&self) -> Option<SyncError> {
        let path = self.path.clone();
        match &self.status {
            DocumentStatus::Match => None,
            DocumentStatus::ChunkIdMismatch { mismatched } => Some(SyncError::AlgorithmMismatch {
                path,
                mismatched: *mismatched,
            }),
            DocumentStatus::SchemeMismatch {
                expected,
                recorded,
                first_difference,
            } => Some(SyncError::AlgorithmMismatch {
                path,
                mismatched: (*expected).max(*recorded) - first_difference,
            }),
            DocumentStatus::Corrupt { missing } => Some(SyncError::Corruption {
                path,
                chunk_id: missing.first().cloned().unwrap_or_default(),
            }),
        }
    }
}

/// Result of a verification pass
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    /// Documents eligible for sampling
    pub candidates: usize,
    /// Per-document results, sorted by path
    pub documents: Vec<DocumentVerification>,
    /// Time taken
    pub duration: Duration,
}

impl VerificationReport {
    /// Whether every sampled document checks out
    pub fn is_valid(&self) -> bool {
        self.documents.iter().all(DocumentVerification::is_valid)
    }

    /// Documents that do not check out
    pub fn mismatches(&self) -> impl Iterator<Item = &DocumentVerification> {
        self.documents.iter().filter(|d| !d.is_valid())
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let count = |f: fn(&DocumentStatus) -> bool| self.documents.iter().filter(|d| f(&d.status)).count();
        let local_diffs = self
            .documents
            .iter()
            .filter(|d| matches!(d.local, LocalStatus::Differs { .. }))
            .count();
        format!(
            "{} verified: {} match, {} chunk-id mismatch, {} scheme mismatch, {} corrupt, {} local differences",
            self.documents.len(),
            count(|s| *s == DocumentStatus::Match),
            count(|s| matches!(s, DocumentStatus::ChunkIdMismatch { .. })),
            count(|s| matches!(s, DocumentStatus::SchemeMismatch { .. })),
            count(|s| matches!(s, DocumentStatus::Corrupt { .. })),
            local_diffs
        )
    }
}

/// Checks documents against the canonical chunking
pub struct DocumentVerifier<'a> {
    store: &'a dyn ChunkStore,
    cache: &'a ChunkCache,
    pool: &'a ThreadPool,
    tracker: Option<&'a FileTracker>,
}

impl<'a> DocumentVerifier<'a> {
    /// Verifier without local comparison
    pub fn new(store: &'a dyn ChunkStore, cache: &'a ChunkCache, pool: &'a ThreadPool) -> Self {
        Self {
            store,
            cache,
            pool,
            tracker: None,
        }
    }

    /// Also compare documents with their vault copies
    pub fn with_local(mut self, tracker: &'a FileTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Fetch a document's chunks, returning text per unique id
    fn fetch(&self, doc: &Document) -> Result<Vec<(ChunkId, Option<Arc<str>>)>> {
        let mut seen = HashSet::with_capacity(doc.children.len());
        let unique: Vec<&ChunkId> = doc.children.iter().filter(|id| seen.insert(*id)).collect();

        let store = self.store;
        let cache = self.cache;
        self.pool.install(|| {
            unique
                .par_iter()
                .map(|id| -> Result<(ChunkId, Option<Arc<str>>)> {
                    if let Some(text) = cache.get(id) {
                        return Ok(((*id).clone(), Some(text)));
                    }
                    let text = store.get_chunk(id)?.map(|data| cache.insert((*id).clone(), data));
                    Ok(((*id).clone(), text))
                })
                .collect::<Result<Vec<_>>>()
        })
    }

    /// Classify one document
    ///
    /// Returns the reassembled content alongside, unless chunks are missing.
    pub fn verify_document(&self, doc: &Document) -> Result<(DocumentVerification, Option<String>)> {
        let path = doc.vault_path().to_string();

        let (status, content, chunks_checked) = if doc.is_inline() {
            (DocumentStatus::Match, doc.data.clone(), 0)
        } else {
            let fetched = self.fetch(doc)?;
            let missing: Vec<String> = fetched
                .iter()
                .filter(|(_, text)| text.is_none())
                .map(|(id, _)| id.to_string())
                .collect();

            if !missing.is_empty() {
                (DocumentStatus::Corrupt { missing }, None, fetched.len())
            } else {
                let texts: crate::collections::HashMap<&ChunkId, &str> = fetched
                    .iter()
                    .filter_map(|(id, text)| text.as_deref().map(|t| (id, t)))
                    .collect();
                let mismatched = texts.iter().filter(|(id, text)| !id.matches(text.as_bytes())).count();

                let mut content = String::with_capacity(doc.size as usize);
                for id in &doc.children {
                    if let Some(text) = texts.get(id) {
                        content.push_str(text);
                    }
                }

                let status = if mismatched > 0 {
                    DocumentStatus::ChunkIdMismatch { mismatched }
                } else {
                    let canonical = document_chunk_ids(&content);
                    match first_difference(&canonical, &doc.children) {
                        None => DocumentStatus::Match,
                        Some(index) => DocumentStatus::SchemeMismatch {
                            expected: canonical.len(),
                            recorded: doc.children.len(),
                            first_difference: index,
                        },
                    }
                };
                (status, Some(content), fetched.len())
            }
        };

        let local = match self.tracker {
            Some(tracker) => match tracker.load_path(&path) {
                Ok(Some(state)) => {
                    let local_ids = document_chunk_ids(&state.content);
                    let recorded = if doc.is_inline() {
                        content.as_deref().map(document_chunk_ids).unwrap_or_default()
                    } else {
                        doc.children.clone()
                    };
                    if local_ids == recorded {
                        LocalStatus::Match
                    } else {
                        LocalStatus::Differs {
                            local: local_ids.len(),
                            remote: recorded.len(),
                        }
                    }
                }
                Ok(None) => LocalStatus::Absent,
                Err(e) => LocalStatus::Unreadable(e.to_string()),
            },
            None => LocalStatus::Absent,
        };

        debug!("Verified {}: {:?}, local {:?}", path, status, local);
        Ok((
            DocumentVerification {
                path,
                status,
                local,
                chunks_checked,
            },
            content,
        ))
    }

    /// Verify up to `sample_limit` chunked documents under a prefix
    ///
    /// A limit of 0 verifies every eligible document.
    pub fn verify(&self, prefix: Option<&str>, sample_limit: usize) -> Result<VerificationReport> {
        let start = Instant::now();
        let mut candidates: Vec<Document> = self
            .store
            .list_docs(prefix)?
            .into_iter()
            .filter(|doc| !doc.is_deleted() && !doc.is_unreadable() && !doc.children.is_empty())
            .collect();
        candidates.sort_by(|a, b| a.vault_path().cmp(b.vault_path()));
        let total = candidates.len();
        if sample_limit > 0 {
            candidates.truncate(sample_limit);
        }
        info!("Verifying {} of {} documents", candidates.len(), total);

        let mut documents = Vec::with_capacity(candidates.len());
        for doc in &candidates {
            let (verification, _) = self.verify_document(doc)?;
            if let Some(e) = verification.error() {
                warn!("{}", e);
            }
            if let LocalStatus::Differs { local, remote } = verification.local {
                warn!("{}: local copy has {} chunks, remote {}", verification.path, local, remote);
            }
            documents.push(verification);
        }

        Ok(VerificationReport {
            candidates: total,
            documents,
            duration: start.elapsed(),
        })
    }
}

/// Index of the first position where two id sequences differ
pub fn first_difference(a: &[ChunkId], b: &[ChunkId]) -> Option<usize> {
    if a == b {
        return None;
    }
    Some(a.iter().zip(b).position(|(x, y)| x != y).unwrap_or(a.len().min(b.len())))
}
