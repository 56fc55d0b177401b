//! In-process [`ChunkStore`] with CouchDB-like revision semantics

use super::{path_matches_prefix, ChunkPut, ChunkStore};
use crate::chunk_id::{to_base36, ChunkId};
use crate::collections::HashMap;
use crate::error::{Result, SyncError};
use crate::types::{doc_id_for_path, Document};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Request counts observed by a [`MemoryStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounters {
    /// `get_doc` calls
    pub doc_gets: usize,
    /// Successful `put_doc` calls
    pub doc_puts: usize,
    /// `get_chunk` calls
    pub chunk_gets: usize,
    /// Chunk leaves actually created
    pub chunk_puts: usize,
    /// `list_docs` calls
    pub listings: usize,
    /// Chunk leaves removed
    pub chunk_deletes: usize,
}

#[derive(Default)]
struct Counters {
    doc_gets: AtomicUsize,
    doc_puts: AtomicUsize,
    chunk_gets: AtomicUsize,
    chunk_puts: AtomicUsize,
    listings: AtomicUsize,
    chunk_deletes: AtomicUsize,
}

#[derive(Default)]
struct State {
    docs: BTreeMap<String, Document>,
    chunks: HashMap<ChunkId, String>,
}

/// Store kept entirely in memory
///
/// Revisions follow CouchDB's `{generation}-{digest}` shape, and writes with
/// a stale revision fail with [`SyncError::Conflict`]. Failure injection
/// hooks let tests simulate an unreachable server or a concurrent writer.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    counters: Counters,
    offline: AtomicBool,
    forced_conflicts: Mutex<HashMap<String, usize>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the request counters
    pub fn counters(&self) -> StoreCounters {
        StoreCounters {
            doc_gets: self.counters.doc_gets.load(Ordering::SeqCst),
            doc_puts: self.counters.doc_puts.load(Ordering::SeqCst),
            chunk_gets: self.counters.chunk_gets.load(Ordering::SeqCst),
            chunk_puts: self.counters.chunk_puts.load(Ordering::SeqCst),
            listings: self.counters.listings.load(Ordering::SeqCst),
            chunk_deletes: self.counters.chunk_deletes.load(Ordering::SeqCst),
        }
    }

    /// Number of chunk leaves stored
    pub fn chunk_count(&self) -> usize {
        self.state.read().chunks.len()
    }

    /// Whether a chunk leaf exists
    pub fn has_chunk(&self, id: &ChunkId) -> bool {
        self.state.read().chunks.contains_key(id)
    }

    /// Make every call fail with a retryable transport error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Let the next `times` document writes for `path` lose a race
    ///
    /// Each injected conflict bumps the stored revision without touching the
    /// content, as a replica re-saving identical content would.
    pub fn inject_conflicts(&self, path: &str, times: usize) {
        self.forced_conflicts.lock().insert(doc_id_for_path(path), times);
    }

    /// Store a document as-is, bypassing revision checks
    ///
    /// Used to seed legacy or hand-crafted records. A document built with
    /// [`Document::unreadable`] behaves like a record whose body does not
    /// decode: it is listed, and reading it fails. A revision is assigned
    /// if the document carries none.
    pub fn insert_raw(&self, mut doc: Document) -> String {
        let mut state = self.state.write();
        let revision = doc.revision.clone().unwrap_or_else(|| next_revision(None, &doc));
        doc.revision = Some(revision.clone());
        state.docs.insert(doc.id.clone(), doc);
        revision
    }

    /// Store a chunk leaf under an arbitrary id
    pub fn insert_raw_chunk(&self, id: ChunkId, data: &str) {
        self.state.write().chunks.insert(id, data.to_string());
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::transport("memory store is offline"));
        }
        Ok(())
    }

    fn take_forced_conflict(&self, id: &str) -> bool {
        let mut forced = self.forced_conflicts.lock();
        match forced.get_mut(id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Next revision string for a document body
fn next_revision(current: Option<&str>, doc: &Document) -> String {
    let generation = current
        .and_then(|rev| rev.split('-').next())
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    let body = serde_json::to_vec(doc).unwrap_or_default();
    let digest = xxhash_rust::xxh64::xxh64(&body, generation);
    format!("{}-{}", generation, to_base36(digest))
}

impl ChunkStore for MemoryStore {
    fn get_doc(&self, path: &str) -> Result<Option<Document>> {
        self.check_online()?;
        self.counters.doc_gets.fetch_add(1, Ordering::SeqCst);
        match self.state.read().docs.get(&doc_id_for_path(path)) {
            Some(Document {
                unreadable: Some(message),
                ..
            }) => Err(SyncError::MalformedDocument {
                path: path.to_string(),
                message: message.clone(),
            }),
            found => Ok(found.cloned()),
        }
    }

    fn put_doc(&self, doc: &Document, expected_revision: Option<&str>) -> Result<String> {
        self.check_online()?;

        if self.take_forced_conflict(&doc.id) {
            let mut state = self.state.write();
            if let Some(stored) = state.docs.get_mut(&doc.id) {
                let bumped = next_revision(stored.revision.as_deref(), stored);
                stored.revision = Some(bumped);
            }
            return Err(SyncError::conflict(doc.vault_path()));
        }

        let mut state = self.state.write();
        let current = state.docs.get(&doc.id).and_then(|d| d.revision.clone());
        if current.as_deref() != expected_revision {
            return Err(SyncError::conflict(doc.vault_path()));
        }

        let mut stored = doc.clone();
        let revision = next_revision(current.as_deref(), doc);
        stored.revision = Some(revision.clone());
        state.docs.insert(stored.id.clone(), stored);
        self.counters.doc_puts.fetch_add(1, Ordering::SeqCst);
        Ok(revision)
    }

    fn get_chunk(&self, id: &ChunkId) -> Result<Option<String>> {
        self.check_online()?;
        self.counters.chunk_gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.read().chunks.get(id).cloned())
    }

    fn put_chunk_if_absent(&self, id: &ChunkId, data: &str) -> Result<ChunkPut> {
        self.check_online()?;
        let mut state = self.state.write();
        if state.chunks.contains_key(id) {
            return Ok(ChunkPut::AlreadyPresent);
        }
        state.chunks.insert(id.clone(), data.to_string());
        self.counters.chunk_puts.fetch_add(1, Ordering::SeqCst);
        Ok(ChunkPut::Created)
    }

    fn list_docs(&self, prefix: Option<&str>) -> Result<Vec<Document>> {
        self.check_online()?;
        self.counters.listings.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .read()
            .docs
            .values()
            .filter(|doc| path_matches_prefix(doc, prefix))
            .cloned()
            .collect())
    }

    fn delete_chunk(&self, id: &ChunkId) -> Result<bool> {
        self.check_online()?;
        let removed = self.state.write().chunks.remove(id).is_some();
        if removed {
            self.counters.chunk_deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }
}
