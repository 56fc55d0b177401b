//! Remote chunk and document store
//!
//! [`ChunkStore`] is the seam between the sync engine and the replicated
//! database. [`CouchStore`] talks to a CouchDB server over HTTP;
//! [`MemoryStore`] keeps everything in process and is what the tests run
//! against.
//!
//! Documents are only ever replaced through revision-conditioned writes.
//! Chunk leaves are immutable and content-addressed, so writing one that
//! already exists is a no-op.

mod couch;
mod memory;

pub use couch::CouchStore;
pub use memory::{MemoryStore, StoreCounters};

use crate::chunk_id::{ChunkId, CHUNK_ID_PREFIX};
use crate::error::Result;
use crate::types::Document;

/// Result of writing a chunk leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPut {
    /// The leaf was written by this call
    Created,
    /// A leaf with this id already existed
    AlreadyPresent,
}

/// Primitives the sync engine needs from the remote side
pub trait ChunkStore: Send + Sync {
    /// Fetch the document for a vault path
    fn get_doc(&self, path: &str) -> Result<Option<Document>>;

    /// Write a document if the stored revision still equals `expected_revision`
    ///
    /// `None` means the document must not exist yet. Returns the new
    /// revision. A mismatch is reported as a conflict and never retried here.
    fn put_doc(&self, doc: &Document, expected_revision: Option<&str>) -> Result<String>;

    /// Fetch a chunk leaf's text
    fn get_chunk(&self, id: &ChunkId) -> Result<Option<String>>;

    /// Write a chunk leaf unless one with the same id exists
    fn put_chunk_if_absent(&self, id: &ChunkId, data: &str) -> Result<ChunkPut>;

    /// List file documents, optionally restricted to a path prefix
    ///
    /// Chunk leaves, design documents and records that are not files are
    /// left out. Tombstones are included; callers decide what to do with them.
    fn list_docs(&self, prefix: Option<&str>) -> Result<Vec<Document>>;

    /// Remove a chunk leaf, returning whether it existed
    fn delete_chunk(&self, id: &ChunkId) -> Result<bool>;
}

impl<S: ChunkStore + ?Sized> ChunkStore for std::sync::Arc<S> {
    fn get_doc(&self, path: &str) -> Result<Option<Document>> {
        (**self).get_doc(path)
    }

    fn put_doc(&self, doc: &Document, expected_revision: Option<&str>) -> Result<String> {
        (**self).put_doc(doc, expected_revision)
    }

    fn get_chunk(&self, id: &ChunkId) -> Result<Option<String>> {
        (**self).get_chunk(id)
    }

    fn put_chunk_if_absent(&self, id: &ChunkId, data: &str) -> Result<ChunkPut> {
        (**self).put_chunk_if_absent(id, data)
    }

    fn list_docs(&self, prefix: Option<&str>) -> Result<Vec<Document>> {
        (**self).list_docs(prefix)
    }

    fn delete_chunk(&self, id: &ChunkId) -> Result<bool> {
        (**self).delete_chunk(id)
    }
}

/// Whether a raw store record is a synced file
///
/// Chunk leaves (`h:` ids) and reserved ids (`_design/...`, `_local/...`)
/// are skipped, as are records with neither chunk children nor inline data.
pub(crate) fn is_file_record(id: &str, value: &serde_json::Value) -> bool {
    if id.starts_with(CHUNK_ID_PREFIX) || id.starts_with('_') {
        return false;
    }
    value.get("children").is_some_and(|c| c.is_array()) || value.get("data").is_some_and(|d| d.is_string())
}

/// Whether a document's vault path falls under an optional prefix
pub(crate) fn path_matches_prefix(doc: &Document, prefix: Option<&str>) -> bool {
    match prefix {
        Some(prefix) => doc.vault_path().starts_with(prefix.trim_start_matches('/')),
        None => true,
    }
}
