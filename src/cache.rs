//! Process-local cache of chunk payloads
//!
//! Chunks are immutable and keyed by content, so entries never need
//! invalidation. The cache is shared by the worker threads of one run.

use crate::chunk_id::ChunkId;
use crate::collections::ChunkBuildHasher;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Concurrent map from chunk id to chunk text
#[derive(Debug, Default)]
pub struct ChunkCache {
    entries: DashMap<ChunkId, Arc<str>, ChunkBuildHasher>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ChunkCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached text of a chunk
    pub fn get(&self, id: &ChunkId) -> Option<Arc<str>> {
        match self.entries.get(id) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(entry.value()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether a chunk is cached, without touching the statistics
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.entries.contains_key(id)
    }

    /// Add a chunk; an existing entry is kept
    pub fn insert(&self, id: ChunkId, data: impl Into<Arc<str>>) -> Arc<str> {
        Arc::clone(self.entries.entry(id).or_insert_with(|| data.into()).value())
    }

    /// Number of cached chunks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}
