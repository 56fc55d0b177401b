//! Hash collections used for chunk-id lookups
//!
//! With the `gxhash` feature (default) maps and sets hash with gxhash, which
//! needs AES-NI/SSE2 or NEON. Building without the feature falls back to the
//! standard library hasher so the crate still runs on any target.

#[cfg(feature = "gxhash")]
pub use gxhash::{GxBuildHasher as ChunkBuildHasher, HashMap, HashMapExt, HashSet, HashSetExt};

#[cfg(not(feature = "gxhash"))]
pub use std::collections::{HashMap, HashSet};

/// Hasher builder for maps keyed by chunk id
#[cfg(not(feature = "gxhash"))]
pub type ChunkBuildHasher = std::hash::RandomState;

/// `new`/`with_capacity` for maps, matching the gxhash extension trait
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    /// Empty map
    fn new() -> Self;
    /// Empty map with room for `capacity` entries
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for HashMap<K, V> {
    fn new() -> Self {
        Self::default()
    }

    fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, Default::default())
    }
}

/// `new`/`with_capacity` for sets, matching the gxhash extension trait
#[cfg(not(feature = "gxhash"))]
pub trait HashSetExt {
    /// Empty set
    fn new() -> Self;
    /// Empty set with room for `capacity` entries
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<T> HashSetExt for HashSet<T> {
    fn new() -> Self {
        Self::default()
    }

    fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, Default::default())
    }
}
