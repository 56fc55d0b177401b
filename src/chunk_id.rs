//! Content-addressed chunk identifiers
//!
//! A chunk id is `h:` followed by the base36 rendering of an xxHash64
//! (seed 0) digest. The digest input is the chunk bytes, a `-`, then the
//! decimal byte length of the chunk. This framing is shared with the LiveSync
//! plugin; any change here produces ids the plugin cannot deduplicate against.
//!
//! ```rust
//! use vaultsync::chunk_id::ChunkId;
//!
//! let a = ChunkId::of(b"hello");
//! let b = ChunkId::of(b"hello");
//! assert_eq!(a, b);
//! assert!(a.as_str().starts_with("h:"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh64::Xxh64;

/// Prefix carried by every chunk id
pub const CHUNK_ID_PREFIX: &str = "h:";

const HASH_SEED: u64 = 0;
const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Textual identifier of a chunk
///
/// Ids read from the store are kept verbatim, so a `ChunkId` can also hold
/// legacy ids that do not follow the canonical scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    /// Derive the canonical id of a chunk
    pub fn of(chunk: &[u8]) -> Self {
        ChunkId(format!("{}{}", CHUNK_ID_PREFIX, to_base36(chunk_hash(chunk))))
    }

    /// Wrap an id string read from the store
    pub fn from_raw(raw: impl Into<String>) -> Self {
        ChunkId(raw.into())
    }

    /// Id as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id carries the chunk prefix at all
    pub fn has_chunk_prefix(&self) -> bool {
        self.0.starts_with(CHUNK_ID_PREFIX)
    }

    /// Whether this id is the canonical id for `chunk`
    pub fn matches(&self, chunk: &[u8]) -> bool {
        *self == ChunkId::of(chunk)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChunkId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// xxHash64 over `"{chunk}-{len}"`
pub fn chunk_hash(chunk: &[u8]) -> u64 {
    let mut hasher = Xxh64::new(HASH_SEED);
    hasher.update(chunk);
    hasher.update(b"-");
    hasher.update(chunk.len().to_string().as_bytes());
    hasher.digest()
}

/// Render an unsigned integer in lowercase base36, as JavaScript's
/// `Number.prototype.toString(36)` does for integers
pub fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(13);
    while n > 0 {
        digits.push(BASE36_DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    // Only ASCII digits were pushed.
    digits.into_iter().map(char::from).collect()
}
