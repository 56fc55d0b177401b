//! Content-defined chunking
//!
//! This module splits file content into variable-length chunks with a
//! Rabin-Karp rolling hash, reproducing the boundary rule of the LiveSync
//! plugin byte for byte. Chunk boundaries only depend on content, so an edit
//! in the middle of a note leaves the chunks before and after it unchanged and
//! both sides of the sync end up sharing most chunk ids.
//!
//! ## Boundary rule
//!
//! - The hash is a 32-bit wrapping polynomial hash over a 48-byte window with
//!   multiplier 31. It is carried across chunk boundaries, never reset.
//! - Once the current chunk holds at least `min_chunk_size` bytes, a position
//!   is a candidate when `hash as u32 % hash_modulus == 1`.
//! - Reaching `max_chunk_size` forces a candidate.
//! - A candidate is skipped if the following byte is a UTF-8 continuation
//!   byte, so chunks of valid text are always valid text.
//!
//! ## Example
//!
//! ```rust
//! use vaultsync::chunking::{ChunkParams, RollingChunker};
//!
//! # fn main() -> vaultsync::Result<()> {
//! let data = vec![b'a'; 200];
//! let chunker = RollingChunker::new(ChunkParams::new(32, 128, 64)?);
//! let chunks = chunker.chunk(&data);
//! assert!(chunks.len() >= 2);
//! assert_eq!(chunks.concat(), data);
//! # Ok(())
//! # }
//! ```

use crate::chunk_id::ChunkId;
use crate::error::{Result, SyncError};
use std::ops::Range;

/// Rolling hash window in bytes
pub const WINDOW_SIZE: usize = 48;
/// Polynomial multiplier of the rolling hash
pub const PRIME: i32 = 31;
/// Remainder that marks a boundary
pub const BOUNDARY_PATTERN: u32 = 1;
/// Lower bound of the average chunk size for text
pub const MIN_PIECE_SIZE_TEXT: usize = 128;
/// Target number of pieces a text document is split into
pub const SPLIT_PIECE_COUNT_TEXT: usize = 20;
/// Floor applied to the derived minimum chunk size
pub const MIN_CHUNK_FLOOR: usize = 20;
/// Absolute maximum chunk size
pub const MAX_PIECE_SIZE: usize = 250 * 1024;

/// `PRIME^(WINDOW_SIZE - 1)` with 32-bit wrapping multiplication
const PRIME_POW_WINDOW: i32 = {
    let mut acc: i32 = 1;
    let mut i = 0;
    while i < WINDOW_SIZE - 1 {
        acc = acc.wrapping_mul(PRIME);
        i += 1;
    }
    acc
};

/// Size limits and boundary modulus for one chunking pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    /// No boundary is accepted before a chunk reaches this size
    pub min_chunk_size: usize,
    /// A boundary is forced once a chunk reaches this size
    pub max_chunk_size: usize,
    /// Divisor of the boundary predicate (the average chunk size)
    pub hash_modulus: u32,
}

impl ChunkParams {
    /// Build an explicit parameter set
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConfiguration`] if a size is zero or the minimum
    /// exceeds the maximum.
    pub fn new(min_chunk_size: usize, max_chunk_size: usize, hash_modulus: u32) -> Result<Self> {
        if min_chunk_size == 0 || max_chunk_size == 0 || hash_modulus == 0 {
            return Err(SyncError::InvalidConfiguration(
                "chunk sizes and modulus must be non-zero".to_string(),
            ));
        }
        if min_chunk_size > max_chunk_size {
            return Err(SyncError::InvalidConfiguration(format!(
                "minimum chunk size {} exceeds maximum {}",
                min_chunk_size, max_chunk_size
            )));
        }
        Ok(Self {
            min_chunk_size,
            max_chunk_size,
            hash_modulus,
        })
    }

    /// Parameters the plugin derives for a text document of `len` bytes
    pub fn for_text(len: usize) -> Self {
        let avg = MIN_PIECE_SIZE_TEXT.max(len / SPLIT_PIECE_COUNT_TEXT);
        let max_chunk_size = MAX_PIECE_SIZE.min(avg * 5);
        let min_chunk_size = (avg / 4).max(MIN_CHUNK_FLOOR).min(max_chunk_size);
        Self {
            min_chunk_size,
            max_chunk_size,
            hash_modulus: avg as u32,
        }
    }
}

/// Content-defined chunker
#[derive(Debug, Clone, Copy)]
pub struct RollingChunker {
    params: ChunkParams,
}

impl RollingChunker {
    /// Create a chunker with explicit parameters
    pub fn new(params: ChunkParams) -> Self {
        Self { params }
    }

    /// Create the chunker used for a text document of `len` bytes
    pub fn for_text(len: usize) -> Self {
        Self::new(ChunkParams::for_text(len))
    }

    /// Parameters in use
    pub fn params(&self) -> ChunkParams {
        self.params
    }

    /// Compute chunk boundaries as contiguous byte ranges
    ///
    /// The ranges cover `data` exactly, in order. Empty input yields no
    /// ranges.
    pub fn boundaries(&self, data: &[u8]) -> Vec<Range<usize>> {
        let ChunkParams {
            min_chunk_size,
            max_chunk_size,
            hash_modulus,
        } = self.params;
        let len = data.len();
        let mut ranges = Vec::with_capacity(len / min_chunk_size.max(1) / 4 + 1);
        let mut start = 0usize;
        let mut hash: i32 = 0;

        for pos in 0..len {
            let byte = data[pos] as i32;
            if pos >= start + WINDOW_SIZE {
                let old = data[pos - WINDOW_SIZE] as i32;
                hash = hash.wrapping_sub(old.wrapping_mul(PRIME_POW_WINDOW));
            }
            hash = hash.wrapping_mul(PRIME).wrapping_add(byte);

            let current = pos - start + 1;
            let candidate = (current >= min_chunk_size
                && (hash as u32) % hash_modulus == BOUNDARY_PATTERN)
                || current >= max_chunk_size;
            if !candidate {
                continue;
            }

            let splits_char = pos + 1 < len && (data[pos + 1] & 0xC0) == 0x80;
            if !splits_char {
                ranges.push(start..pos + 1);
                start = pos + 1;
            }
        }

        if start < len {
            ranges.push(start..len);
        }
        ranges
    }

    /// Split bytes into chunks
    pub fn chunk<'a>(&self, data: &'a [u8]) -> Vec<&'a [u8]> {
        self.boundaries(data).into_iter().map(|r| &data[r]).collect()
    }

    /// Split text into chunks
    pub fn chunk_str<'a>(&self, text: &'a str) -> Vec<&'a str> {
        // Boundaries never fall inside a UTF-8 sequence.
        self.boundaries(text.as_bytes())
            .into_iter()
            .map(|r| &text[r])
            .collect()
    }
}

/// A text document split into chunks with their ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedContent<'a> {
    /// Chunk texts in document order
    pub chunks: Vec<&'a str>,
    /// Chunk ids, parallel to `chunks`
    pub ids: Vec<ChunkId>,
}

impl<'a> ChunkedContent<'a> {
    /// Iterate `(id, chunk)` pairs in document order
    pub fn iter(&self) -> impl Iterator<Item = (&ChunkId, &'a str)> + '_ {
        self.ids.iter().zip(self.chunks.iter().copied())
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the document produced no chunks
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Chunk a text document with the plugin's text parameters and derive ids
pub fn chunk_document(text: &str) -> ChunkedContent<'_> {
    let chunks = RollingChunker::for_text(text.len()).chunk_str(text);
    let ids = chunks.iter().map(|c| ChunkId::of(c.as_bytes())).collect();
    ChunkedContent { chunks, ids }
}

/// Chunk a text document, trusting ids derived from it earlier
///
/// The ids are recomputed if their count does not match the split.
pub fn chunk_document_with_ids(text: &str, ids: Vec<ChunkId>) -> ChunkedContent<'_> {
    let chunks = RollingChunker::for_text(text.len()).chunk_str(text);
    let ids = if ids.len() == chunks.len() {
        ids
    } else {
        chunks.iter().map(|c| ChunkId::of(c.as_bytes())).collect()
    };
    ChunkedContent { chunks, ids }
}

/// Canonical chunk ids of a text document
pub fn document_chunk_ids(text: &str) -> Vec<ChunkId> {
    chunk_document(text).ids
}
