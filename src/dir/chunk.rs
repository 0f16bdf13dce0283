//! Dirent chunks.

use std::collections::VecDeque;

use crate::dir::dirent::DirentId;

/// Identifier of a chunk within its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ChunkId(pub u64);

/// A contiguous run of dirents in sub-FSAL readdir order.
///
/// Chunks of one directory form a singly-linked successor graph through
/// `next_ck` (the cookie of the first dirent of the next chunk, 0 when
/// unknown). `prev_chunk` is a populate-time back-link used for readahead
/// linkage and whence-is-name continuation; it is not kept symmetric with
/// `next_ck` stitching.
#[derive(Debug)]
pub(crate) struct Chunk {
    pub dirents: VecDeque<DirentId>,
    pub prev_chunk: Option<ChunkId>,
    pub next_ck: u64,
    /// Recency stamp in the chunk LRU; 0 until registered.
    pub lru_stamp: u64,
}

impl Chunk {
    pub fn new(prev_chunk: Option<ChunkId>) -> Self {
        Self {
            dirents: VecDeque::new(),
            prev_chunk,
            next_ck: 0,
            lru_stamp: 0,
        }
    }

    pub fn num_entries(&self) -> usize {
        self.dirents.len()
    }
}
