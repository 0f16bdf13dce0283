//! Directory entries.

use bitflags::bitflags;

use crate::dir::chunk::ChunkId;
use crate::key::CacheKey;

/// Identifier of a dirent within its directory. Allocated monotonically and
/// never reused for the lifetime of the directory's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct DirentId(pub u64);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DirentFlags: u8 {
        /// No longer resolvable by name; cookie and position are preserved
        /// until the chunk is dropped.
        const DELETED = 1 << 0;
        /// Member of the sort index.
        const SORTED  = 1 << 1;
    }
}

/// A name → child-key binding within one directory.
#[derive(Debug)]
pub(crate) struct Dirent {
    pub name: Box<str>,
    pub namehash: u64,
    /// Key of the child object. Resolving to the child takes a fresh
    /// reference via the keyed table; no pointer is held.
    pub ckey: CacheKey,
    pub flags: DirentFlags,
    /// Readdir cookie; 0 when unknown.
    pub ck: u64,
    /// Chunk membership; `None` means the dirent is detached.
    pub chunk: Option<ChunkId>,
    /// True when this is the last dirent of the directory.
    pub eod: bool,
}

impl Dirent {
    pub fn new(name: Box<str>, namehash: u64, ckey: CacheKey) -> Self {
        Self {
            name,
            namehash,
            ckey,
            flags: DirentFlags::empty(),
            ck: 0,
            chunk: None,
            eod: false,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(DirentFlags::DELETED)
    }
}
