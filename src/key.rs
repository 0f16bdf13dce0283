//! Cache keys: a sub-FSAL identifier plus the opaque handle bytes it issued.
//!
//! The 64-bit hash is computed once at construction and stored on the key, so
//! equality checks compare the hash before touching the byte payload.

use std::hash::{Hash, Hasher};

use bytes::Bytes;
use rustc_hash::FxHasher;

/// Identifies the sub-FSAL whose handle bytes a key carries. Keys from
/// different sub-FSALs never compare equal even if their bytes collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FsalId(pub u32);

/// A hashed, portable identifier for a cached object.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    fsal: FsalId,
    bytes: Bytes,
    hk: u64,
}

impl CacheKey {
    pub fn new(fsal: FsalId, bytes: Bytes) -> Self {
        let hk = hash_key_bytes(fsal, &bytes);
        Self { fsal, bytes, hk }
    }

    pub fn fsal(&self) -> FsalId {
        self.fsal
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// The precomputed hash used for table placement.
    pub fn hk(&self) -> u64 {
        self.hk
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        // Hash first; the byte payload is only compared on a hash match.
        self.hk == other.hk && self.fsal == other.fsal && self.bytes == other.bytes
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hk);
    }
}

pub(crate) fn hash_key_bytes(fsal: FsalId, bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u32(fsal.0);
    hasher.write(bytes);
    hasher.finish()
}

/// Hash of a dirent name for the by-name directory index.
pub(crate) fn hash_name(name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}
