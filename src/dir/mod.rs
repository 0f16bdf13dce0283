//! Directory content: the dirent indexes, chunk list and detached-dirent LRU.
//!
//! All mutation happens under the owning entry's content write lock. The
//! detached list additionally has its own short-section lock so recency
//! bumps can run under the content read lock.

pub(crate) mod chunk;
pub(crate) mod dirent;

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::AtomicU32;
use std::sync::Mutex;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::{MdcError, Result};
use crate::key::{hash_name, CacheKey};

pub(crate) use chunk::{Chunk, ChunkId};
pub(crate) use dirent::{Dirent, DirentFlags, DirentId};

/// Cookies 1 and 2 are reserved for `.` and `..`; the first real dirent
/// cookie a directory can carry.
pub(crate) const FIRST_DIRENT_COOKIE: u64 = 3;

/// By-name index key: ordered by `(hash(name), name)` so colliding hashes
/// occupy distinct slots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct NameKey {
    hash: u64,
    name: Box<str>,
}

/// Directory payload hung off a directory entry.
#[derive(Debug)]
pub(crate) struct DirPayload {
    pub content: RwLock<DirContent>,
    /// Creates in flight below this directory; blocks the negative cache.
    pub icreate_refcnt: AtomicU32,
}

impl DirPayload {
    pub fn new() -> Self {
        Self {
            content: RwLock::new(DirContent::new()),
            icreate_refcnt: AtomicU32::new(0),
        }
    }
}

/// Outcome of a by-name insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    /// Fresh dirent created (unchunked, cookie unknown).
    Inserted(DirentId),
    /// A live dirent with this name and the same child key already exists.
    Existing(DirentId),
    /// A live dirent with this name existed with a different child key; the
    /// key has been replaced in place.
    Updated(DirentId),
}

/// Where `place_new_dirent` ended up putting a dirent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Landed in a chunk; `split` carries the new chunk if the insert
    /// triggered a split.
    Chunked {
        chunk: ChunkId,
        split: Option<ChunkId>,
    },
    /// Left detached. `invalidate` reports whether resident chunks can no
    /// longer be trusted.
    Detached { invalidate: bool },
    /// Inserting a new first entry requires re-computing the cookie of the
    /// current first dirent (carried by name) before placement can proceed.
    NeedFirstFix,
}

/// The cached content of one directory.
#[derive(Debug)]
pub(crate) struct DirContent {
    dirents: FxHashMap<DirentId, Dirent>,
    chunks: FxHashMap<ChunkId, Chunk>,
    /// Resident chunks in creation order; used for cleanup walks.
    chunk_order: Vec<ChunkId>,
    by_name: BTreeMap<NameKey, DirentId>,
    by_ck: BTreeMap<u64, DirentId>,
    sorted: BTreeMap<u64, DirentId>,
    /// Detached dirents, most recently used first. Guarded by its own lock
    /// so bumps can run under the content read lock.
    detached: Mutex<VecDeque<DirentId>>,
    /// Cookie of the first dirent of the earliest cached chunk; 0 if the
    /// beginning of the directory is not cached.
    pub first_ck: u64,
    /// Wire handle of this directory's parent, when known.
    pub parent_wire: Option<Bytes>,
    next_dirent_id: u64,
    next_chunk_id: u64,
}

impl DirContent {
    pub fn new() -> Self {
        Self {
            dirents: FxHashMap::default(),
            chunks: FxHashMap::default(),
            chunk_order: Vec::new(),
            by_name: BTreeMap::new(),
            by_ck: BTreeMap::new(),
            sorted: BTreeMap::new(),
            detached: Mutex::new(VecDeque::new()),
            first_ck: 0,
            parent_wire: None,
            next_dirent_id: 1,
            next_chunk_id: 1,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn dirent(&self, id: DirentId) -> Result<&Dirent> {
        self.dirents
            .get(&id)
            .ok_or(MdcError::ServerFault("dirent id not present"))
    }

    pub fn dirent_mut(&mut self, id: DirentId) -> Result<&mut Dirent> {
        self.dirents
            .get_mut(&id)
            .ok_or(MdcError::ServerFault("dirent id not present"))
    }

    pub fn chunk(&self, id: ChunkId) -> Result<&Chunk> {
        self.chunks
            .get(&id)
            .ok_or(MdcError::ServerFault("chunk id not present"))
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> Result<&mut Chunk> {
        self.chunks
            .get_mut(&id)
            .ok_or(MdcError::ServerFault("chunk id not present"))
    }

    /// Count of live (resolvable) dirents.
    pub fn active_count(&self) -> usize {
        self.by_name.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.chunk_order
            .iter()
            .filter_map(|id| self.chunks.get(id))
            .map(Chunk::num_entries)
            .collect()
    }

    pub fn detached_count(&self) -> usize {
        self.detached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    // ── Name index ──────────────────────────────────────────────────────

    pub fn name_lookup(&self, name: &str) -> Option<DirentId> {
        let hash = hash_name(name);
        self.by_name
            .range((
                Bound::Included(NameKey {
                    hash,
                    name: Box::from(""),
                }),
                Bound::Unbounded,
            ))
            .take_while(|(k, _)| k.hash == hash)
            .find(|(k, _)| &*k.name == name)
            .map(|(_, id)| *id)
    }

    /// Insert a name → child-key binding, reusing or refreshing an existing
    /// live dirent of the same name.
    pub fn insert_dirent(&mut self, name: &str, ckey: CacheKey) -> InsertOutcome {
        if let Some(existing) = self.name_lookup(name) {
            let dirent = self
                .dirents
                .get_mut(&existing)
                .unwrap_or_else(|| unreachable!("by_name points at missing dirent"));
            if dirent.ckey == ckey {
                return InsertOutcome::Existing(existing);
            }
            // Same name resolving to a different object: the old binding is
            // stale, refresh the key in place.
            dirent.ckey = ckey;
            return InsertOutcome::Updated(existing);
        }

        let id = DirentId(self.next_dirent_id);
        self.next_dirent_id += 1;
        let namehash = hash_name(name);
        self.dirents
            .insert(id, Dirent::new(Box::from(name), namehash, ckey));
        self.by_name.insert(
            NameKey {
                hash: namehash,
                name: Box::from(name),
            },
            id,
        );
        InsertOutcome::Inserted(id)
    }

    fn unindex_name(&mut self, id: DirentId) {
        if let Some(dirent) = self.dirents.get(&id) {
            let key = NameKey {
                hash: dirent.namehash,
                name: dirent.name.clone(),
            };
            self.by_name.remove(&key);
        }
    }

    // ── Deletion and removal ────────────────────────────────────────────

    /// Mark a dirent deleted. A chunked dirent keeps its cookie and chunk
    /// position so previously issued readdir cookies stay valid; a detached
    /// dirent is removed outright.
    pub fn set_deleted(&mut self, id: DirentId) {
        let chunked = self
            .dirents
            .get(&id)
            .map(|d| d.chunk.is_some())
            .unwrap_or(false);

        if !chunked {
            self.remove_dirent(id);
            return;
        }

        self.unindex_name(id);
        if let Some(dirent) = self.dirents.get_mut(&id) {
            if dirent.flags.contains(DirentFlags::SORTED) {
                self.sorted.remove(&dirent.ck);
            }
            dirent.flags.remove(DirentFlags::SORTED);
            dirent.flags.insert(DirentFlags::DELETED);
        }
    }

    /// Remove a dirent from every index, its chunk, and the detached list.
    pub fn remove_dirent(&mut self, id: DirentId) {
        self.unindex_name(id);
        let Some(dirent) = self.dirents.remove(&id) else {
            return;
        };
        if dirent.ck != 0 {
            if self.by_ck.get(&dirent.ck) == Some(&id) {
                self.by_ck.remove(&dirent.ck);
            }
            if self.sorted.get(&dirent.ck) == Some(&id) {
                self.sorted.remove(&dirent.ck);
            }
        }
        match dirent.chunk {
            Some(chunk_id) => {
                if let Some(chunk) = self.chunks.get_mut(&chunk_id) {
                    chunk.dirents.retain(|d| *d != id);
                }
            }
            None => {
                self.detached
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .retain(|d| *d != id);
            }
        }
    }

    // ── Detached-dirent LRU ─────────────────────────────────────────────

    /// Record a dirent as detached, in the MRU position. If the maximum
    /// number of detached dirents would be exceeded, the LRU dirent is
    /// evicted from the directory.
    pub fn add_detached(&mut self, id: DirentId, max: usize) {
        let evict = {
            let list = self
                .detached
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if list.len() >= max.max(1) {
                list.back().copied()
            } else {
                None
            }
        };
        if let Some(victim) = evict {
            trace!(?victim, "aging out oldest detached dirent");
            self.remove_dirent(victim);
        }
        self.detached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_front(id);
    }

    /// Move a detached dirent to the MRU position. Callable under the
    /// content read lock.
    pub fn bump_detached(&self, id: DirentId) {
        let mut list = self
            .detached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pos) = list.iter().position(|d| *d == id) {
            if pos != 0 {
                list.remove(pos);
                list.push_front(id);
            }
        }
    }

    /// Detach a dirent from the detached list (it is about to join a chunk).
    fn unlist_detached(&mut self, id: DirentId) {
        self.detached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|d| *d != id);
    }

    // ── Chunks ──────────────────────────────────────────────────────────

    pub fn new_chunk(&mut self, prev_chunk: Option<ChunkId>) -> ChunkId {
        let id = ChunkId(self.next_chunk_id);
        self.next_chunk_id += 1;
        self.chunks.insert(id, Chunk::new(prev_chunk));
        self.chunk_order.push(id);
        id
    }

    /// Append a dirent to the tail of a chunk, assigning its cookie and
    /// inserting it in the by-cookie index.
    pub fn append_to_chunk(&mut self, chunk_id: ChunkId, id: DirentId, ck: u64) -> Result<()> {
        {
            let dirent = self.dirent_mut(id)?;
            dirent.chunk = Some(chunk_id);
            dirent.ck = ck;
        }
        // The dirent may have been sitting on the detached list.
        self.unlist_detached(id);
        self.by_ck.insert(ck, id);
        self.chunk_mut(chunk_id)?.dirents.push_back(id);
        Ok(())
    }

    pub fn lookup_ck(&self, ck: u64) -> Option<DirentId> {
        self.by_ck.get(&ck).copied()
    }

    /// Next dirent in cookie order strictly after `ck`.
    pub fn next_ck_after(&self, ck: u64) -> Option<(u64, DirentId)> {
        self.by_ck
            .range((Bound::Excluded(ck), Bound::Unbounded))
            .next()
            .map(|(c, id)| (*c, *id))
    }

    pub fn first_by_ck(&self) -> Option<(u64, DirentId)> {
        self.by_ck.iter().next().map(|(c, id)| (*c, *id))
    }

    pub fn first_dirent_of(&self, chunk_id: ChunkId) -> Option<DirentId> {
        self.chunks
            .get(&chunk_id)
            .and_then(|c| c.dirents.front().copied())
    }

    pub fn has_chunk(&self, chunk_id: ChunkId) -> bool {
        self.chunks.contains_key(&chunk_id)
    }

    /// Enter a chunked dirent in the sort index, unless its cookie slot is
    /// already taken (the colliding entry is simply not sorted).
    pub fn mark_sorted(&mut self, id: DirentId) -> Result<()> {
        let ck = self.dirent(id)?.ck;
        if ck == 0 || self.sorted.contains_key(&ck) {
            return Ok(());
        }
        self.sorted.insert(ck, id);
        self.dirent_mut(id)?.flags.insert(DirentFlags::SORTED);
        Ok(())
    }

    pub fn sorted_occupant_name(&self, ck: u64) -> Option<(DirentId, Box<str>)> {
        let id = self.sorted.get(&ck).copied()?;
        self.dirents.get(&id).map(|d| (id, d.name.clone()))
    }

    /// Assign a cookie for a dirent in unchunked (legacy) mode: the name
    /// hash, perturbed by a bounded quadratic probe on collision.
    pub fn assign_legacy_cookie(&mut self, id: DirentId) -> Result<u64> {
        let base = self.dirent(id)?.namehash.max(FIRST_DIRENT_COOKIE);
        for i in 0u64..16 {
            let ck = base.wrapping_add(i * i).max(FIRST_DIRENT_COOKIE);
            if !self.by_ck.contains_key(&ck) {
                self.by_ck.insert(ck, id);
                self.dirent_mut(id)?.ck = ck;
                return Ok(ck);
            }
        }
        Err(MdcError::ServerFault("legacy cookie probe exhausted"))
    }

    /// Follow `next_ck` links across resident chunks; returns the last
    /// resident chunk before a gap, if any link resolved.
    pub fn skip_chunks(&self, mut next_ck: u64) -> Option<ChunkId> {
        let mut found = None;
        while next_ck != 0 {
            let Some(id) = self.lookup_ck(next_ck) else {
                break;
            };
            let Some(chunk_id) = self.dirents.get(&id).and_then(|d| d.chunk) else {
                break;
            };
            found = Some(chunk_id);
            next_ck = match self.chunks.get(&chunk_id) {
                Some(chunk) => chunk.next_ck,
                None => 0,
            };
        }
        found
    }

    pub fn last_name_of_chunk(&self, chunk_id: ChunkId) -> Option<Box<str>> {
        let chunk = self.chunks.get(&chunk_id)?;
        let last = chunk.dirents.back()?;
        self.dirents.get(last).map(|d| d.name.clone())
    }

    /// Remove a chunk and all its dirents from the directory.
    ///
    /// Returns the chunk's LRU stamp so the caller can drop it from the
    /// chunk LRU.
    pub fn clean_chunk(&mut self, chunk_id: ChunkId) -> u64 {
        let Some(chunk) = self.chunks.remove(&chunk_id) else {
            return 0;
        };
        let stamp = chunk.lru_stamp;
        for id in chunk.dirents.iter().copied().collect::<Vec<_>>() {
            self.unindex_name(id);
            if let Some(dirent) = self.dirents.remove(&id) {
                if dirent.ck != 0 {
                    if self.by_ck.get(&dirent.ck) == Some(&id) {
                        self.by_ck.remove(&dirent.ck);
                    }
                    if self.sorted.get(&dirent.ck) == Some(&id) {
                        self.sorted.remove(&dirent.ck);
                    }
                    if self.first_ck == dirent.ck {
                        self.first_ck = 0;
                    }
                }
            }
        }
        self.chunk_order.retain(|c| *c != chunk_id);
        for other in self.chunks.values_mut() {
            if other.prev_chunk == Some(chunk_id) {
                other.prev_chunk = None;
            }
        }
        stamp
    }

    /// Drop every cached dirent and chunk.
    ///
    /// Returns the LRU stamps of the removed chunks. The caller resets the
    /// trust flags on the owning entry.
    pub fn invalidate_all(&mut self) -> Vec<u64> {
        trace!("invalidating directory content");
        let mut stamps = Vec::new();
        for chunk_id in self.chunk_order.clone() {
            let stamp = self.clean_chunk(chunk_id);
            if stamp != 0 {
                stamps.push(stamp);
            }
        }
        self.dirents.clear();
        self.by_name.clear();
        self.by_ck.clear();
        self.sorted.clear();
        self.chunk_order.clear();
        self.chunks.clear();
        self.detached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.first_ck = 0;
        stamps
    }

    // ── Placement of freshly discovered dirents ─────────────────────────

    /// Re-key an existing dirent to a new cookie (first-entry fixup).
    pub fn reassign_cookie(&mut self, id: DirentId, new_ck: u64) -> Result<()> {
        let old_ck = self.dirent(id)?.ck;
        if self.by_ck.get(&old_ck) == Some(&id) {
            self.by_ck.remove(&old_ck);
        }
        if self.sorted.get(&old_ck) == Some(&id) {
            self.sorted.remove(&old_ck);
            self.sorted.insert(new_ck, id);
        }
        self.by_ck.insert(new_ck, id);
        self.dirent_mut(id)?.ck = new_ck;
        Ok(())
    }

    /// Decide whether a freshly discovered dirent (create, link, uncached
    /// lookup) belongs to an already-cached chunk, and insert it there if
    /// so. `ck` is the cookie the sub-FSAL computed for the name; callers
    /// resolve `Placement::NeedFirstFix` by re-computing the current first
    /// entry's cookie and calling [`DirContent::reassign_cookie`] first.
    pub fn place_new_dirent(
        &mut self,
        id: DirentId,
        ck: u64,
        split_threshold: usize,
    ) -> Result<Placement> {
        if let Some(&occupant) = self.sorted.get(&ck) {
            if ck == FIRST_DIRENT_COOKIE && occupant != id {
                // Inserting a new first entry for a sub-FSAL that cannot
                // compute the cookie of the very first dirent.
                return Ok(Placement::NeedFirstFix);
            }
            // A different dirent already owns this cookie position.
            return Ok(Placement::Detached { invalidate: true });
        }

        let left = self
            .sorted
            .range(..ck)
            .next_back()
            .map(|(_, d)| *d);
        let right = self
            .sorted
            .range((Bound::Excluded(ck), Bound::Unbounded))
            .next()
            .map(|(_, d)| *d);

        let (left_chunk, left_eod) = match left {
            Some(l) => {
                let d = self.dirent(l)?;
                (d.chunk, d.eod)
            }
            None => (None, false),
        };
        let (right_chunk, right_ck) = match right {
            Some(r) => {
                let d = self.dirent(r)?;
                (d.chunk, d.ck)
            }
            None => (None, 0),
        };

        // Every dirent in the sort index is in a chunk.
        let target: ChunkId;
        let at_end: bool;
        match (left, right) {
            (None, None) => {
                // Sort index empty: nothing to attach to.
                return Ok(Placement::Detached { invalidate: true });
            }
            (None, Some(_)) => {
                let rc = right_chunk
                    .ok_or(MdcError::ServerFault("sorted dirent without a chunk"))?;
                if self.first_ck == right_ck {
                    // New first entry of the directory.
                    target = rc;
                    at_end = false;
                } else {
                    // Somewhere before the first cached chunk; the chunks
                    // remain trusted, a readdir of that region will populate
                    // a new chunk.
                    return Ok(Placement::Detached { invalidate: false });
                }
            }
            (Some(_), None) => {
                let lc = left_chunk
                    .ok_or(MdcError::ServerFault("sorted dirent without a chunk"))?;
                if left_eod {
                    // New last entry of the directory.
                    target = lc;
                    at_end = true;
                } else {
                    // Somewhere after the last cached chunk.
                    return Ok(Placement::Detached { invalidate: false });
                }
            }
            (Some(_), Some(_)) => {
                let lc = left_chunk
                    .ok_or(MdcError::ServerFault("sorted dirent without a chunk"))?;
                let rc = right_chunk
                    .ok_or(MdcError::ServerFault("sorted dirent without a chunk"))?;
                if lc != rc && self.chunk(rc)?.prev_chunk != Some(lc) {
                    // Neighbors straddle a gap between non-adjacent chunks:
                    // the dirent lives in an uncached region.
                    return Ok(Placement::Detached { invalidate: false });
                }
                target = rc;
                at_end = false;
            }
        }

        if self.by_ck.contains_key(&ck) {
            // Cookie already present outside the sort index; cannot place.
            return Ok(Placement::Detached { invalidate: true });
        }

        // Commit: indexes first, then the chunk list position.
        self.unlist_detached(id);
        self.by_ck.insert(ck, id);
        self.sorted.insert(ck, id);
        {
            let dirent = self.dirent_mut(id)?;
            dirent.ck = ck;
            dirent.chunk = Some(target);
            dirent.flags.insert(DirentFlags::SORTED);
        }

        if at_end {
            // Append behind `left`, which is the current eod dirent.
            self.chunk_mut(target)?.dirents.push_back(id);
            if let Some(l) = left {
                self.dirent_mut(l)?.eod = false;
            }
            self.dirent_mut(id)?.eod = true;
        } else {
            let right_id =
                right.ok_or(MdcError::ServerFault("chunk-front insert without successor"))?;
            let pos = {
                let chunk = self.chunk(target)?;
                chunk
                    .dirents
                    .iter()
                    .position(|d| *d == right_id)
                    .unwrap_or(0)
            };
            self.chunk_mut(target)?.dirents.insert(pos, id);

            if pos == 0 {
                match left_chunk {
                    Some(lc) if lc != target => {
                        // Straddling adjacent chunks: the predecessor chunk
                        // now continues at the new dirent.
                        self.chunk_mut(lc)?.next_ck = ck;
                    }
                    Some(_) => {}
                    None => {
                        trace!(ck, "new first dirent of directory");
                        self.first_ck = ck;
                    }
                }
            }
        }

        let split = if self.chunk(target)?.num_entries() >= split_threshold.max(2) {
            Some(self.split_chunk(target)?)
        } else {
            None
        };

        Ok(Placement::Chunked {
            chunk: target,
            split,
        })
    }

    /// Split a full chunk in half; the second half becomes a new chunk with
    /// `prev_chunk` pointing at the first half and `next_ck` inherited.
    fn split_chunk(&mut self, chunk_id: ChunkId) -> Result<ChunkId> {
        let split_id = ChunkId(self.next_chunk_id);
        self.next_chunk_id += 1;

        let (tail, next_ck) = {
            let chunk = self.chunk_mut(chunk_id)?;
            let keep = chunk.num_entries() / 2;
            let tail: VecDeque<DirentId> = chunk.dirents.split_off(keep);
            (tail, chunk.next_ck)
        };

        let first_tail_ck = tail
            .front()
            .and_then(|id| self.dirents.get(id))
            .map(|d| d.ck)
            .ok_or(MdcError::ServerFault("splitting an empty chunk"))?;

        trace!(?chunk_id, ?split_id, first_tail_ck, "splitting chunk");

        for id in &tail {
            if let Some(dirent) = self.dirents.get_mut(id) {
                dirent.chunk = Some(split_id);
            }
        }

        let mut split = Chunk::new(Some(chunk_id));
        split.dirents = tail;
        split.next_ck = next_ck;
        self.chunks.insert(split_id, split);
        self.chunk_order.push(split_id);

        self.chunk_mut(chunk_id)?.next_ck = first_tail_ck;

        Ok(split_id)
    }

    // ── Consistency checking ────────────────────────────────────────────

    /// Verify the cross-structure invariants; used by tests and the audit
    /// surface.
    pub fn check_invariants(&self) -> Result<()> {
        for (id, dirent) in &self.dirents {
            if let Some(chunk_id) = dirent.chunk {
                let chunk = self
                    .chunks
                    .get(&chunk_id)
                    .ok_or(MdcError::ServerFault("dirent points at missing chunk"))?;
                if !chunk.dirents.contains(id) {
                    return Err(MdcError::ServerFault("dirent not in its chunk's list"));
                }
                if !self.chunk_order.contains(&chunk_id) {
                    return Err(MdcError::ServerFault("chunk not in directory list"));
                }
            } else {
                let list = self
                    .detached
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if !list.contains(id) {
                    return Err(MdcError::ServerFault("chunkless dirent not detached"));
                }
            }
            if dirent.flags.contains(DirentFlags::SORTED) {
                if self.sorted.get(&dirent.ck) != Some(id) {
                    return Err(MdcError::ServerFault("sorted flag without sort entry"));
                }
                if dirent.chunk.is_none() {
                    return Err(MdcError::ServerFault("sorted dirent outside any chunk"));
                }
            }
        }

        let chunked_total: usize = self.chunks.values().map(Chunk::num_entries).sum();
        let chunk_member_total = self
            .dirents
            .values()
            .filter(|d| d.chunk.is_some())
            .count();
        if chunked_total != chunk_member_total {
            return Err(MdcError::ServerFault("chunk counts out of sync"));
        }

        if self.first_ck != 0 && !self.by_ck.contains_key(&self.first_ck) {
            return Err(MdcError::ServerFault("first_ck points at no dirent"));
        }

        Ok(())
    }
}
