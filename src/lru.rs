//! Recency tracking for entries and directory chunks.
//!
//! The entry pool keeps a two-segment LRU (probation and hot): new entries
//! start in probation and are promoted on their first hit, so a scan of
//! never-reused entries cannot flush the hot set. Eviction only ever
//! considers entries with no outstanding operation references. The chunk
//! LRU is independent of the entry LRU; a hot entry may have cold chunks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use hashlink::LinkedHashMap;

use crate::dir::ChunkId;
use crate::entry::{EntryFlags, MdcEntry};
use crate::fsal::SubFsal;
use crate::key::CacheKey;

/// Snapshot of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Export-mapping slow-path scans.
    pub inode_mapping: u64,
    /// Keyed lookups that hit.
    pub inode_hit: u64,
    /// Entries added to the cache.
    pub inode_added: u64,
    /// Insert races lost to a concurrent thread.
    pub inode_conf: u64,
}

#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    inode_mapping: AtomicU64,
    inode_hit: AtomicU64,
    inode_added: AtomicU64,
    inode_conf: AtomicU64,
}

impl CacheStats {
    pub fn inode_mapping_inc(&self) {
        self.inode_mapping.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inode_hit_inc(&self) {
        self.inode_hit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inode_added_inc(&self) {
        self.inode_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inode_conf_inc(&self) {
        self.inode_conf.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            inode_mapping: self.inode_mapping.load(Ordering::Relaxed),
            inode_hit: self.inode_hit.load(Ordering::Relaxed),
            inode_added: self.inode_added.load(Ordering::Relaxed),
            inode_conf: self.inode_conf.load(Ordering::Relaxed),
        }
    }
}

type Lane<S> = LinkedHashMap<CacheKey, Weak<MdcEntry<S>>>;

/// Recency pool over cache entries.
pub(crate) struct LruPool<S: SubFsal> {
    probation: Mutex<Lane<S>>,
    hot: Mutex<Lane<S>>,
    stats: CacheStats,
}

impl<S: SubFsal> LruPool<S> {
    pub fn new() -> Self {
        Self {
            probation: Mutex::new(LinkedHashMap::new()),
            hot: Mutex::new(LinkedHashMap::new()),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn lock_lane(lane: &Mutex<Lane<S>>) -> std::sync::MutexGuard<'_, Lane<S>> {
        lane.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a freshly published entry (probation MRU).
    pub fn insert(&self, entry: &Arc<MdcEntry<S>>) {
        Self::lock_lane(&self.probation).insert(entry.key().clone(), Arc::downgrade(entry));
    }

    /// Record a hit: promote out of probation, or refresh within hot.
    pub fn touch(&self, entry: &Arc<MdcEntry<S>>) {
        let key = entry.key();
        let weak = {
            let mut probation = Self::lock_lane(&self.probation);
            probation.remove(key)
        };
        let mut hot = Self::lock_lane(&self.hot);
        match weak {
            Some(weak) => {
                hot.insert(key.clone(), weak);
            }
            None => {
                // Refresh recency, or re-track an entry the lanes lost.
                match hot.remove(key) {
                    Some(weak) => {
                        hot.insert(key.clone(), weak);
                    }
                    None => {
                        hot.insert(key.clone(), Arc::downgrade(entry));
                    }
                }
            }
        }
    }

    pub fn remove(&self, key: &CacheKey) {
        Self::lock_lane(&self.probation).remove(key);
        Self::lock_lane(&self.hot).remove(key);
    }

    /// Pop up to `max` eviction candidates, coldest first. Entries with
    /// outstanding references (or already unreachable) are put back at the
    /// MRU end of their lane; dead weak pointers are dropped.
    pub fn pop_candidates(&self, max: usize) -> Vec<Arc<MdcEntry<S>>> {
        let mut victims = Vec::new();
        for lane in [&self.probation, &self.hot] {
            if victims.len() >= max {
                break;
            }
            let mut guard = Self::lock_lane(lane);
            let mut scanned = 0;
            let lane_len = guard.len();
            while victims.len() < max && scanned < lane_len {
                scanned += 1;
                let Some((key, weak)) = guard.pop_front() else {
                    break;
                };
                let Some(entry) = weak.upgrade() else {
                    continue;
                };
                if entry.refcnt() == 0 && !entry.flags_test(EntryFlags::UNREACHABLE) {
                    victims.push(entry);
                } else {
                    guard.insert(key, weak);
                }
            }
        }
        victims
    }
}

/// Recency list over resident dirent chunks, across all directories.
pub(crate) struct ChunkLru<S: SubFsal> {
    list: Mutex<LinkedHashMap<u64, (Weak<MdcEntry<S>>, ChunkId)>>,
    next_stamp: AtomicU64,
    hwmark: usize,
}

impl<S: SubFsal> ChunkLru<S> {
    pub fn new(hwmark: usize) -> Self {
        Self {
            list: Mutex::new(LinkedHashMap::new()),
            next_stamp: AtomicU64::new(1),
            hwmark: hwmark.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkedHashMap<u64, (Weak<MdcEntry<S>>, ChunkId)>> {
        self.list
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a chunk; returns the recency stamp to store on the chunk.
    pub fn register(&self, owner: &Arc<MdcEntry<S>>, chunk: ChunkId) -> u64 {
        let stamp = self.next_stamp.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(stamp, (Arc::downgrade(owner), chunk));
        stamp
    }

    /// Move a chunk to the MRU end.
    pub fn bump(&self, stamp: u64) {
        if stamp == 0 {
            return;
        }
        let mut list = self.lock();
        if let Some(value) = list.remove(&stamp) {
            list.insert(stamp, value);
        }
    }

    pub fn remove(&self, stamp: u64) {
        if stamp == 0 {
            return;
        }
        self.lock().remove(&stamp);
    }

    pub fn remove_all(&self, stamps: &[u64]) {
        let mut list = self.lock();
        for stamp in stamps {
            list.remove(stamp);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn over_hwmark(&self) -> bool {
        self.lock().len() >= self.hwmark
    }

    /// Pop the coldest chunk for reclaim.
    pub fn pop_victim(&self) -> Option<(u64, Weak<MdcEntry<S>>, ChunkId)> {
        self.lock()
            .pop_front()
            .map(|(stamp, (owner, chunk))| (stamp, owner, chunk))
    }

    /// Put a victim back at the MRU end after a failed reclaim.
    pub fn put_back(&self, stamp: u64, owner: Weak<MdcEntry<S>>, chunk: ChunkId) {
        self.lock().insert(stamp, (owner, chunk));
    }
}
