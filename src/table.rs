//! The keyed entry table.
//!
//! Maps sub-FSAL opaque handle keys to cache entries. The map is sharded
//! internally; an entry guard holds its shard's latch, so a race-checked
//! insert observes any winner that beat it while still holding the latch.

use std::sync::Arc;

use scc::HashMap as ShardedMap;

use crate::entry::MdcEntry;
use crate::fsal::SubFsal;
use crate::key::CacheKey;

/// Result of a race-checked publish.
pub(crate) enum InsertRace<S: SubFsal> {
    /// The entry is now reachable by key.
    Won,
    /// Another thread published an entry for this key first.
    Lost(Arc<MdcEntry<S>>),
}

pub(crate) struct KeyTable<S: SubFsal> {
    map: ShardedMap<CacheKey, Arc<MdcEntry<S>>>,
}

impl<S: SubFsal> KeyTable<S> {
    pub fn new() -> Self {
        Self {
            map: ShardedMap::new(),
        }
    }

    /// Look up an entry by key. The shard latch is released on return.
    pub async fn find(&self, key: &CacheKey) -> Option<Arc<MdcEntry<S>>> {
        self.map.read_async(key, |_, entry| Arc::clone(entry)).await
    }

    /// Publish an entry under its key, unless a racing thread already did.
    pub async fn insert_or_race(&self, entry: Arc<MdcEntry<S>>) -> InsertRace<S> {
        use scc::hash_map::Entry;

        match self.map.entry_async(entry.key().clone()).await {
            Entry::Occupied(occupied) => InsertRace::Lost(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                vacant.insert_entry(entry);
                InsertRace::Won
            }
        }
    }

    /// Remove the entry if it is still the one published under its key.
    ///
    /// Returns true when this call released the table's reference, meaning
    /// the entry is destroyed as soon as outstanding operation references
    /// drain.
    pub async fn remove_checked(&self, entry: &Arc<MdcEntry<S>>) -> bool {
        self.map
            .remove_if_async(entry.key(), |current| Arc::ptr_eq(current, entry))
            .await
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
