//! Export objects and the entry ↔ export mapping.
//!
//! An entry may be reachable through many exports; each export keeps the set
//! of entries mapped through it so unexport can unmap them all. Unexport
//! races with in-flight operations are resolved by an atomic flag byte that
//! is re-checked under the write locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::trace;

use crate::entry::MdcEntry;
use crate::error::{MdcError, Result};
use crate::fsal::SubFsal;
use crate::key::CacheKey;
use crate::lru::CacheStats;

const FLAG_UNEXPORT: u8 = 1 << 0;

/// Per-export overrides applied at [`crate::MdCache::add_export`] time.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Attribute TTL override for entries reached through this export.
    pub expire_time_attr: Option<Duration>,
    /// Serve negative lookups from fully-populated trusted directories.
    pub trust_readdir_negative_cache: Option<bool>,
}

/// An administrative mount point the cache is exposed through.
pub struct Export<S: SubFsal> {
    id: u16,
    flags: AtomicU8,
    expire_time_attr: Duration,
    trust_readdir_negative_cache: bool,
    /// Entries currently mapped through this export.
    entries: Mutex<HashMap<CacheKey, Weak<MdcEntry<S>>>>,
}

impl<S: SubFsal> std::fmt::Debug for Export<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Export")
            .field("id", &self.id)
            .field("unexport", &self.unexport_in_progress())
            .finish_non_exhaustive()
    }
}

impl<S: SubFsal> Export<S> {
    pub(crate) fn new(
        id: u16,
        expire_time_attr: Duration,
        trust_readdir_negative_cache: bool,
    ) -> Self {
        Self {
            id,
            flags: AtomicU8::new(0),
            expire_time_attr,
            trust_readdir_negative_cache,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn expire_time_attr(&self) -> Duration {
        self.expire_time_attr
    }

    pub(crate) fn trust_negative_cache(&self) -> bool {
        self.trust_readdir_negative_cache
    }

    pub fn unexport_in_progress(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_UNEXPORT != 0
    }

    pub(crate) fn set_unexport(&self) {
        self.flags.fetch_or(FLAG_UNEXPORT, Ordering::AcqRel);
    }

    /// Drop the mapping record only if it still points at this entry; a
    /// racing publish for the same key must not lose its record.
    pub(crate) fn forget_entry_exact(&self, entry: &Arc<MdcEntry<S>>) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(weak) = entries.get(entry.key()) {
            if std::ptr::eq(weak.as_ptr(), Arc::as_ptr(entry)) {
                entries.remove(entry.key());
            }
        }
    }

    pub(crate) fn drain_entries(&self) -> Vec<(CacheKey, Weak<MdcEntry<S>>)> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect()
    }

    /// How many entries are currently mapped through this export.
    pub fn mapped_entry_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Verify the entry is mapped to this export, adding the mapping if it
    /// is missing.
    ///
    /// Fast path is a single atomic load of the entry's first export id. The
    /// slow path scans the export list under the attribute read lock, then
    /// upgrades to the write lock and re-checks both the list and the
    /// unexport flag before appending a mapping record on both sides.
    pub(crate) async fn check_mapping(
        self: &Arc<Self>,
        entry: &Arc<MdcEntry<S>>,
        stats: &CacheStats,
    ) -> Result<()> {
        if self.unexport_in_progress() {
            return Err(MdcError::Stale);
        }

        if entry.first_export_id() == i64::from(self.id) {
            return Ok(());
        }

        stats.inode_mapping_inc();

        {
            let state = entry.attr_state.read().await;
            if state.export_ids.contains(&self.id) {
                return Ok(());
            }
        }

        // Take the write lock and re-check in case another thread raced us.
        let mut state = entry.attr_state.write().await;
        if state.export_ids.contains(&self.id) {
            return Ok(());
        }

        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Unexport may have started after the check at the top; the various
        // locks are acquired and dropped in a way that allows that window.
        if self.unexport_in_progress() {
            return Err(MdcError::Stale);
        }

        if state.export_ids.is_empty() {
            entry.set_first_export_id(i64::from(self.id));
        }

        trace!(export = self.id, key = entry.key().hk(), "mapping entry");
        state.export_ids.push(self.id);
        entries.insert(entry.key().clone(), Arc::downgrade(entry));

        Ok(())
    }
}
