//! The public handle-operation surface.
//!
//! Every operation resolves entries through the keyed table, takes the
//! appropriate per-entry lock, performs its cache-level action, delegates to
//! the sub-FSAL where needed, and updates the cache on success. Fast paths
//! run under read locks; slow paths upgrade to write locks, consult the
//! sub-FSAL, and install the result.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, instrument, trace, warn};

use crate::config::MdcConfig;
use crate::context::{Credentials, OpContext};
use crate::dir::{DirContent, Placement};
use crate::entry::{AttrState, EntryFlags, EntryRef, MdcEntry};
use crate::error::{MdcError, Result};
use crate::export::{Export, ExportOptions};
use crate::fsal::{
    AttrMask, Attributes, LockRequest, Lookup, ObjectType, OpenFlags, SetAttrs, SubFsal,
};
use crate::key::CacheKey;
use crate::lru::{ChunkLru, LruPool, Stats};
use crate::table::{InsertRace, KeyTable};

/// Access bits for [`MdCache::test_access`].
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Consistency snapshot of one directory's dirent cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirAudit {
    pub chunk_sizes: Vec<usize>,
    pub active_dirents: usize,
    pub detached_dirents: usize,
    pub first_ck: u64,
    pub invariants: std::result::Result<(), String>,
}

/// Read-or-write hold on a directory's content lock, so slow paths can
/// upgrade without duplicating the surrounding logic.
pub(crate) enum ContentGuard<'a> {
    Read(RwLockReadGuard<'a, DirContent>),
    Write(RwLockWriteGuard<'a, DirContent>),
}

impl ContentGuard<'_> {
    pub fn content(&self) -> &DirContent {
        match self {
            Self::Read(guard) => guard,
            Self::Write(guard) => guard,
        }
    }

    pub fn content_mut(&mut self) -> Option<&mut DirContent> {
        match self {
            Self::Read(_) => None,
            Self::Write(guard) => Some(&mut *guard),
        }
    }
}

/// Both directories' content locks for rename, taken in address order.
pub(crate) struct DirLocks<'a> {
    first: RwLockWriteGuard<'a, DirContent>,
    second: Option<RwLockWriteGuard<'a, DirContent>>,
    src_is_first: bool,
}

impl DirLocks<'_> {
    pub fn src_mut(&mut self) -> &mut DirContent {
        match (&mut self.second, self.src_is_first) {
            (None, _) => &mut self.first,
            (Some(_), true) => &mut self.first,
            (Some(second), false) => second,
        }
    }

    pub fn dst_mut(&mut self) -> &mut DirContent {
        match (&mut self.second, self.src_is_first) {
            (None, _) => &mut self.first,
            (Some(second), true) => second,
            (Some(_), false) => &mut self.first,
        }
    }

    pub fn dst(&self) -> &DirContent {
        match (&self.second, self.src_is_first) {
            (None, _) => &self.first,
            (Some(second), true) => second,
            (Some(_), false) => &self.first,
        }
    }
}

/// The metadata cache.
///
/// Interposes between a protocol front-end and a sub-FSAL, caching object
/// handles, attributes and directory listings.
pub struct MdCache<S: SubFsal> {
    pub(crate) sub: S,
    pub(crate) config: MdcConfig,
    pub(crate) table: KeyTable<S>,
    pub(crate) pool: LruPool<S>,
    pub(crate) chunk_lru: ChunkLru<S>,
    exports: Mutex<HashMap<u16, Arc<Export<S>>>>,
}

impl<S: SubFsal> MdCache<S> {
    pub fn new(sub: S, config: MdcConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|_| MdcError::Invalid("configuration failed validation"))?;
        let chunks_hwmark = config.chunks_hwmark;
        Ok(Self {
            sub,
            config,
            table: KeyTable::new(),
            pool: LruPool::new(),
            chunk_lru: ChunkLru::new(chunks_hwmark),
            exports: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &MdcConfig {
        &self.config
    }

    pub fn stats(&self) -> Stats {
        self.pool.stats().snapshot()
    }

    pub fn entry_count(&self) -> usize {
        self.table.len()
    }

    pub fn resident_chunks(&self) -> usize {
        self.chunk_lru.len()
    }

    // ── Exports ─────────────────────────────────────────────────────────

    pub fn add_export(&self, id: u16, options: ExportOptions) -> Result<Arc<Export<S>>> {
        let mut exports = self.lock_exports();
        if exports.contains_key(&id) {
            return Err(MdcError::Exists);
        }
        let export = Arc::new(Export::new(
            id,
            options
                .expire_time_attr
                .unwrap_or(Duration::from_secs(self.config.expire_time_attr)),
            options
                .trust_readdir_negative_cache
                .unwrap_or(self.config.trust_readdir_negative_cache),
        ));
        exports.insert(id, Arc::clone(&export));
        Ok(export)
    }

    /// Unexport barrier: mark the export dying, then unmap every entry
    /// reached through it. Entries left with no export become unreachable.
    pub async fn remove_export(&self, export: &Arc<Export<S>>) {
        export.set_unexport();
        debug!(export = export.id(), "unexport started");

        for (_, weak) in export.drain_entries() {
            let Some(entry) = weak.upgrade() else {
                continue;
            };
            let unmapped = {
                let mut state = entry.attr_state.write().await;
                state.export_ids.retain(|id| *id != export.id());
                if entry.first_export_id() == i64::from(export.id()) {
                    let next = state.export_ids.first().map(|id| i64::from(*id)).unwrap_or(-1);
                    entry.set_first_export_id(next);
                }
                state.export_ids.is_empty()
            };
            if unmapped {
                self.kill_entry(&entry).await;
            }
        }

        self.lock_exports().remove(&export.id());
        debug!(export = export.id(), "unexport complete");
    }

    fn lock_exports(&self) -> std::sync::MutexGuard<'_, HashMap<u16, Arc<Export<S>>>> {
        self.exports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Entry lifecycle ─────────────────────────────────────────────────

    /// Resolve an entry by key. Returns an initially-referenced entry; the
    /// shard latch is dropped before the export mapping check.
    pub(crate) async fn find_keyed(
        &self,
        ctx: &OpContext<S>,
        key: &CacheKey,
    ) -> Result<EntryRef<S>> {
        if key.is_empty() {
            return Err(MdcError::Invalid("null key"));
        }
        let Some(entry) = self.table.find(key).await else {
            return Err(MdcError::NotFound);
        };
        // An entry caught mid-kill cannot be referenced; treat it as a miss
        // so the caller re-resolves.
        let Ok(entry_ref) = entry.try_initial_ref() else {
            return Err(MdcError::NotFound);
        };
        ctx.export.check_mapping(&entry, self.pool.stats()).await?;
        self.pool.touch(&entry);
        self.pool.stats().inode_hit_inc();
        Ok(entry_ref)
    }

    /// Create or resolve a cache entry for a sub-FSAL handle.
    ///
    /// Returns an initially-referenced entry; the caller owns releasing the
    /// reference (by dropping it). If a concurrent thread publishes the same
    /// key first, the freshly built entry is discarded and the winner is
    /// used, after giving the sub-FSAL a chance to merge the duplicate.
    pub(crate) async fn new_entry(
        &self,
        ctx: &OpContext<S>,
        sub_handle: S::Handle,
        attrs_in: Attributes,
        new_directory: bool,
        state: Option<S::State>,
    ) -> Result<EntryRef<S>> {
        let key_bytes = self.sub.handle_to_key(&sub_handle);
        if key_bytes.is_empty() {
            return Err(MdcError::Invalid("sub-FSAL produced an empty key"));
        }
        let key = CacheKey::new(self.sub.fsal_id(), key_bytes);

        // Fast path: the object is already cached. The duplicate handle is
        // merged, then dropped.
        match self.find_keyed(ctx, &key).await {
            Ok(found) => {
                trace!(key = key.hk(), "entry already cached");
                self.sub.merge(&found.sub_handle, &sub_handle).await?;
                return Ok(found);
            }
            Err(MdcError::NotFound) => {}
            Err(other) => return Err(other),
        }

        let obj_type = self.sub.handle_type(&sub_handle);
        let ttl = ctx.export.expire_time_attr();
        let entry = MdcEntry::new(key, obj_type, sub_handle, new_directory, ttl, state);

        // Map the export before publishing; an unexport in progress fails
        // the whole operation with stale.
        if let Err(err) = ctx.export.check_mapping(&entry, self.pool.stats()).await {
            debug!(export = ctx.export.id(), "entry creation raced unexport");
            return Err(err);
        }

        {
            let mut attr_state = entry.attr_state.write().await;
            if attrs_in.expire_time_attr != 0 {
                attr_state.ttl = Duration::from_secs(attrs_in.expire_time_attr);
            }
            attr_state.attrs = attrs_in;
            attr_state.fetched_at = Some(Instant::now());
        }
        entry.set_flags(EntryFlags::TRUST_ATTRS);

        match self.table.insert_or_race(Arc::clone(&entry)).await {
            InsertRace::Won => {
                self.pool.insert(&entry);
                self.pool.stats().inode_added_inc();
                trace!(key = entry.key().hk(), ?obj_type, "new entry added");
                let entry_ref = entry.try_initial_ref()?;
                self.maybe_evict_entries().await;
                Ok(entry_ref)
            }
            InsertRace::Lost(winner) => {
                debug!(key = entry.key().hk(), "lost race to add entry");
                self.pool.stats().inode_conf_inc();
                self.discard_unpublished(&entry).await;
                let winner_ref = winner.try_initial_ref()?;
                ctx.export.check_mapping(&winner, self.pool.stats()).await?;
                self.sub.merge(&winner.sub_handle, &entry.sub_handle).await?;
                Ok(winner_ref)
            }
        }
    }

    /// Unwind the export mapping of an entry that never made it into the
    /// table.
    async fn discard_unpublished(&self, entry: &Arc<MdcEntry<S>>) {
        let export_ids = {
            let mut state = entry.attr_state.write().await;
            entry.set_first_export_id(-1);
            std::mem::take(&mut state.export_ids)
        };
        let exports = self.lock_exports();
        for id in export_ids {
            if let Some(export) = exports.get(&id) {
                export.forget_entry_exact(entry);
            }
        }
    }

    /// Make an entry unfindable. Outstanding references keep it alive until
    /// they drain; future lookups re-resolve through the sub-FSAL.
    pub(crate) async fn kill_entry(&self, entry: &Arc<MdcEntry<S>>) {
        debug!(key = entry.key().hk(), "killing entry");
        entry.set_flags(EntryFlags::UNREACHABLE);
        let freed = self.table.remove_checked(entry).await;
        self.pool.remove(entry.key());
        self.discard_unpublished(entry).await;
        if !freed {
            trace!(key = entry.key().hk(), "entry was already unpublished");
        }
    }

    /// Detach an entry from every shared structure prior to eviction.
    async fn clean_entry(&self, entry: &Arc<MdcEntry<S>>) {
        self.discard_unpublished(entry).await;
        if let Some(payload) = entry.dir_payload() {
            let mut content = payload.content.write().await;
            let stamps = content.invalidate_all();
            self.chunk_lru.remove_all(&stamps);
            content.parent_wire = None;
        }
    }

    /// Evict cold, unreferenced entries when the table passes its high
    /// watermark. Readers are never blocked: an entry with an outstanding
    /// reference is skipped.
    async fn maybe_evict_entries(&self) {
        let mut rounds = 0;
        while self.table.len() > self.config.entries_hwmark && rounds < 4 {
            rounds += 1;
            let victims = self.pool.pop_candidates(8);
            if victims.is_empty() {
                return;
            }
            for victim in victims {
                victim.set_flags(EntryFlags::UNREACHABLE);
                if victim.refcnt() > 0 {
                    // Raced with a fresh reference; put it back.
                    victim.clear_flags(EntryFlags::UNREACHABLE);
                    self.pool.insert(&victim);
                    continue;
                }
                trace!(key = victim.key().hk(), "evicting entry");
                self.clean_entry(&victim).await;
                self.table.remove_checked(&victim).await;
            }
        }
    }

    /// Mark an entry as a junction; rename and unlink refuse to cross it.
    pub fn mark_junction(&self, entry: &EntryRef<S>) {
        entry.set_flags(EntryFlags::JUNCTION);
    }

    // ── Root and host-handle resolution ─────────────────────────────────

    /// Resolve the filesystem root.
    pub async fn root(&self, ctx: &OpContext<S>) -> Result<EntryRef<S>> {
        let looked = self.sub.root().await?;
        self.new_entry(ctx, looked.handle, looked.attrs, false, None)
            .await
    }

    /// Find or create an entry from a wire handle.
    #[instrument(name = "MdCache::create_handle", skip_all)]
    pub async fn create_handle(&self, ctx: &OpContext<S>, wire: &[u8]) -> Result<EntryRef<S>> {
        let key_bytes = self.sub.host_to_key(wire)?;
        let key = CacheKey::new(self.sub.fsal_id(), key_bytes);

        match self.find_keyed(ctx, &key).await {
            Ok(entry) => return Ok(entry),
            Err(MdcError::NotFound) => {}
            Err(other) => return Err(other),
        }

        let looked = self.sub.create_handle(wire).await.map_err(|err| {
            debug!(%err, "create_handle failed in sub-FSAL");
            err
        })?;
        self.new_entry(ctx, looked.handle, looked.attrs, false, None)
            .await
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    /// Look up a name under a directory. Cached resolution under the
    /// content read lock; a miss upgrades to the write lock and consults
    /// the sub-FSAL. A final stale miss surfaces as `NotFound`.
    #[instrument(name = "MdCache::lookup", skip(self, ctx, parent))]
    pub async fn lookup(
        &self,
        ctx: &OpContext<S>,
        parent: &EntryRef<S>,
        name: &str,
    ) -> Result<EntryRef<S>> {
        match self.lookup_impl(ctx, parent, name, true).await {
            Ok(entry) => Ok(entry),
            Err(err @ MdcError::Stale) => {
                // The parent itself no longer resolves; make it unfindable
                // so the protocol layer re-resolves through its wire handle.
                self.kill_entry(parent.arc()).await;
                Err(err.stale_as_noent())
            }
            Err(other) => Err(other),
        }
    }

    /// Cache-only lookup; never consults the sub-FSAL.
    pub async fn lookup_cached(
        &self,
        ctx: &OpContext<S>,
        parent: &EntryRef<S>,
        name: &str,
    ) -> Result<EntryRef<S>> {
        self.lookup_impl(ctx, parent, name, false).await
    }

    async fn lookup_impl(
        &self,
        ctx: &OpContext<S>,
        parent: &EntryRef<S>,
        name: &str,
        uncached: bool,
    ) -> Result<EntryRef<S>> {
        let payload = parent.dir()?;

        if name == ".." {
            return self.lookup_dotdot(ctx, parent).await;
        }

        if parent.flags_test(EntryFlags::BYPASS_DIRCACHE) {
            // Not caching dirents; go straight to the sub-FSAL. Nothing is
            // added to the dirent cache so no write lock is needed.
            let looked = self.sub.lookup(&parent.sub_handle, name).await?;
            return self
                .new_entry(ctx, looked.handle, looked.attrs, false, None)
                .await;
        }

        let mut guard = ContentGuard::Read(payload.content.read().await);

        let mut result = self
            .try_get_cached(ctx, parent, guard.content(), name)
            .await;

        if matches!(result, Err(MdcError::Stale)) {
            // Upgrade and retry in case a racing thread filled the cache.
            drop(guard);
            guard = ContentGuard::Write(payload.content.write().await);
            result = self
                .try_get_cached(ctx, parent, guard.content(), name)
                .await;
        }

        match result {
            Ok(entry) => Ok(entry),
            Err(MdcError::NotFound) => Err(MdcError::NotFound),
            Err(MdcError::Stale) if uncached => {
                let content = guard
                    .content_mut()
                    .ok_or(MdcError::ServerFault("stale miss without write lock"))?;
                if !parent.flags_test(EntryFlags::TRUST_CONTENT) {
                    // Content is still invalid under the write lock; empty
                    // it and mark it valid so this lookup's result can be
                    // cached.
                    let stamps = content.invalidate_all();
                    self.chunk_lru.remove_all(&stamps);
                    parent.clear_flags(EntryFlags::DIR_POPULATED);
                    parent.set_flags(EntryFlags::TRUST_CONTENT | EntryFlags::TRUST_DIR_CHUNKS);
                }
                debug!(name, "cache miss, consulting sub-FSAL");
                self.lookup_uncached(ctx, parent, content, name).await
            }
            Err(other) => Err(other),
        }
    }

    /// `..` resolves through the stored parent wire handle and is never
    /// cached as a dirent.
    async fn lookup_dotdot(&self, ctx: &OpContext<S>, dir: &EntryRef<S>) -> Result<EntryRef<S>> {
        let payload = dir.dir()?;
        let wire = {
            let content = payload.content.read().await;
            content.parent_wire.clone()
        };

        if let Some(wire) = wire {
            return self.create_handle(ctx, &wire).await;
        }

        // No parent handle cached: ask the sub-FSAL and remember the wire
        // form for next time.
        let looked = self
            .sub
            .lookup(&dir.sub_handle, "..")
            .await
            .map_err(|_| MdcError::Stale)?;
        let wire = self.sub.handle_to_wire(&looked.handle)?;
        {
            let mut content = payload.content.write().await;
            content.parent_wire = Some(wire);
        }
        self.new_entry(ctx, looked.handle, looked.attrs, false, None)
            .await
    }

    /// Resolve a name from the dirent cache.
    ///
    /// Caller holds the content lock (either mode). `Stale` means the cache
    /// cannot answer; `NotFound` is only returned when the negative cache is
    /// trusted.
    pub(crate) async fn try_get_cached(
        &self,
        ctx: &OpContext<S>,
        parent: &EntryRef<S>,
        content: &DirContent,
        name: &str,
    ) -> Result<EntryRef<S>> {
        if parent.flags_test(EntryFlags::BYPASS_DIRCACHE) {
            return Err(MdcError::Stale);
        }
        if !parent.flags_test(EntryFlags::TRUST_CONTENT) {
            return Err(MdcError::Stale);
        }

        match content.name_lookup(name) {
            Some(id) => {
                let dirent = content.dirent(id)?;
                match dirent.chunk {
                    Some(chunk) => self.chunk_lru.bump(content.chunk(chunk)?.lru_stamp),
                    None => content.bump_detached(id),
                }
                let ckey = dirent.ckey.clone();
                match self.find_keyed(ctx, &ckey).await {
                    Ok(entry) => Ok(entry),
                    Err(err) => {
                        trace!(name, %err, "dirent key no longer resolves");
                        Err(MdcError::Stale)
                    }
                }
            }
            None => {
                if self.trust_negative_cache(ctx, parent) {
                    Err(MdcError::NotFound)
                } else {
                    Err(MdcError::Stale)
                }
            }
        }
    }

    /// A fully-populated, trusted directory with no create in flight can
    /// answer negative lookups itself.
    fn trust_negative_cache(&self, ctx: &OpContext<S>, parent: &EntryRef<S>) -> bool {
        ctx.export.trust_negative_cache()
            && parent
                .dir_payload()
                .map(|p| p.icreate_refcnt.load(Ordering::Acquire) == 0)
                .unwrap_or(false)
            && parent.flags_test(EntryFlags::DIR_POPULATED)
    }

    /// Sub-FSAL lookup plus cache install. Caller holds the parent's
    /// content lock for write.
    pub(crate) async fn lookup_uncached(
        &self,
        ctx: &OpContext<S>,
        parent: &EntryRef<S>,
        content: &mut DirContent,
        name: &str,
    ) -> Result<EntryRef<S>> {
        let looked = self.sub.lookup(&parent.sub_handle, name).await?;

        // Filling the cache from a lookup does not invalidate the parent's
        // attributes; an externally added file shows up as an attribute
        // change instead.
        let entry = self
            .new_entry(ctx, looked.handle, looked.attrs, false, None)
            .await?;
        self.dirent_add(ctx, parent, content, name, &entry).await?;
        if entry.object_type().is_dir() {
            self.dir_add_parent(entry.arc(), parent).await;
        }
        Ok(entry)
    }

    // ── Dirent maintenance ──────────────────────────────────────────────

    /// Add a name → child binding to a cached directory.
    ///
    /// Caller holds the content lock for write. Returns true when, under
    /// chunking, the binding was recorded (the dirent cache stays usable
    /// and the caller should refresh parent attributes without
    /// invalidating).
    pub(crate) async fn dirent_add(
        &self,
        _ctx: &OpContext<S>,
        parent: &EntryRef<S>,
        content: &mut DirContent,
        name: &str,
        child: &EntryRef<S>,
    ) -> Result<bool> {
        parent.dir()?;

        if parent.flags_test(EntryFlags::BYPASS_DIRCACHE) {
            return Ok(false);
        }

        if content.active_count() >= self.config.dir.avl_max {
            // Too many dirents: stop caching this directory entirely.
            warn!(
                key = parent.key().hk(),
                "directory over avl-max, enabling bypass"
            );
            let stamps = content.invalidate_all();
            self.chunk_lru.remove_all(&stamps);
            parent.set_flags(EntryFlags::BYPASS_DIRCACHE);
            parent.clear_flags(EntryFlags::DIR_POPULATED);
            return Ok(false);
        }

        use crate::dir::InsertOutcome;
        let id = match content.insert_dirent(name, child.key().clone()) {
            InsertOutcome::Existing(id) | InsertOutcome::Updated(id) => {
                // A parallel populator (or a stale binding, now refreshed)
                // beat us; treat as success.
                trace!(name, "dirent already present");
                let _ = id;
                return Ok(self.config.chunking());
            }
            InsertOutcome::Inserted(id) => id,
        };

        if !self.config.chunking() {
            content.assign_legacy_cookie(id)?;
            content.add_detached(id, self.config.dir.avl_max);
            return Ok(false);
        }

        self.place_new_dirent(parent, content, id, name).await?;
        Ok(true)
    }

    /// Decide whether a freshly discovered dirent belongs to an
    /// already-cached chunk; otherwise record it as detached.
    async fn place_new_dirent(
        &self,
        parent: &EntryRef<S>,
        content: &mut DirContent,
        id: crate::dir::DirentId,
        name: &str,
    ) -> Result<()> {
        let ck = self
            .sub
            .compute_readdir_cookie(&parent.sub_handle, name)
            .await;

        if ck == 0 {
            // No computable cookie: existing chunks can no longer be
            // trusted to be gap-free around this name.
            trace!(name, "no computable cookie, detaching dirent");
            parent.clear_flags(EntryFlags::DIR_POPULATED | EntryFlags::TRUST_DIR_CHUNKS);
            content.add_detached(id, self.config.dir.avl_detached_max);
            return Ok(());
        }

        let mut placement = content.place_new_dirent(id, ck, self.config.dir.avl_chunk_split)?;

        if placement == Placement::NeedFirstFix {
            // The current first dirent also sits at the first-cookie slot;
            // recompute its real cookie to make room.
            placement = match content.sorted_occupant_name(crate::dir::FIRST_DIRENT_COOKIE) {
                Some((occupant, occupant_name)) => {
                    let new_ck = self
                        .sub
                        .compute_readdir_cookie(&parent.sub_handle, &occupant_name)
                        .await;
                    if new_ck == 0 {
                        warn!(name = &*occupant_name, "could not recompute first cookie");
                        Placement::Detached { invalidate: true }
                    } else {
                        content.reassign_cookie(occupant, new_ck)?;
                        content.place_new_dirent(id, ck, self.config.dir.avl_chunk_split)?
                    }
                }
                None => Placement::Detached { invalidate: true },
            };
        }

        match placement {
            Placement::Chunked { chunk, split } => {
                self.chunk_lru.bump(content.chunk(chunk)?.lru_stamp);
                if let Some(split) = split {
                    let stamp = self.chunk_lru.register(parent.arc(), split);
                    content.chunk_mut(split)?.lru_stamp = stamp;
                }
            }
            Placement::Detached { invalidate } => {
                if invalidate {
                    parent.clear_flags(EntryFlags::DIR_POPULATED | EntryFlags::TRUST_DIR_CHUNKS);
                }
                content.add_detached(id, self.config.dir.avl_detached_max);
            }
            Placement::NeedFirstFix => {
                return Err(MdcError::ServerFault("first-cookie fix did not converge"));
            }
        }
        Ok(())
    }

    /// Mark a name deleted in a cached directory. Caller holds the content
    /// lock for write. Absence is not an error.
    pub(crate) fn dirent_remove(&self, parent: &EntryRef<S>, content: &mut DirContent, name: &str) {
        if parent.flags_test(EntryFlags::BYPASS_DIRCACHE) {
            return;
        }
        if let Some(id) = content.name_lookup(name) {
            content.set_deleted(id);
        }
    }

    /// Store the parent's wire handle on a child directory.
    pub(crate) async fn dir_add_parent(&self, child: &Arc<MdcEntry<S>>, parent: &EntryRef<S>) {
        let Some(payload) = child.dir_payload() else {
            return;
        };
        let wire = match self.sub.handle_to_wire(&parent.sub_handle) {
            Ok(wire) => wire,
            Err(err) => {
                debug!(%err, "could not derive parent wire handle");
                return;
            }
        };
        let mut content = payload.content.write().await;
        content.parent_wire = Some(wire);
    }

    // ── Create family ───────────────────────────────────────────────────

    #[instrument(name = "MdCache::create", skip(self, ctx, parent, attrs))]
    pub async fn create(
        &self,
        ctx: &OpContext<S>,
        parent: &EntryRef<S>,
        name: &str,
        attrs: &SetAttrs,
    ) -> Result<EntryRef<S>> {
        let payload = parent.dir()?;
        payload.icreate_refcnt.fetch_add(1, Ordering::AcqRel);
        let result = self.sub.create(&parent.sub_handle, name, attrs).await;
        let out = match result {
            Ok(looked) => {
                self.finish_create(ctx, parent, name, looked, false, None)
                    .await
            }
            Err(err) => Err(self.fail_parent_call(parent, "create", err).await),
        };
        payload.icreate_refcnt.fetch_sub(1, Ordering::AcqRel);
        out
    }

    #[instrument(name = "MdCache::mkdir", skip(self, ctx, parent, attrs))]
    pub async fn mkdir(
        &self,
        ctx: &OpContext<S>,
        parent: &EntryRef<S>,
        name: &str,
        attrs: &SetAttrs,
    ) -> Result<EntryRef<S>> {
        let payload = parent.dir()?;
        payload.icreate_refcnt.fetch_add(1, Ordering::AcqRel);
        let result = self.sub.mkdir(&parent.sub_handle, name, attrs).await;
        let out = match result {
            Ok(looked) => {
                self.finish_create(ctx, parent, name, looked, true, None)
                    .await
            }
            Err(err) => Err(self.fail_parent_call(parent, "mkdir", err).await),
        };
        payload.icreate_refcnt.fetch_sub(1, Ordering::AcqRel);
        out
    }

    #[instrument(name = "MdCache::mknode", skip(self, ctx, parent, attrs))]
    pub async fn mknode(
        &self,
        ctx: &OpContext<S>,
        parent: &EntryRef<S>,
        name: &str,
        node_type: ObjectType,
        attrs: &SetAttrs,
    ) -> Result<EntryRef<S>> {
        let payload = parent.dir()?;
        payload.icreate_refcnt.fetch_add(1, Ordering::AcqRel);
        let result = self
            .sub
            .mknode(&parent.sub_handle, name, node_type, attrs)
            .await;
        let out = match result {
            Ok(looked) => {
                self.finish_create(ctx, parent, name, looked, false, None)
                    .await
            }
            Err(err) => Err(self.fail_parent_call(parent, "mknode", err).await),
        };
        payload.icreate_refcnt.fetch_sub(1, Ordering::AcqRel);
        out
    }

    #[instrument(name = "MdCache::symlink", skip(self, ctx, parent, attrs, link_path))]
    pub async fn symlink(
        &self,
        ctx: &OpContext<S>,
        parent: &EntryRef<S>,
        name: &str,
        link_path: &str,
        attrs: &SetAttrs,
    ) -> Result<EntryRef<S>> {
        let payload = parent.dir()?;
        payload.icreate_refcnt.fetch_add(1, Ordering::AcqRel);
        let result = self
            .sub
            .symlink(&parent.sub_handle, name, link_path, attrs)
            .await;
        let out = match result {
            Ok(looked) => {
                self.finish_create(ctx, parent, name, looked, false, None)
                    .await
            }
            Err(err) => Err(self.fail_parent_call(parent, "symlink", err).await),
        };
        payload.icreate_refcnt.fetch_sub(1, Ordering::AcqRel);
        out
    }

    /// A stale parent reported by the sub-FSAL is killed so future lookups
    /// re-resolve.
    async fn fail_parent_call(
        &self,
        parent: &EntryRef<S>,
        op: &'static str,
        err: MdcError,
    ) -> MdcError {
        debug!(op, %err, "sub-FSAL call failed");
        if err == MdcError::Stale {
            warn!(op, "sub-FSAL returned stale for parent");
            self.kill_entry(parent.arc()).await;
        }
        err
    }

    /// Install a just-created object under its parent.
    async fn finish_create(
        &self,
        ctx: &OpContext<S>,
        parent: &EntryRef<S>,
        name: &str,
        looked: Lookup<S::Handle>,
        new_directory: bool,
        state: Option<S::State>,
    ) -> Result<EntryRef<S>> {
        let payload = parent.dir()?;

        let (entry, placed) = {
            let mut content = payload.content.write().await;

            let entry = self
                .new_entry(ctx, looked.handle, looked.attrs, new_directory, state)
                .await?;

            // The create changed the parent; its cached attributes are no
            // longer current either way.
            parent.clear_flags(EntryFlags::TRUST_ATTRS);

            let placed = self
                .dirent_add(ctx, parent, &mut content, name, &entry)
                .await?;

            if entry.object_type().is_dir() {
                self.dir_add_parent(entry.arc(), parent).await;
            }
            (entry, placed)
        };

        if placed {
            // The dirent cache absorbed the new name; refresh the parent's
            // attributes without dumping its dirents.
            self.refresh_attrs_no_invalidate(parent).await;
        }

        Ok(entry)
    }

    #[instrument(name = "MdCache::link", skip(self, ctx, obj, dir))]
    pub async fn link(
        &self,
        ctx: &OpContext<S>,
        obj: &EntryRef<S>,
        dir: &EntryRef<S>,
        name: &str,
    ) -> Result<()> {
        let payload = dir.dir()?;

        self.sub
            .link(&obj.sub_handle, &dir.sub_handle, name)
            .await
            .map_err(|err| {
                debug!(%err, "link failed in sub-FSAL");
                err
            })?;

        obj.clear_flags(EntryFlags::TRUST_ATTRS);
        dir.clear_flags(EntryFlags::TRUST_ATTRS);

        let placed = {
            let mut content = payload.content.write().await;
            self.dirent_add(ctx, dir, &mut content, name, obj).await?
        };
        if placed {
            self.refresh_attrs_no_invalidate(dir).await;
        }
        Ok(())
    }

    #[instrument(name = "MdCache::readlink", skip(self, _ctx, entry))]
    pub async fn readlink(&self, _ctx: &OpContext<S>, entry: &EntryRef<S>) -> Result<String> {
        if entry.object_type() != ObjectType::Symlink {
            return Err(MdcError::Invalid("readlink on non-symlink"));
        }
        self.sub.readlink(&entry.sub_handle).await
    }

    // ── Unlink & rename ─────────────────────────────────────────────────

    #[instrument(name = "MdCache::unlink", skip(self, _ctx, parent, entry))]
    pub async fn unlink(
        &self,
        _ctx: &OpContext<S>,
        parent: &EntryRef<S>,
        entry: &EntryRef<S>,
        name: &str,
    ) -> Result<()> {
        let payload = parent.dir()?;

        if entry.flags_test(EntryFlags::JUNCTION) {
            return Err(MdcError::CrossDevice);
        }

        let status = self
            .sub
            .unlink(&parent.sub_handle, &entry.sub_handle, name)
            .await;

        match status {
            Err(MdcError::Stale) => {
                warn!("sub-FSAL returned stale on unlink");
                self.kill_entry(parent.arc()).await;
                Err(MdcError::Stale)
            }
            Err(MdcError::NotEmpty) if entry.object_type().is_dir() => {
                // Our view of the target directory was wrong; drop it.
                if let Some(target) = entry.dir_payload() {
                    let mut content = target.content.write().await;
                    let stamps = content.invalidate_all();
                    self.chunk_lru.remove_all(&stamps);
                    entry.clear_flags(EntryFlags::DIR_POPULATED);
                    entry.set_flags(EntryFlags::TRUST_CONTENT | EntryFlags::TRUST_DIR_CHUNKS);
                }
                Err(MdcError::NotEmpty)
            }
            Err(other) => Err(other),
            Ok(()) => {
                {
                    let mut content = payload.content.write().await;
                    self.dirent_remove(parent, &mut content, name);
                }

                parent.clear_flags(EntryFlags::TRUST_ATTRS);
                entry.clear_flags(EntryFlags::TRUST_ATTRS);

                if let Some(target) = entry.dir_payload() {
                    let mut content = target.content.write().await;
                    content.parent_wire = None;
                }

                self.kill_entry(entry.arc()).await;
                Ok(())
            }
        }
    }

    /// Acquire both directories' content locks in address order. If the
    /// second lock cannot be taken immediately, both are released and the
    /// acquisition retried after a brief pause, preventing deadlock with
    /// opposing acquisition orders elsewhere.
    pub(crate) async fn src_dest_lock<'a>(
        &self,
        src: &'a EntryRef<S>,
        dest: &'a EntryRef<S>,
    ) -> Result<DirLocks<'a>> {
        let src_payload = src.dir()?;
        let dest_payload = dest.dir()?;

        if std::ptr::eq(Arc::as_ptr(src.arc()), Arc::as_ptr(dest.arc())) {
            return Ok(DirLocks {
                first: src_payload.content.write().await,
                second: None,
                src_is_first: true,
            });
        }

        let src_is_first =
            (Arc::as_ptr(src.arc()) as usize) < (Arc::as_ptr(dest.arc()) as usize);
        let (first_payload, second_payload) = if src_is_first {
            (src_payload, dest_payload)
        } else {
            (dest_payload, src_payload)
        };

        loop {
            let first = first_payload.content.write().await;
            match second_payload.content.try_write() {
                Ok(second) => {
                    return Ok(DirLocks {
                        first,
                        second: Some(second),
                        src_is_first,
                    });
                }
                Err(_) => {
                    drop(first);
                    debug!("second directory lock busy, backing off");
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }
    }

    #[instrument(name = "MdCache::rename", skip(self, ctx, obj, old_dir, new_dir))]
    pub async fn rename(
        &self,
        ctx: &OpContext<S>,
        obj: &EntryRef<S>,
        old_dir: &EntryRef<S>,
        old_name: &str,
        new_dir: &EntryRef<S>,
        new_name: &str,
    ) -> Result<()> {
        let same_dir = std::ptr::eq(Arc::as_ptr(old_dir.arc()), Arc::as_ptr(new_dir.arc()));
        let changes_key = self
            .sub
            .features()
            .contains(crate::fsal::FsalFeatures::RENAME_CHANGES_KEY);

        let mut refresh_new_dir = false;

        {
            let mut locks = self.src_dest_lock(old_dir, new_dir).await?;

            let dst_existing = match self
                .try_get_cached(ctx, new_dir, locks.dst(), new_name)
                .await
            {
                Ok(existing) => Some(existing),
                Err(_) => None,
            };

            if let Some(existing) = &dst_existing {
                if std::ptr::eq(Arc::as_ptr(existing.arc()), Arc::as_ptr(obj.arc())) {
                    // Renaming an object over itself is a no-op.
                    return Ok(());
                }
                if existing.flags_test(EntryFlags::JUNCTION) {
                    return Err(MdcError::CrossDevice);
                }
            }

            self.sub
                .rename(
                    &obj.sub_handle,
                    &old_dir.sub_handle,
                    old_name,
                    &new_dir.sub_handle,
                    new_name,
                )
                .await?;

            if let Some(existing) = &dst_existing {
                existing.clear_flags(EntryFlags::TRUST_ATTRS);
            }
            obj.clear_flags(EntryFlags::TRUST_ATTRS);
            old_dir.clear_flags(EntryFlags::TRUST_ATTRS);
            if !same_dir {
                new_dir.clear_flags(EntryFlags::TRUST_ATTRS);
            }

            if let Some(existing) = &dst_existing {
                // The overwritten destination is gone.
                self.dirent_remove(new_dir, locks.dst_mut(), new_name);
                self.kill_entry(existing.arc()).await;
            }

            if changes_key {
                debug!(old_name, new_name, "rename changes keys");
                // The cached handle for the object is now useless.
                self.dirent_remove(old_dir, locks.src_mut(), old_name);
                {
                    let stamps = locks.dst_mut().invalidate_all();
                    self.chunk_lru.remove_all(&stamps);
                    new_dir.clear_flags(EntryFlags::DIR_POPULATED);
                    new_dir.set_flags(EntryFlags::TRUST_CONTENT | EntryFlags::TRUST_DIR_CHUNKS);
                }
                if !same_dir {
                    let stamps = locks.src_mut().invalidate_all();
                    self.chunk_lru.remove_all(&stamps);
                    old_dir.clear_flags(EntryFlags::DIR_POPULATED);
                    old_dir.set_flags(EntryFlags::TRUST_CONTENT | EntryFlags::TRUST_DIR_CHUNKS);
                }
                self.kill_entry(obj.arc()).await;
            } else if same_dir && !self.config.chunking() {
                // In-place rename within one directory's by-name index.
                self.dirent_rename_legacy(ctx, new_dir, locks.dst_mut(), old_name, new_name)
                    .await?;
            } else {
                self.dirent_remove(old_dir, locks.src_mut(), old_name);

                if !new_dir.flags_test(EntryFlags::BYPASS_DIRCACHE) {
                    // A stale binding for the new name may still be cached.
                    self.dirent_remove(new_dir, locks.dst_mut(), new_name);
                    match self
                        .dirent_add(ctx, new_dir, locks.dst_mut(), new_name, obj)
                        .await
                    {
                        Ok(placed) => refresh_new_dir = placed,
                        Err(err) => {
                            debug!(%err, "dirent add after rename failed");
                            let stamps = locks.dst_mut().invalidate_all();
                            self.chunk_lru.remove_all(&stamps);
                            new_dir.clear_flags(EntryFlags::DIR_POPULATED);
                            new_dir.set_flags(
                                EntryFlags::TRUST_CONTENT | EntryFlags::TRUST_DIR_CHUNKS,
                            );
                        }
                    }
                }
            }
        }

        if refresh_new_dir {
            self.refresh_attrs_no_invalidate(new_dir).await;
        }

        // A directory that moved has a new parent.
        if !same_dir && obj.object_type().is_dir() && !changes_key {
            self.dir_add_parent(obj.arc(), new_dir).await;
        }

        Ok(())
    }

    /// Legacy (unchunked) in-place rename: the by-name index drops the old
    /// name and gains the new one, pointing at the same child key.
    async fn dirent_rename_legacy(
        &self,
        ctx: &OpContext<S>,
        dir: &EntryRef<S>,
        content: &mut DirContent,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        if dir.flags_test(EntryFlags::BYPASS_DIRCACHE) {
            return Ok(());
        }

        let Some(old_id) = content.name_lookup(old_name) else {
            if dir.flags_test(EntryFlags::TRUST_CONTENT | EntryFlags::DIR_POPULATED) {
                // We are out of date; drop the cached directory.
                let stamps = content.invalidate_all();
                self.chunk_lru.remove_all(&stamps);
                dir.clear_flags(EntryFlags::DIR_POPULATED);
                dir.set_flags(EntryFlags::TRUST_CONTENT | EntryFlags::TRUST_DIR_CHUNKS);
            }
            return Ok(());
        };
        let ckey = content.dirent(old_id)?.ckey.clone();

        if let Some(existing) = content.name_lookup(new_name) {
            // Overwrite: repoint the destination dirent at the renamed
            // object and expire the overwritten entry.
            let old_ckey = content.dirent(existing)?.ckey.clone();
            content.dirent_mut(existing)?.ckey = ckey;
            content.set_deleted(old_id);
            if let Ok(overwritten) = self.find_keyed(ctx, &old_ckey).await {
                overwritten.clear_flags(
                    EntryFlags::TRUST_ATTRS
                        | EntryFlags::TRUST_CONTENT
                        | EntryFlags::DIR_POPULATED,
                );
            }
            return Ok(());
        }

        content.set_deleted(old_id);
        use crate::dir::InsertOutcome;
        if let InsertOutcome::Inserted(new_id) = content.insert_dirent(new_name, ckey) {
            content.assign_legacy_cookie(new_id)?;
            content.add_detached(new_id, self.config.dir.avl_max);
        }
        Ok(())
    }

    // ── Attributes ──────────────────────────────────────────────────────

    /// Get attributes, serving from cache when trusted and fresh.
    #[instrument(name = "MdCache::getattrs", skip(self, ctx, entry, mask))]
    pub async fn getattrs(
        &self,
        ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        mask: AttrMask,
    ) -> Result<Attributes> {
        {
            let state = entry.attr_state.read().await;
            if entry.is_attrs_valid(&state, mask) {
                return Ok(state.attrs.clone());
            }
        }

        // Promote to the write lock; someone may beat us to the refresh.
        let mut state = entry.attr_state.write().await;
        if entry.is_attrs_valid(&state, mask) {
            return Ok(state.attrs.clone());
        }

        let need_acl = mask.contains(AttrMask::ACL);
        match self
            .refresh_attrs_locked(ctx, entry, &mut state, need_acl, true)
            .await
        {
            Ok(()) => Ok(state.attrs.clone()),
            Err(err) => {
                drop(state);
                if err == MdcError::Stale {
                    self.kill_entry(entry.arc()).await;
                }
                Err(err)
            }
        }
    }

    /// Re-fetch attributes from the sub-FSAL.
    ///
    /// When `invalidate_dirents` is set and the directory's mtime moved
    /// forward, the cached dirents are dumped.
    pub async fn refresh_attrs(
        &self,
        ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        need_acl: bool,
        invalidate_dirents: bool,
    ) -> Result<()> {
        let mut state = entry.attr_state.write().await;
        let result = self
            .refresh_attrs_locked(ctx, entry, &mut state, need_acl, invalidate_dirents)
            .await;
        drop(state);
        if result == Err(MdcError::Stale) {
            self.kill_entry(entry.arc()).await;
        }
        result
    }

    async fn refresh_attrs_locked(
        &self,
        ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        state: &mut AttrState,
        need_acl: bool,
        invalidate_dirents: bool,
    ) -> Result<()> {
        let old_mtime = if state.attrs.valid.contains(AttrMask::MTIME) {
            Some(state.attrs.mtime)
        } else {
            None
        };

        let mut attrs = self.sub.getattrs(&entry.sub_handle).await?;

        if !need_acl {
            // The ACL was not requested; retain the one we already hold.
            if let Some(acl) = state.attrs.acl.take() {
                attrs.acl = Some(acl);
                attrs.valid |= AttrMask::ACL;
            }
        }

        if attrs.expire_time_attr != 0 {
            state.ttl = Duration::from_secs(attrs.expire_time_attr);
        } else if state.fetched_at.is_none() {
            state.ttl = ctx.export.expire_time_attr();
        }

        state.attrs = attrs;
        state.fetched_at = Some(Instant::now());
        entry.set_flags(EntryFlags::TRUST_ATTRS);

        if invalidate_dirents && entry.object_type().is_dir() {
            let grew = match old_mtime {
                Some(old) => state.attrs.mtime > old,
                None => false,
            };
            if grew {
                debug!("directory mtime advanced, dumping dirents");
                if let Some(payload) = entry.dir_payload() {
                    let mut content = payload.content.write().await;
                    let stamps = content.invalidate_all();
                    self.chunk_lru.remove_all(&stamps);
                    entry.clear_flags(EntryFlags::DIR_POPULATED);
                    entry.set_flags(EntryFlags::TRUST_CONTENT | EntryFlags::TRUST_DIR_CHUNKS);
                }
            }
        }

        Ok(())
    }

    /// Refresh a directory's attributes after its dirent cache absorbed a
    /// change, without invalidating the dirents the refresh would otherwise
    /// dump. Failures only log; the attributes simply stay untrusted.
    pub(crate) async fn refresh_attrs_no_invalidate(&self, entry: &EntryRef<S>) {
        let mut state = entry.attr_state.write().await;
        let refreshed = async {
            let mut attrs = self.sub.getattrs(&entry.sub_handle).await?;
            if let Some(acl) = state.attrs.acl.take() {
                attrs.acl = Some(acl);
                attrs.valid |= AttrMask::ACL;
            }
            if attrs.expire_time_attr != 0 {
                state.ttl = Duration::from_secs(attrs.expire_time_attr);
            }
            state.attrs = attrs;
            state.fetched_at = Some(Instant::now());
            entry.set_flags(EntryFlags::TRUST_ATTRS);
            Ok::<(), MdcError>(())
        }
        .await;
        if let Err(err) = refreshed {
            debug!(%err, "post-mutation attribute refresh failed");
        }
    }

    #[instrument(name = "MdCache::setattrs", skip(self, ctx, entry, attrs))]
    pub async fn setattrs(
        &self,
        ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        attrs: &SetAttrs,
    ) -> Result<()> {
        self.setattrs_inner(ctx, entry, None, attrs).await
    }

    /// Setattr against an open-file state.
    pub async fn setattrs_with_state(
        &self,
        ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        state: &S::State,
        attrs: &SetAttrs,
    ) -> Result<()> {
        self.setattrs_inner(ctx, entry, Some(state), attrs).await
    }

    async fn setattrs_inner(
        &self,
        ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        open_state: Option<&S::State>,
        attrs: &SetAttrs,
    ) -> Result<()> {
        let mut state = entry.attr_state.write().await;
        let old_change = state.attrs.change;

        let result = async {
            self.sub
                .setattrs(&entry.sub_handle, open_state, attrs)
                .await?;
            self.refresh_attrs_locked(ctx, entry, &mut state, attrs.touches_acl(), false)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                if state.attrs.change == old_change {
                    // The backend did not move the change counter; make the
                    // mutation observable anyway.
                    debug!("setattrs did not bump the change attribute");
                    state.attrs.change = old_change + 1;
                }
                Ok(())
            }
            Err(err) => {
                drop(state);
                if err == MdcError::Stale {
                    self.kill_entry(entry.arc()).await;
                }
                Err(err)
            }
        }
    }

    /// Access check against cached attributes. The owner fast path avoids
    /// an attribute fetch on hot read/write paths; the mode bits are
    /// evaluated either way.
    pub async fn test_access(
        &self,
        ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        want: Access,
    ) -> Result<()> {
        {
            let state = entry.attr_state.read().await;
            if entry.flags_test(EntryFlags::TRUST_ATTRS)
                && state
                    .attrs
                    .valid
                    .contains(AttrMask::OWNER | AttrMask::MODE)
                && state.attrs.owner == ctx.creds.uid
            {
                return Self::evaluate_mode(&state.attrs, ctx.creds, want);
            }
        }

        let attrs = self
            .getattrs(ctx, entry, AttrMask::OWNER | AttrMask::GROUP | AttrMask::MODE)
            .await?;
        Self::evaluate_mode(&attrs, ctx.creds, want)
    }

    /// POSIX mode-bit evaluation shared by both `test_access` paths.
    fn evaluate_mode(attrs: &Attributes, creds: Credentials, want: Access) -> Result<()> {
        if creds.uid == 0 {
            return Ok(());
        }

        let shift = if attrs.owner == creds.uid {
            6
        } else if attrs.group == creds.gid {
            3
        } else {
            0
        };
        let granted = (attrs.mode >> shift) & 0o7;

        let mut needed = 0u32;
        if want.contains(Access::READ) {
            needed |= 0o4;
        }
        if want.contains(Access::WRITE) {
            needed |= 0o2;
        }
        if want.contains(Access::EXECUTE) {
            needed |= 0o1;
        }

        if granted & needed == needed {
            Ok(())
        } else {
            Err(MdcError::AccessDenied)
        }
    }

    // ── File I/O pass-throughs ──────────────────────────────────────────

    pub async fn open(
        &self,
        _ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        flags: OpenFlags,
    ) -> Result<()> {
        let state = self.sub.open(&entry.sub_handle, flags).await?;
        *entry
            .open_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(state);
        if flags.contains(OpenFlags::TRUNCATE) {
            entry.clear_flags(EntryFlags::TRUST_ATTRS);
        }
        Ok(())
    }

    pub async fn close(&self, _ctx: &OpContext<S>, entry: &EntryRef<S>) -> Result<()> {
        let state = entry
            .open_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match state {
            Some(state) => self.sub.close(&entry.sub_handle, state).await,
            None => Ok(()),
        }
    }

    pub async fn read(
        &self,
        _ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        offset: u64,
        len: usize,
    ) -> Result<Bytes> {
        self.sub.read(&entry.sub_handle, offset, len).await
    }

    pub async fn write(
        &self,
        _ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let written = self.sub.write(&entry.sub_handle, offset, data).await?;
        entry.clear_flags(EntryFlags::TRUST_ATTRS);
        Ok(written)
    }

    pub async fn commit(
        &self,
        _ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        self.sub.commit(&entry.sub_handle, offset, len).await?;
        entry.clear_flags(EntryFlags::TRUST_ATTRS);
        Ok(())
    }

    pub async fn lock_op(
        &self,
        _ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        request: &LockRequest,
    ) -> Result<()> {
        self.sub.lock_op(&entry.sub_handle, request).await
    }

    // ── Extended attributes (pass-through) ──────────────────────────────

    pub async fn getxattr(
        &self,
        _ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        name: &str,
    ) -> Result<Bytes> {
        self.sub.getxattr(&entry.sub_handle, name).await
    }

    pub async fn setxattr(
        &self,
        _ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        name: &str,
        value: &[u8],
    ) -> Result<()> {
        self.sub.setxattr(&entry.sub_handle, name, value).await?;
        entry.clear_flags(EntryFlags::TRUST_ATTRS);
        Ok(())
    }

    pub async fn removexattr(
        &self,
        _ctx: &OpContext<S>,
        entry: &EntryRef<S>,
        name: &str,
    ) -> Result<()> {
        self.sub.removexattr(&entry.sub_handle, name).await?;
        entry.clear_flags(EntryFlags::TRUST_ATTRS);
        Ok(())
    }

    pub async fn listxattrs(
        &self,
        _ctx: &OpContext<S>,
        entry: &EntryRef<S>,
    ) -> Result<Vec<String>> {
        self.sub.listxattrs(&entry.sub_handle).await
    }

    // ── Handle utilities ────────────────────────────────────────────────

    pub fn handle_to_wire(&self, entry: &EntryRef<S>) -> Result<Bytes> {
        self.sub.handle_to_wire(&entry.sub_handle)
    }

    pub fn handle_to_key(&self, entry: &EntryRef<S>) -> Bytes {
        entry.key().bytes().clone()
    }

    pub fn handle_cmp(&self, a: &EntryRef<S>, b: &EntryRef<S>) -> bool {
        a.key() == b.key()
    }

    /// Merge state between two entries discovered to be the same object.
    pub async fn merge(&self, orig: &EntryRef<S>, duplicate: &EntryRef<S>) -> Result<()> {
        self.sub
            .merge(&orig.sub_handle, &duplicate.sub_handle)
            .await
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    /// Snapshot a directory's dirent-cache shape and verify its internal
    /// invariants.
    pub async fn audit_directory(&self, dir: &EntryRef<S>) -> Result<DirAudit> {
        let payload = dir.dir()?;
        let content = payload.content.read().await;
        Ok(DirAudit {
            chunk_sizes: content.chunk_sizes(),
            active_dirents: content.active_count(),
            detached_dirents: content.detached_count(),
            first_ck: content.first_ck,
            invariants: content.check_invariants().map_err(|e| e.to_string()),
        })
    }
}
