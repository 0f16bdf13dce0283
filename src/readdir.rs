//! Chunked directory reading.
//!
//! The dirent cache is populated chunk by chunk from the sub-FSAL and then
//! served out of the by-cookie index. A request starting at a cookie that is
//! not resident triggers a population step; sub-FSALs whose continuation
//! token is a name instead of a cookie are re-scanned from the nearest
//! cached position until the wanted cookie appears.

use tracing::{debug, instrument, trace, warn};

use crate::context::OpContext;
use crate::dir::{ChunkId, DirContent, DirentId, FIRST_DIRENT_COOKIE};
use crate::entry::{EntryFlags, EntryRef};
use crate::error::{MdcError, Result};
use crate::fsal::{AttrMask, Attributes, DirResult, FsalFeatures, SubFsal, Whence};
use crate::ops::{ContentGuard, MdCache};

/// One cached entry delivered to a readdir consumer.
#[derive(Debug)]
pub struct ReaddirEntry<'a, S: SubFsal> {
    pub name: &'a str,
    /// Continuation point to resume after this entry.
    pub cookie: u64,
    pub attrs: &'a Attributes,
    pub entry: &'a EntryRef<S>,
}

/// Callback invoked per dirent during a readdir walk.
pub type ReaddirCb<'c, S> = dyn FnMut(&ReaddirEntry<'_, S>) -> DirResult + Send + 'c;

/// Result of one population step.
struct PopulateOutcome {
    /// The dirent the walk should continue from, if any.
    dirent: Option<DirentId>,
    /// End-of-directory was observed while populating.
    eod: bool,
}

impl<S: SubFsal> MdCache<S> {
    /// Read a directory from `whence` (0 = start), delivering entries to
    /// `cb` until it terminates or the directory ends.
    ///
    /// Returns whether end-of-directory was reached.
    #[instrument(name = "MdCache::readdir", skip(self, ctx, dir, cb))]
    pub async fn readdir(
        &self,
        ctx: &OpContext<S>,
        dir: &EntryRef<S>,
        whence: u64,
        cb: &mut ReaddirCb<'_, S>,
    ) -> Result<bool> {
        dir.dir()?;

        if dir.flags_test(EntryFlags::BYPASS_DIRCACHE) {
            return self.readdir_uncached(ctx, dir, whence, cb).await;
        }

        if self.config.chunking() {
            return self.readdir_chunked(ctx, dir, whence, cb).await;
        }

        self.readdir_legacy(ctx, dir, whence, cb).await
    }

    // ── Chunked path ────────────────────────────────────────────────────

    async fn readdir_chunked(
        &self,
        ctx: &OpContext<S>,
        dir: &EntryRef<S>,
        whence: u64,
        cb: &mut ReaddirCb<'_, S>,
    ) -> Result<bool> {
        if whence != 0 && whence < FIRST_DIRENT_COOKIE {
            return Err(MdcError::BadCookie(whence));
        }

        let payload = dir.dir()?;
        let whence_is_name = self.sub.features().contains(FsalFeatures::WHENCE_IS_NAME);

        let mut guard;
        let mut has_write;
        if !dir.flags_test(EntryFlags::TRUST_CONTENT | EntryFlags::TRUST_DIR_CHUNKS) {
            // Flush the stale dirent cache before serving anything.
            trace!("flushing invalid dirent cache");
            let mut write = payload.content.write().await;
            let stamps = write.invalidate_all();
            self.chunk_lru.remove_all(&stamps);
            dir.clear_flags(EntryFlags::DIR_POPULATED);
            dir.set_flags(EntryFlags::TRUST_CONTENT | EntryFlags::TRUST_DIR_CHUNKS);
            guard = ContentGuard::Write(write);
            has_write = true;
        } else {
            guard = ContentGuard::Read(payload.content.read().await);
            has_write = false;
        }

        let mut look_ck = whence;
        if look_ck == 0 {
            // Starting from the beginning: use the first cached cookie if
            // the head of the directory is resident.
            look_ck = guard.content().first_ck;
        }
        let mut set_first_ck = whence == 0 && look_ck == 0;

        let mut next_ck = whence;
        let mut first_pass = true;
        let mut prev_chunk: Option<ChunkId> = None;

        'again: loop {
            trace!(next_ck, look_ck, "chunked readdir pass");

            let mut start = match look_ck {
                0 => None,
                ck => guard.content().lookup_ck(ck),
            };

            if start.is_none() {
                if !has_write {
                    // Upgrade and retry in case another thread populated
                    // this cookie in the meantime.
                    drop(guard);
                    guard = ContentGuard::Write(payload.content.write().await);
                    has_write = true;
                    continue 'again;
                }

                let content = guard
                    .content_mut()
                    .ok_or(MdcError::ServerFault("populate without write lock"))?;

                if whence_is_name && first_pass && content.first_ck != 0 {
                    // The head of the directory is cached; skip resident
                    // chunks so the rescan starts at the first gap.
                    prev_chunk = content.skip_chunks(content.first_ck);
                }

                let outcome = match self
                    .populate_dir_chunk(ctx, dir, content, next_ck, prev_chunk)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(MdcError::Overflow) => {
                        // The directory outgrew the cache mid-walk; finish
                        // the request straight from the sub-FSAL, continuing
                        // after the last entry already delivered.
                        drop(guard);
                        debug!("directory overflowed, finishing readdir uncached");
                        return self.readdir_uncached(ctx, dir, next_ck, cb).await;
                    }
                    Err(err) => {
                        drop(guard);
                        debug!(%err, "populate_dir_chunk failed");
                        if err == MdcError::Stale {
                            self.kill_entry(dir.arc()).await;
                        }
                        return Err(err);
                    }
                };

                match outcome.dirent {
                    None => {
                        if !outcome.eod && self.config.retry_readdir {
                            // The sub-FSAL neither produced entries nor
                            // signalled end-of-directory.
                            return Err(MdcError::Delay);
                        }
                        if whence == 0 {
                            // Start-to-end with nothing left: even an empty
                            // directory counts as populated.
                            dir.set_flags(EntryFlags::DIR_POPULATED);
                        }
                        return Ok(true);
                    }
                    Some(found) => {
                        if whence == 0 && outcome.eod {
                            dir.set_flags(EntryFlags::DIR_POPULATED);
                        } else {
                            dir.clear_flags(EntryFlags::DIR_POPULATED);
                        }
                        if set_first_ck {
                            let ck = content.dirent(found)?.ck;
                            trace!(first_ck = ck, "recording directory first cookie");
                            content.first_ck = ck;
                            set_first_ck = false;
                        }
                        start = Some(found);
                    }
                }
            }

            let start_id =
                start.ok_or(MdcError::ServerFault("chunked walk without a dirent"))?;
            let chunk_id = guard
                .content()
                .dirent(start_id)?
                .chunk
                .ok_or(MdcError::ServerFault("walk dirent outside any chunk"))?;
            self.chunk_lru
                .bump(guard.content().chunk(chunk_id)?.lru_stamp);

            // Serve dirents from this chunk until it is exhausted or the
            // consumer stops.
            let mut pos = guard
                .content()
                .chunk(chunk_id)?
                .dirents
                .iter()
                .position(|d| *d == start_id)
                .unwrap_or(0);

            loop {
                let Some(cur) = guard
                    .content()
                    .chunk(chunk_id)?
                    .dirents
                    .get(pos)
                    .copied()
                else {
                    break;
                };

                let (name, ck, eod, deleted, ckey) = {
                    let dirent = guard.content().dirent(cur)?;
                    (
                        dirent.name.to_string(),
                        dirent.ck,
                        dirent.eod,
                        dirent.is_deleted(),
                        dirent.ckey.clone(),
                    )
                };

                if ck == whence || deleted {
                    // The caller wants entries after its cookie; deleted
                    // entries keep their position but are never served.
                    pos += 1;
                    continue;
                }

                let child = match self.find_keyed(ctx, &ckey).await {
                    Ok(child) => child,
                    Err(_) => {
                        trace!(name = %name, "dirent child fell out of cache");
                        if !has_write {
                            look_ck = ck;
                            drop(guard);
                            guard = ContentGuard::Write(payload.content.write().await);
                            has_write = true;
                            // The cache may have shifted while unlocked.
                            first_pass = true;
                            prev_chunk = None;
                            continue 'again;
                        }
                        let content = guard
                            .content_mut()
                            .ok_or(MdcError::ServerFault("uncached child without write lock"))?;
                        match self.lookup_uncached(ctx, dir, content, &name).await {
                            Ok(child) => child,
                            Err(err) => {
                                drop(guard);
                                debug!(name = %name, %err, "lookup by name failed during readdir");
                                if err == MdcError::Stale {
                                    self.kill_entry(dir.arc()).await;
                                }
                                return Err(err);
                            }
                        }
                    }
                };

                next_ck = ck;

                let attrs = self
                    .getattrs(ctx, &child, self.sub.supported_attrs() & !AttrMask::ACL)
                    .await?;

                let verdict = cb(&ReaddirEntry {
                    name: &name,
                    cookie: ck,
                    attrs: &attrs,
                    entry: &child,
                });

                if verdict == DirResult::Terminate || eod {
                    // Terminate means the consumer did not take this entry,
                    // so the natural end cannot have been reached.
                    let eod_met = verdict != DirResult::Terminate && eod;
                    if eod_met && whence == 0 {
                        dir.set_flags(EntryFlags::DIR_POPULATED);
                    }
                    debug!(name = %name, ?verdict, eod_met, "readdir walk stopping");
                    return Ok(eod_met);
                }

                pos += 1;
            }

            // Chunk exhausted; continue into the successor.
            let chunk_next_ck = guard.content().chunk(chunk_id)?.next_ck;
            look_ck = chunk_next_ck;
            prev_chunk = Some(chunk_id);
            first_pass = false;
            // Keep whatever lock we hold; the next chunk most likely needs
            // populating anyway.
        }
    }

    /// Read the next chunk(s) of a directory from the sub-FSAL.
    ///
    /// Caller holds the content lock for write. For whence-is-name
    /// sub-FSALs the scan continues from the last name of `prev_chunk`
    /// (or the beginning), repeating until the dirent carrying `whence_ck`
    /// is found or end-of-directory is reached.
    async fn populate_dir_chunk(
        &self,
        ctx: &OpContext<S>,
        dir: &EntryRef<S>,
        content: &mut DirContent,
        whence_ck: u64,
        mut prev_chunk: Option<ChunkId>,
    ) -> Result<PopulateOutcome> {
        let features = self.sub.features();
        let whence_is_name = features.contains(FsalFeatures::WHENCE_IS_NAME);
        let compute_cookie = features.contains(FsalFeatures::COMPUTE_READDIR_COOKIE);
        let avl_chunk = self.config.dir.avl_chunk;

        let mut found: Option<DirentId> = None;
        let mut round_one_first_chunk: Option<ChunkId> = None;

        loop {
            self.reclaim_chunks(dir, content);

            let first_chunk = content.new_chunk(prev_chunk);
            if round_one_first_chunk.is_none() {
                round_one_first_chunk = Some(first_chunk);
            }

            let whence_name: Option<Box<str>> = if whence_is_name {
                prev_chunk.and_then(|pc| content.last_name_of_chunk(pc))
            } else {
                None
            };
            let whence = if whence_is_name {
                match whence_name.as_deref() {
                    Some(name) => Whence::Name(name),
                    None => Whence::Start,
                }
            } else if whence_ck == 0 {
                Whence::Start
            } else {
                Whence::Cookie(whence_ck)
            };

            trace!(?whence, "calling sub-FSAL readdir");
            let batch = match self.sub.readdir(&dir.sub_handle, whence, avl_chunk).await {
                Ok(batch) => batch,
                Err(err) => {
                    let stamp = content.clean_chunk(first_chunk);
                    self.chunk_lru.remove(stamp);
                    return Err(err);
                }
            };
            let eod = batch.eod;

            let mut chunk = first_chunk;
            let mut chunks_this_call = vec![first_chunk];
            let mut stitched = false;

            for raw in batch.entries {
                if content.active_count() >= self.config.dir.avl_max
                    && content.name_lookup(&raw.name).is_none()
                {
                    // Hard dirent ceiling: stop caching this directory.
                    warn!(key = dir.key().hk(), "directory over avl-max during populate");
                    let stamps = content.invalidate_all();
                    self.chunk_lru.remove_all(&stamps);
                    dir.set_flags(EntryFlags::BYPASS_DIRCACHE);
                    dir.clear_flags(EntryFlags::DIR_POPULATED);
                    return Err(MdcError::Overflow);
                }

                if content.chunk(chunk)?.num_entries() >= avl_chunk.max(1) {
                    // Readahead: rotate to a fresh chunk.
                    trace!(name = %raw.name, "rotating to readahead chunk");
                    let next = content.new_chunk(Some(chunk));
                    chunks_this_call.push(next);
                    chunk = next;
                }

                let child = match self
                    .new_entry(ctx, raw.handle, raw.attrs, false, None)
                    .await
                {
                    Ok(child) => child,
                    Err(err) => {
                        warn!(name = %raw.name, %err, "entry creation failed during populate");
                        let stamp = content.clean_chunk(chunk);
                        self.chunk_lru.remove(stamp);
                        self.register_chunks(dir, content, &chunks_this_call);
                        return Err(err);
                    }
                };

                use crate::dir::InsertOutcome;
                let id = match content.insert_dirent(&raw.name, child.key().clone()) {
                    InsertOutcome::Inserted(id)
                    | InsertOutcome::Existing(id)
                    | InsertOutcome::Updated(id) => id,
                };

                if whence_is_name && whence_ck != 0 && content.dirent(id)?.ck == whence_ck {
                    found = Some(id);
                }

                match content.dirent(id)?.chunk {
                    Some(other) if other != chunk => {
                        // Collided with an already-cached chunk: stitch our
                        // chunk to it and stop consuming this stream.
                        trace!(name = %raw.name, "collided with resident chunk, stitching");
                        content.chunk_mut(chunk)?.next_ck = raw.cookie;
                        stitched = true;
                        if whence_is_name && whence_ck != 0 && raw.cookie == whence_ck {
                            found = Some(id);
                        } else if whence_ck == 0 && found.is_none() {
                            // Reading from the start straight into a resident
                            // chunk: this dirent is the continuation point.
                            found = Some(id);
                        }
                        break;
                    }
                    Some(_) => {
                        // Repeated name within this populate; nothing to do.
                    }
                    None => {
                        content.append_to_chunk(chunk, id, raw.cookie)?;
                        if content.chunk(chunk)?.num_entries() == 1 {
                            // First dirent of a fresh chunk links the
                            // predecessor chunk across the boundary.
                            if let Some(pc) = content.chunk(chunk)?.prev_chunk {
                                if content.has_chunk(pc) {
                                    content.chunk_mut(pc)?.next_ck = raw.cookie;
                                }
                            }
                        }
                        if compute_cookie {
                            content.mark_sorted(id)?;
                        }
                        if whence_is_name && whence_ck != 0 && raw.cookie == whence_ck {
                            found = Some(id);
                        }
                    }
                }

                if child.object_type().is_dir() {
                    self.dir_add_parent(child.arc(), dir).await;
                }
            }

            // Tidy the tail chunk of this call.
            let mut last_chunk = chunk;
            if content.chunk(last_chunk)?.num_entries() == 0 {
                let previous = content.chunk(last_chunk)?.prev_chunk;
                content.clean_chunk(last_chunk);
                chunks_this_call.retain(|c| *c != last_chunk);

                match previous.filter(|p| content.has_chunk(*p)) {
                    Some(p) => last_chunk = p,
                    None => {
                        // Nothing came back at all on this readdir.
                        trace!("empty populate round");
                        self.register_chunks(dir, content, &chunks_this_call);
                        return Ok(PopulateOutcome { dirent: found, eod });
                    }
                }
            } else if eod {
                // Mark the last dirent as the end of the directory.
                if let Some(last) = content.chunk(last_chunk)?.dirents.back().copied() {
                    content.dirent_mut(last)?.eod = true;
                }
            }

            self.register_chunks(dir, content, &chunks_this_call);

            if whence_is_name && whence_ck != 0 && found.is_none() && !eod {
                // Still scanning for the caller's cookie. Skip chunks that
                // were already resident, then read more.
                let next_link = content.chunk(last_chunk)?.next_ck;
                let continue_from = if stitched && next_link != 0 {
                    content.skip_chunks(next_link).unwrap_or(last_chunk)
                } else {
                    last_chunk
                };
                prev_chunk = Some(continue_from);
                continue;
            }

            if found.is_none() {
                // Default continuation point: the first dirent produced by
                // this populate.
                found = round_one_first_chunk.and_then(|c| {
                    if content.has_chunk(c) {
                        content.first_dirent_of(c)
                    } else {
                        None
                    }
                });
            }

            return Ok(PopulateOutcome { dirent: found, eod });
        }
    }

    /// Register freshly filled chunks with the chunk LRU.
    fn register_chunks(&self, dir: &EntryRef<S>, content: &mut DirContent, chunks: &[ChunkId]) {
        for chunk_id in chunks {
            let Ok(chunk) = content.chunk_mut(*chunk_id) else {
                continue;
            };
            if chunk.num_entries() == 0 || chunk.lru_stamp != 0 {
                continue;
            }
            let stamp = self.chunk_lru.register(dir.arc(), *chunk_id);
            chunk.lru_stamp = stamp;
        }
    }

    /// Trim the global chunk population back under its watermark by
    /// reclaiming the coldest chunks. Chunks of the directory currently
    /// being populated are left alone; other directories are only touched
    /// when their content lock can be taken without waiting.
    fn reclaim_chunks(&self, dir: &EntryRef<S>, _content: &mut DirContent) {
        let mut attempts = 0;
        while self.chunk_lru.over_hwmark() && attempts < 8 {
            attempts += 1;
            let Some((stamp, owner, chunk_id)) = self.chunk_lru.pop_victim() else {
                return;
            };
            let Some(owner) = owner.upgrade() else {
                continue;
            };
            if std::ptr::eq(std::sync::Arc::as_ptr(&owner), std::sync::Arc::as_ptr(dir.arc())) {
                // Skip the directory we are working on.
                self.chunk_lru.put_back(stamp, std::sync::Arc::downgrade(&owner), chunk_id);
                continue;
            }
            let Some(payload) = owner.dir_payload() else {
                continue;
            };
            match payload.content.try_write() {
                Ok(mut other) => {
                    trace!(victim = owner.key().hk(), "reclaiming cold chunk");
                    other.clean_chunk(chunk_id);
                    owner.clear_flags(EntryFlags::DIR_POPULATED);
                }
                Err(_) => {
                    self.chunk_lru.put_back(stamp, std::sync::Arc::downgrade(&owner), chunk_id);
                }
            };
        }
    }

    // ── Uncached (bypass) path ──────────────────────────────────────────

    /// Stream a directory straight from the sub-FSAL. Child objects are
    /// still cached; dirents are not.
    async fn readdir_uncached(
        &self,
        ctx: &OpContext<S>,
        dir: &EntryRef<S>,
        whence: u64,
        cb: &mut ReaddirCb<'_, S>,
    ) -> Result<bool> {
        let mut cursor = whence;
        loop {
            let whence_arg = if cursor == 0 {
                Whence::Start
            } else {
                Whence::Cookie(cursor)
            };
            let batch = self
                .sub
                .readdir(&dir.sub_handle, whence_arg, self.config.dir.avl_chunk.max(64))
                .await?;

            let empty = batch.entries.is_empty();
            for raw in batch.entries {
                let cookie = raw.cookie;
                let attrs = raw.attrs.clone();
                let child = self
                    .new_entry(ctx, raw.handle, raw.attrs, false, None)
                    .await?;
                let verdict = cb(&ReaddirEntry {
                    name: &raw.name,
                    cookie,
                    attrs: &attrs,
                    entry: &child,
                });
                if verdict == DirResult::Terminate {
                    return Ok(false);
                }
                cursor = cookie;
            }

            if batch.eod {
                return Ok(true);
            }
            if empty {
                // No progress and no end-of-directory.
                if self.config.retry_readdir {
                    return Err(MdcError::Delay);
                }
                return Ok(true);
            }
        }
    }

    // ── Legacy (unchunked) path ─────────────────────────────────────────

    /// Whole-directory caching with a single by-name index; cookies are
    /// perturbed name hashes.
    async fn readdir_legacy(
        &self,
        ctx: &OpContext<S>,
        dir: &EntryRef<S>,
        whence: u64,
        cb: &mut ReaddirCb<'_, S>,
    ) -> Result<bool> {
        let payload = dir.dir()?;

        if !dir.flags_test(EntryFlags::TRUST_CONTENT | EntryFlags::DIR_POPULATED) {
            let mut content = payload.content.write().await;
            match self.populate_legacy(ctx, dir, &mut content).await {
                Ok(()) => {}
                Err(MdcError::Overflow) => {
                    // Too large to cache; flip to bypass and stream.
                    drop(content);
                    debug!("directory overflow, switching to bypass");
                    return self.readdir_uncached(ctx, dir, whence, cb).await;
                }
                Err(err) => {
                    drop(content);
                    if err == MdcError::Stale {
                        warn!("sub-FSAL returned stale from readdir");
                        self.kill_entry(dir.arc()).await;
                    }
                    return Err(err);
                }
            }
        }

        let content = payload.content.read().await;

        let mut position = if whence == 0 {
            content.first_by_ck()
        } else {
            if whence < FIRST_DIRENT_COOKIE {
                return Err(MdcError::BadCookie(whence));
            }
            if content.lookup_ck(whence).is_none() {
                return Err(MdcError::BadCookie(whence));
            }
            content.next_ck_after(whence)
        };

        while let Some((ck, id)) = position {
            let dirent = content.dirent(id)?;
            if dirent.is_deleted() {
                position = content.next_ck_after(ck);
                continue;
            }
            let name = dirent.name.to_string();
            let ckey = dirent.ckey.clone();

            let child = match self.find_keyed(ctx, &ckey).await {
                Ok(child) => child,
                Err(_) => {
                    // The child fell out of the cache; re-resolve by name
                    // without touching the dirent set we are iterating.
                    let looked = self.sub.lookup(&dir.sub_handle, &name).await?;
                    self.new_entry(ctx, looked.handle, looked.attrs, false, None)
                        .await?
                }
            };

            let attrs = self
                .getattrs(ctx, &child, self.sub.supported_attrs() & !AttrMask::ACL)
                .await?;

            let verdict = cb(&ReaddirEntry {
                name: &name,
                cookie: ck,
                attrs: &attrs,
                entry: &child,
            });
            if verdict == DirResult::Terminate {
                return Ok(false);
            }

            position = content.next_ck_after(ck);
        }

        Ok(true)
    }

    /// Fill the whole directory into the by-name index.
    async fn populate_legacy(
        &self,
        ctx: &OpContext<S>,
        dir: &EntryRef<S>,
        content: &mut DirContent,
    ) -> Result<()> {
        let stamps = content.invalidate_all();
        self.chunk_lru.remove_all(&stamps);
        dir.clear_flags(EntryFlags::DIR_POPULATED);
        dir.set_flags(EntryFlags::TRUST_CONTENT);

        let mut cursor = 0u64;
        loop {
            let whence = if cursor == 0 {
                Whence::Start
            } else {
                Whence::Cookie(cursor)
            };
            let batch = self.sub.readdir(&dir.sub_handle, whence, 256).await?;

            let empty = batch.entries.is_empty();
            for raw in batch.entries {
                if content.active_count() >= self.config.dir.avl_max {
                    let stamps = content.invalidate_all();
                    self.chunk_lru.remove_all(&stamps);
                    dir.set_flags(EntryFlags::BYPASS_DIRCACHE);
                    return Err(MdcError::Overflow);
                }

                let child = self
                    .new_entry(ctx, raw.handle, raw.attrs, false, None)
                    .await?;

                use crate::dir::InsertOutcome;
                if let InsertOutcome::Inserted(id) =
                    content.insert_dirent(&raw.name, child.key().clone())
                {
                    content.assign_legacy_cookie(id)?;
                    content.add_detached(id, self.config.dir.avl_max);
                }

                if child.object_type().is_dir() {
                    self.dir_add_parent(child.arc(), dir).await;
                }
                cursor = raw.cookie;
            }

            if batch.eod {
                dir.set_flags(EntryFlags::DIR_POPULATED);
                return Ok(());
            }
            if empty {
                if self.config.retry_readdir {
                    return Err(MdcError::Delay);
                }
                dir.set_flags(EntryFlags::DIR_POPULATED);
                return Ok(());
            }
        }
    }
}
