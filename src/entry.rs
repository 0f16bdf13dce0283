//! Cache entries.
//!
//! One [`MdcEntry`] represents one cached filesystem object. Entries are
//! shared as `Arc`s; the explicit reference count tracks how many in-flight
//! operations hold the entry so eviction never frees an entry an operation
//! is using. The storage itself is released by the final `Arc` drop, which
//! by construction happens at reference count zero.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tokio::sync::RwLock;

use crate::dir::DirPayload;
use crate::error::{MdcError, Result};
use crate::fsal::{AttrMask, Attributes, ObjectType, SubFsal};
use crate::key::CacheKey;

bitflags! {
    /// Atomic per-entry flag bits.
    ///
    /// The bits themselves are atomic; transitions that must stay consistent
    /// with directory content are serialized by the content lock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// Cached attributes are authoritative (within their TTL).
        const TRUST_ATTRS      = 1 << 0;
        /// The dirent set is authoritative for lookups.
        const TRUST_CONTENT    = 1 << 1;
        /// Resident chunks reflect the sub-FSAL stream order.
        const TRUST_DIR_CHUNKS = 1 << 2;
        /// The whole directory has been read to end-of-directory.
        const DIR_POPULATED    = 1 << 3;
        /// Directory is too large to cache; operations go straight to the
        /// sub-FSAL.
        const BYPASS_DIRCACHE  = 1 << 4;
        /// Entry has been killed; it can no longer be found by key and no
        /// new references may be taken.
        const UNREACHABLE      = 1 << 5;
        /// The protocol layer treats this object as a mount-point boundary;
        /// rename and unlink refuse to cross it.
        const JUNCTION         = 1 << 6;
    }
}

/// Everything guarded by the attribute lock: the attribute struct itself,
/// its freshness metadata, and the export mapping list.
#[derive(Debug)]
pub struct AttrState {
    pub attrs: Attributes,
    /// When the attributes were last fetched from the sub-FSAL; `None`
    /// until the first refresh lands.
    pub fetched_at: Option<Instant>,
    /// TTL applied to `fetched_at`.
    pub ttl: Duration,
    /// Exports this entry is mapped through.
    pub export_ids: Vec<u16>,
}

/// A cached filesystem object.
pub struct MdcEntry<S: SubFsal> {
    key: CacheKey,
    obj_type: ObjectType,
    pub(crate) sub_handle: S::Handle,
    flags: AtomicU32,
    refcnt: AtomicU32,
    first_export_id: AtomicI64,
    pub(crate) attr_state: RwLock<AttrState>,
    /// Directory payload; present exactly when `obj_type` is a directory.
    dir: Option<DirPayload>,
    /// Opaque open-file state forwarded to the sub-FSAL.
    pub(crate) open_state: std::sync::Mutex<Option<S::State>>,
}

impl<S: SubFsal> std::fmt::Debug for MdcEntry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdcEntry")
            .field("key", &self.key.hk())
            .field("type", &self.obj_type)
            .field("flags", &self.flags())
            .field("refcnt", &self.refcnt.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<S: SubFsal> MdcEntry<S> {
    /// Build an unpublished entry. Directory entries start with trusted
    /// (empty) content; a newly created directory is additionally marked
    /// populated because its emptiness is known.
    pub(crate) fn new(
        key: CacheKey,
        obj_type: ObjectType,
        sub_handle: S::Handle,
        new_directory: bool,
        attr_ttl: Duration,
        state: Option<S::State>,
    ) -> Arc<Self> {
        let mut flags = EntryFlags::empty();
        let dir = if obj_type.is_dir() {
            flags |= EntryFlags::TRUST_CONTENT;
            if new_directory {
                flags |= EntryFlags::DIR_POPULATED;
            }
            Some(DirPayload::new())
        } else {
            None
        };

        Arc::new(Self {
            key,
            obj_type,
            sub_handle,
            flags: AtomicU32::new(flags.bits()),
            refcnt: AtomicU32::new(0),
            first_export_id: AtomicI64::new(-1),
            attr_state: RwLock::new(AttrState {
                attrs: Attributes::empty(),
                fetched_at: None,
                ttl: attr_ttl,
                export_ids: Vec::new(),
            }),
            dir,
            open_state: std::sync::Mutex::new(state),
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn object_type(&self) -> ObjectType {
        self.obj_type
    }

    pub(crate) fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// True when all bits in `mask` are set.
    pub(crate) fn flags_test(&self, mask: EntryFlags) -> bool {
        self.flags().contains(mask)
    }

    pub(crate) fn set_flags(&self, mask: EntryFlags) {
        self.flags.fetch_or(mask.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, mask: EntryFlags) {
        self.flags.fetch_and(!mask.bits(), Ordering::AcqRel);
    }

    pub(crate) fn first_export_id(&self) -> i64 {
        self.first_export_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_first_export_id(&self, id: i64) {
        self.first_export_id.store(id, Ordering::Release);
    }

    /// Directory payload or `NotDirectory`.
    pub(crate) fn dir(&self) -> Result<&DirPayload> {
        self.dir.as_ref().ok_or(MdcError::NotDirectory)
    }

    pub(crate) fn dir_payload(&self) -> Option<&DirPayload> {
        self.dir.as_ref()
    }

    pub(crate) fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Take an initial reference for handing the entry to a caller.
    /// Rejected once the entry has become unreachable.
    pub(crate) fn try_initial_ref(self: &Arc<Self>) -> Result<EntryRef<S>> {
        if self.flags_test(EntryFlags::UNREACHABLE) {
            return Err(MdcError::Stale);
        }
        self.refcnt.fetch_add(1, Ordering::AcqRel);
        // Close the window against a concurrent kill.
        if self.flags_test(EntryFlags::UNREACHABLE) {
            self.refcnt.fetch_sub(1, Ordering::AcqRel);
            return Err(MdcError::Stale);
        }
        Ok(EntryRef {
            entry: Arc::clone(self),
        })
    }

    /// Attribute validity: trusted, covering the requested mask, and inside
    /// the TTL.
    pub(crate) fn is_attrs_valid(&self, state: &AttrState, mask: AttrMask) -> bool {
        if !self.flags_test(EntryFlags::TRUST_ATTRS) {
            return false;
        }
        if !state.attrs.valid.contains(mask) {
            return false;
        }
        match state.fetched_at {
            Some(at) => at.elapsed() < state.ttl,
            None => false,
        }
    }
}

/// A counted reference to a cache entry.
///
/// Dropping the guard releases the reference; cloning takes another one.
pub struct EntryRef<S: SubFsal> {
    entry: Arc<MdcEntry<S>>,
}

impl<S: SubFsal> EntryRef<S> {
    pub(crate) fn arc(&self) -> &Arc<MdcEntry<S>> {
        &self.entry
    }
}

impl<S: SubFsal> Clone for EntryRef<S> {
    fn clone(&self) -> Self {
        self.entry.refcnt.fetch_add(1, Ordering::AcqRel);
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<S: SubFsal> Drop for EntryRef<S> {
    fn drop(&mut self) {
        self.entry.refcnt.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<S: SubFsal> std::ops::Deref for EntryRef<S> {
    type Target = MdcEntry<S>;

    fn deref(&self) -> &MdcEntry<S> {
        &self.entry
    }
}

impl<S: SubFsal> std::fmt::Debug for EntryRef<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.entry, f)
    }
}
