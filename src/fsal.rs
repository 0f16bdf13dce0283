//! Generic trait for the lower filesystem the cache stacks on.
//!
//! Note that this is a deliberately narrow interface: the cache only depends
//! on the operations it interposes, and everything an implementation issues
//! (handles, wire bytes, ACL blobs) stays opaque to the cache.

use std::time::SystemTime;

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;

use crate::error::Result;
use crate::key::FsalId;

/// File type of a cached object. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Socket,
    NamedPipe,
}

impl ObjectType {
    pub fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }
}

bitflags! {
    /// Which attribute fields are populated or requested.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttrMask: u32 {
        const OWNER   = 1 << 0;
        const GROUP   = 1 << 1;
        const MODE    = 1 << 2;
        const SIZE    = 1 << 3;
        const SPACE_USED = 1 << 4;
        const NLINK   = 1 << 5;
        const ATIME   = 1 << 6;
        const MTIME   = 1 << 7;
        const CTIME   = 1 << 8;
        const CHANGE  = 1 << 9;
        const RAWDEV  = 1 << 10;
        const ACL     = 1 << 11;

        /// Everything except the ACL, which is fetched lazily.
        const REGULAR = Self::OWNER.bits()
            | Self::GROUP.bits()
            | Self::MODE.bits()
            | Self::SIZE.bits()
            | Self::SPACE_USED.bits()
            | Self::NLINK.bits()
            | Self::ATIME.bits()
            | Self::MTIME.bits()
            | Self::CTIME.bits()
            | Self::CHANGE.bits()
            | Self::RAWDEV.bits();
    }
}

bitflags! {
    /// Optional behaviors a sub-FSAL may implement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FsalFeatures: u32 {
        /// `compute_readdir_cookie` returns real cookies.
        const COMPUTE_READDIR_COOKIE = 1 << 0;
        /// Readdir continuation expects the previous entry's name rather
        /// than an opaque cookie.
        const WHENCE_IS_NAME = 1 << 1;
        /// Renaming an object changes its handle key.
        const RENAME_CHANGES_KEY = 1 << 2;
    }
}

bitflags! {
    /// Open disposition for the pass-through file operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const CREATE   = 1 << 2;
        const TRUNCATE = 1 << 3;
        const APPEND   = 1 << 4;
    }
}

/// Full attribute set for an object.
///
/// The ACL stays an opaque blob; cloning an `Attributes` passes the ACL
/// reference through without interpreting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    /// Which fields below carry meaningful values.
    pub valid: AttrMask,
    pub owner: u32,
    pub group: u32,
    pub mode: u32,
    pub size: u64,
    pub space_used: u64,
    pub nlink: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Change counter; bumped by every mutation the backend observes.
    pub change: u64,
    pub rawdev: u64,
    /// Attribute TTL override in seconds; 0 means "use the export default".
    pub expire_time_attr: u64,
    pub acl: Option<Bytes>,
}

impl Attributes {
    pub fn empty() -> Self {
        Self {
            valid: AttrMask::empty(),
            owner: 0,
            group: 0,
            mode: 0,
            size: 0,
            space_used: 0,
            nlink: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            change: 0,
            rawdev: 0,
            expire_time_attr: 0,
            acl: None,
        }
    }
}

/// Attributes to apply in a setattr or at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttrs {
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub acl: Option<Bytes>,
}

impl SetAttrs {
    /// True when the change would also affect the ACL of the object.
    pub fn touches_acl(&self) -> bool {
        self.owner.is_some() || self.group.is_some() || self.mode.is_some() || self.acl.is_some()
    }
}

/// A resolved object: the sub-FSAL handle plus the attributes that came with
/// it.
#[derive(Debug)]
pub struct Lookup<H> {
    pub handle: H,
    pub attrs: Attributes,
}

/// One raw directory entry streamed out of a sub-FSAL readdir.
#[derive(Debug)]
pub struct RawDirent<H> {
    pub name: String,
    pub handle: H,
    pub attrs: Attributes,
    /// Position marker for resuming after this entry.
    pub cookie: u64,
}

/// The result of one sub-FSAL readdir call.
#[derive(Debug)]
pub struct ReaddirBatch<H> {
    pub entries: Vec<RawDirent<H>>,
    /// True when the batch ends at end-of-directory.
    pub eod: bool,
}

/// Where a readdir should continue from.
#[derive(Debug, Clone, Copy)]
pub enum Whence<'a> {
    /// Beginning of the directory.
    Start,
    /// Continue after the entry this cookie was issued for.
    Cookie(u64),
    /// Continue after the entry with this name (whence-is-name sub-FSALs).
    Name(&'a str),
}

/// Verdict returned by a readdir consumer for each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirResult {
    /// Keep delivering entries.
    Continue,
    /// Stop; the entry that produced this verdict was not consumed.
    Terminate,
}

/// A byte-range lock request passed through to the sub-FSAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub owner: u64,
    pub offset: u64,
    pub length: u64,
    pub exclusive: bool,
    pub unlock: bool,
}

/// The lower filesystem abstraction the metadata cache sits atop.
///
/// Handles are owned values; dropping a handle releases whatever backend
/// resources it pins. Errors use [`crate::MdcError`] so backend statuses
/// flow up through the cache unchanged.
#[async_trait]
pub trait SubFsal: Send + Sync + 'static {
    /// Opaque per-object handle.
    type Handle: Send + Sync + std::fmt::Debug + 'static;

    /// Opaque open-file state the protocol layer threads through. The cache
    /// stores it per entry but never interprets it.
    type State: Send + Sync + std::fmt::Debug + 'static;

    fn fsal_id(&self) -> FsalId;

    fn features(&self) -> FsalFeatures;

    fn supported_attrs(&self) -> AttrMask;

    /// File type of the object behind a handle.
    fn handle_type(&self, obj: &Self::Handle) -> ObjectType;

    /// Resolve the filesystem root.
    async fn root(&self) -> Result<Lookup<Self::Handle>>;

    async fn lookup(&self, dir: &Self::Handle, name: &str) -> Result<Lookup<Self::Handle>>;

    /// Read directory entries starting at `whence`. `limit` is a hint: the
    /// backend may return more entries (readahead) or fewer; `eod` must be
    /// set when the batch reaches end-of-directory.
    async fn readdir(
        &self,
        dir: &Self::Handle,
        whence: Whence<'_>,
        limit: usize,
    ) -> Result<ReaddirBatch<Self::Handle>>;

    async fn create(
        &self,
        dir: &Self::Handle,
        name: &str,
        attrs: &SetAttrs,
    ) -> Result<Lookup<Self::Handle>>;

    async fn mkdir(
        &self,
        dir: &Self::Handle,
        name: &str,
        attrs: &SetAttrs,
    ) -> Result<Lookup<Self::Handle>>;

    async fn mknode(
        &self,
        dir: &Self::Handle,
        name: &str,
        node_type: ObjectType,
        attrs: &SetAttrs,
    ) -> Result<Lookup<Self::Handle>>;

    async fn symlink(
        &self,
        dir: &Self::Handle,
        name: &str,
        link_path: &str,
        attrs: &SetAttrs,
    ) -> Result<Lookup<Self::Handle>>;

    async fn readlink(&self, obj: &Self::Handle) -> Result<String>;

    async fn link(&self, obj: &Self::Handle, dir: &Self::Handle, name: &str) -> Result<()>;

    async fn rename(
        &self,
        obj: &Self::Handle,
        old_dir: &Self::Handle,
        old_name: &str,
        new_dir: &Self::Handle,
        new_name: &str,
    ) -> Result<()>;

    async fn unlink(&self, dir: &Self::Handle, obj: &Self::Handle, name: &str) -> Result<()>;

    async fn getattrs(&self, obj: &Self::Handle) -> Result<Attributes>;

    async fn setattrs(
        &self,
        obj: &Self::Handle,
        state: Option<&Self::State>,
        attrs: &SetAttrs,
    ) -> Result<()>;

    async fn open(&self, obj: &Self::Handle, flags: OpenFlags) -> Result<Self::State>;

    async fn close(&self, obj: &Self::Handle, state: Self::State) -> Result<()>;

    async fn read(&self, obj: &Self::Handle, offset: u64, len: usize) -> Result<Bytes>;

    async fn write(&self, obj: &Self::Handle, offset: u64, data: &[u8]) -> Result<usize>;

    async fn commit(&self, obj: &Self::Handle, offset: u64, len: u64) -> Result<()>;

    async fn lock_op(&self, obj: &Self::Handle, request: &LockRequest) -> Result<()>;

    async fn getxattr(&self, obj: &Self::Handle, name: &str) -> Result<Bytes>;

    async fn setxattr(&self, obj: &Self::Handle, name: &str, value: &[u8]) -> Result<()>;

    async fn removexattr(&self, obj: &Self::Handle, name: &str) -> Result<()>;

    async fn listxattrs(&self, obj: &Self::Handle) -> Result<Vec<String>>;

    /// Opaque key bytes for the object; stable across handle instances.
    fn handle_to_key(&self, obj: &Self::Handle) -> Bytes;

    /// Wire form of the handle, usable with [`SubFsal::create_handle`].
    fn handle_to_wire(&self, obj: &Self::Handle) -> Result<Bytes>;

    /// Rebuild a handle from its wire form.
    async fn create_handle(&self, wire: &[u8]) -> Result<Lookup<Self::Handle>>;

    /// Convert raw host bytes into key bytes.
    fn host_to_key(&self, raw: &[u8]) -> Result<Bytes>;

    /// Compute the readdir cookie a dirent of `name` would carry. Returns 0
    /// when the backend cannot compute cookies.
    async fn compute_readdir_cookie(&self, dir: &Self::Handle, name: &str) -> u64;

    /// Merge state from a duplicate handle discovered to refer to the same
    /// object as `orig` (lost insert race, repeated lookup). The duplicate
    /// is dropped by the caller afterwards.
    async fn merge(&self, orig: &Self::Handle, duplicate: &Self::Handle) -> Result<()>;
}
