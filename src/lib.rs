//! Metadata cache layer for stacked user-space filesystem backends.
//!
//! `mdcache` interposes between a protocol front-end (lookup, create,
//! readdir, rename, ...) and a pluggable lower filesystem (the
//! [`SubFsal`] trait), caching object handles, attributes and chunked
//! directory listings so repeated operations avoid round-trips to the
//! backend.
//!
//! The cache is volatile and per-process: nothing is persisted, and each
//! server instance caches independently.

pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod export;
pub mod fsal;
pub mod key;

mod dir;
mod lru;
mod ops;
mod readdir;
mod table;

pub use config::{DirConfig, MdcConfig};
pub use context::{Credentials, OpContext};
pub use entry::{EntryFlags, EntryRef};
pub use error::{MdcError, Result};
pub use export::{Export, ExportOptions};
pub use fsal::{
    AttrMask, Attributes, DirResult, FsalFeatures, LockRequest, Lookup, ObjectType, OpenFlags,
    RawDirent, ReaddirBatch, SetAttrs, SubFsal, Whence,
};
pub use key::{CacheKey, FsalId};
pub use lru::Stats;
pub use ops::{Access, DirAudit, MdCache};
pub use readdir::{ReaddirCb, ReaddirEntry};
