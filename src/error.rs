//! Error kinds surfaced by the metadata cache.
//!
//! Sub-FSAL implementations return the same enum, so backend statuses flow up
//! through the cache unchanged.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MdcError>;

/// Errors observed and propagated by the metadata cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MdcError {
    /// The object no longer resolves in the sub-FSAL, the current export is
    /// being removed, or a parent has been invalidated.
    #[error("stale file handle")]
    Stale,

    /// Name not found under a fully-populated, trusted directory.
    #[error("no such file or directory")]
    NotFound,

    /// Name collision on dirent insert. Some paths treat this as success
    /// (a parallel populator already added the dirent).
    #[error("entry already exists")]
    Exists,

    /// Directory exceeded `dir.avl-max`; the caller enables bypass mode and
    /// retries without caching.
    #[error("directory entry cache overflow")]
    Overflow,

    /// Entry or dirent allocation failed in the backend.
    #[error("allocation failed")]
    NoMemory,

    /// Programming error (wrong type, null key).
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// Junction crossing; rename/unlink refuse to operate across junctions.
    #[error("operation crosses a junction")]
    CrossDevice,

    /// The caller's credentials do not grant the requested access.
    #[error("access denied")]
    AccessDenied,

    /// Directory operation on a non-directory.
    #[error("not a directory")]
    NotDirectory,

    /// rmdir of a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// Readdir called with a cookie below the first valid dirent cookie or
    /// one that cannot be located.
    #[error("bad readdir cookie {0:#x}")]
    BadCookie(u64),

    /// Incomplete readdir; retry later. Only produced when `retry-readdir`
    /// is enabled.
    #[error("incomplete readdir, retry later")]
    Delay,

    /// Impossible state reached.
    #[error("server fault: {0}")]
    ServerFault(&'static str),

    /// Transport or storage failure reported by the sub-FSAL.
    #[error("sub-FSAL I/O failure: {0}")]
    Io(String),
}

impl MdcError {
    /// Lookup paths surface a final stale miss as `NotFound`.
    pub(crate) fn stale_as_noent(self) -> Self {
        match self {
            Self::Stale => Self::NotFound,
            other => other,
        }
    }
}
