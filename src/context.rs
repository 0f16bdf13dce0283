//! Per-operation context.
//!
//! Every cache operation receives an explicit `OpContext` naming the export
//! the request arrived through and the caller identity. There is no hidden
//! thread-local operation state.

use std::sync::Arc;

use crate::export::Export;
use crate::fsal::SubFsal;

/// Identity of the caller issuing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const ROOT: Self = Self { uid: 0, gid: 0 };
}

/// Context threaded through every cache operation.
pub struct OpContext<S: SubFsal> {
    pub export: Arc<Export<S>>,
    pub creds: Credentials,
}

impl<S: SubFsal> OpContext<S> {
    pub fn new(export: Arc<Export<S>>, creds: Credentials) -> Self {
        Self { export, creds }
    }
}

impl<S: SubFsal> Clone for OpContext<S> {
    fn clone(&self) -> Self {
        Self {
            export: Arc::clone(&self.export),
            creds: self.creds,
        }
    }
}

impl<S: SubFsal> std::fmt::Debug for OpContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpContext")
            .field("export", &self.export.id())
            .field("creds", &self.creds)
            .finish()
    }
}
