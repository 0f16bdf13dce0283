//! In-memory sub-FSAL used by the integration suites.
//!
//! `MemFs` keeps a tree of nodes behind a mutex, counts every backend call,
//! and lets tests flip feature flags, pin dirent cookies, and inject stale
//! or bad-cookie failures.
#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use mdcache::{
    AttrMask, Attributes, Credentials, FsalFeatures, FsalId, LockRequest, Lookup, MdCache,
    MdcConfig, MdcError, ObjectType, OpContext, OpenFlags, RawDirent, ReaddirBatch, Result,
    SetAttrs, SubFsal, Whence,
};

pub const ROOT_ID: u64 = 1;

#[derive(Debug)]
pub struct MemNode {
    pub kind: ObjectType,
    pub parent: u64,
    pub owner: u32,
    pub group: u32,
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub change: u64,
    pub mtime_secs: u64,
    /// Generation counter folded into the object key; bumped by rename when
    /// the rename-changes-key feature is on.
    pub key_gen: u64,
    /// Directory entries by cookie (stream order).
    pub children: BTreeMap<u64, (String, u64)>,
    /// Name → cookie, for cookie computation and whence-is-name.
    pub cookies: HashMap<String, u64>,
    pub link_target: Option<String>,
    pub xattrs: HashMap<String, Vec<u8>>,
    pub next_cookie: u64,
}

impl MemNode {
    fn new(kind: ObjectType) -> Self {
        Self {
            kind,
            parent: ROOT_ID,
            owner: 0,
            group: 0,
            mode: if kind.is_dir() { 0o755 } else { 0o644 },
            size: 0,
            nlink: 1,
            change: 1,
            mtime_secs: 1,
            key_gen: 0,
            children: BTreeMap::new(),
            cookies: HashMap::new(),
            link_target: None,
            xattrs: HashMap::new(),
            next_cookie: 8,
        }
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub lookup: AtomicU64,
    pub readdir: AtomicU64,
    pub getattrs: AtomicU64,
    pub setattrs: AtomicU64,
    pub create: AtomicU64,
    pub rename: AtomicU64,
    pub unlink: AtomicU64,
    pub compute_cookie: AtomicU64,
    pub create_handle: AtomicU64,
    pub merge: AtomicU64,
}

#[derive(Debug)]
pub struct MemState {
    pub nodes: Mutex<HashMap<u64, MemNode>>,
    /// Kinds survive node removal so held handles stay well-typed.
    pub kinds: Mutex<HashMap<u64, ObjectType>>,
    pub next_id: AtomicU64,
    /// Node ids that report stale on every access.
    pub stale: Mutex<HashSet<u64>>,
    /// When set, readdir with an opaque cookie fails with bad-cookie
    /// (models a backend whose cookies are only valid while cached).
    pub reject_cookies: Mutex<bool>,
    pub features: Mutex<FsalFeatures>,
    pub counters: Counters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemHandle {
    pub id: u64,
}

#[derive(Clone)]
pub struct MemFs {
    state: Arc<MemState>,
}

impl MemFs {
    pub fn new(features: FsalFeatures) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID, MemNode::new(ObjectType::Directory));
        let mut kinds = HashMap::new();
        kinds.insert(ROOT_ID, ObjectType::Directory);
        Self {
            state: Arc::new(MemState {
                nodes: Mutex::new(nodes),
                kinds: Mutex::new(kinds),
                next_id: AtomicU64::new(ROOT_ID + 1),
                stale: Mutex::new(HashSet::new()),
                reject_cookies: Mutex::new(false),
                features: Mutex::new(features),
                counters: Counters::default(),
            }),
        }
    }

    pub fn state(&self) -> Arc<MemState> {
        Arc::clone(&self.state)
    }
}

impl MemState {
    fn lock_nodes(&self) -> MutexGuard<'_, HashMap<u64, MemNode>> {
        self.nodes.lock().unwrap()
    }

    pub fn set_features(&self, features: FsalFeatures) {
        *self.features.lock().unwrap() = features;
    }

    pub fn set_reject_cookies(&self, reject: bool) {
        *self.reject_cookies.lock().unwrap() = reject;
    }

    pub fn mark_stale(&self, id: u64) {
        self.stale.lock().unwrap().insert(id);
    }

    pub fn clear_stale(&self, id: u64) {
        self.stale.lock().unwrap().remove(&id);
    }

    fn is_stale(&self, id: u64) -> bool {
        self.stale.lock().unwrap().contains(&id)
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a child with an automatically assigned stream cookie.
    pub fn add_node(&self, parent: u64, name: &str, kind: ObjectType) -> u64 {
        let cookie = {
            let mut nodes = self.lock_nodes();
            let dir = nodes.get_mut(&parent).expect("parent exists");
            let cookie = dir.next_cookie;
            dir.next_cookie += 8;
            cookie
        };
        self.add_node_with_cookie(parent, name, kind, cookie)
    }

    /// Create a child at an explicit cookie position (for "insert between"
    /// scenarios).
    pub fn add_node_with_cookie(
        &self,
        parent: u64,
        name: &str,
        kind: ObjectType,
        cookie: u64,
    ) -> u64 {
        let id = self.alloc_id();
        {
            let mut nodes = self.lock_nodes();
            let mut node = MemNode::new(kind);
            node.parent = parent;
            nodes.insert(id, node);
            let dir = nodes.get_mut(&parent).expect("parent exists");
            dir.children.insert(cookie, (name.to_string(), id));
            dir.cookies.insert(name.to_string(), cookie);
            dir.change += 1;
        }
        self.kinds.lock().unwrap().insert(id, kind);
        id
    }

    pub fn add_file(&self, parent: u64, name: &str) -> u64 {
        self.add_node(parent, name, ObjectType::RegularFile)
    }

    pub fn add_dir(&self, parent: u64, name: &str) -> u64 {
        self.add_node(parent, name, ObjectType::Directory)
    }

    pub fn touch_mtime(&self, id: u64, secs: u64) {
        let mut nodes = self.lock_nodes();
        let node = nodes.get_mut(&id).expect("node exists");
        node.mtime_secs = secs;
        node.change += 1;
    }

    pub fn node_count(&self) -> usize {
        self.lock_nodes().len()
    }

    fn kind_of(&self, id: u64) -> ObjectType {
        self.kinds
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or(ObjectType::RegularFile)
    }

    fn attrs_of(&self, nodes: &HashMap<u64, MemNode>, id: u64) -> Result<Attributes> {
        let node = nodes.get(&id).ok_or(MdcError::Stale)?;
        let mut attrs = Attributes::empty();
        attrs.valid = AttrMask::REGULAR;
        attrs.owner = node.owner;
        attrs.group = node.group;
        attrs.mode = node.mode;
        attrs.size = node.size;
        attrs.nlink = node.nlink;
        attrs.change = node.change;
        attrs.mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(node.mtime_secs);
        attrs.atime = attrs.mtime;
        attrs.ctime = attrs.mtime;
        Ok(attrs)
    }

    fn key_of(&self, nodes: &HashMap<u64, MemNode>, id: u64) -> Bytes {
        let key_gen = nodes.get(&id).map(|n| n.key_gen).unwrap_or(0);
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&id.to_be_bytes());
        bytes.extend_from_slice(&key_gen.to_be_bytes());
        Bytes::from(bytes)
    }
}

#[async_trait]
impl SubFsal for MemFs {
    type Handle = MemHandle;
    type State = u64;

    fn fsal_id(&self) -> FsalId {
        FsalId(7)
    }

    fn features(&self) -> FsalFeatures {
        *self.state.features.lock().unwrap()
    }

    fn supported_attrs(&self) -> AttrMask {
        AttrMask::REGULAR
    }

    fn handle_type(&self, obj: &MemHandle) -> ObjectType {
        self.state.kind_of(obj.id)
    }

    async fn root(&self) -> Result<Lookup<MemHandle>> {
        let nodes = self.state.lock_nodes();
        let attrs = self.state.attrs_of(&nodes, ROOT_ID)?;
        Ok(Lookup {
            handle: MemHandle { id: ROOT_ID },
            attrs,
        })
    }

    async fn lookup(&self, dir: &MemHandle, name: &str) -> Result<Lookup<MemHandle>> {
        self.state.counters.lookup.fetch_add(1, Ordering::Relaxed);
        if self.state.is_stale(dir.id) {
            return Err(MdcError::Stale);
        }
        let nodes = self.state.lock_nodes();
        let parent = nodes.get(&dir.id).ok_or(MdcError::Stale)?;
        if name == ".." {
            let up = parent.parent;
            let attrs = self.state.attrs_of(&nodes, up)?;
            return Ok(Lookup {
                handle: MemHandle { id: up },
                attrs,
            });
        }
        let cookie = parent.cookies.get(name).ok_or(MdcError::NotFound)?;
        let (_, child) = parent
            .children
            .get(cookie)
            .cloned()
            .ok_or(MdcError::NotFound)?;
        let attrs = self.state.attrs_of(&nodes, child)?;
        Ok(Lookup {
            handle: MemHandle { id: child },
            attrs,
        })
    }

    async fn readdir(
        &self,
        dir: &MemHandle,
        whence: Whence<'_>,
        limit: usize,
    ) -> Result<ReaddirBatch<MemHandle>> {
        self.state.counters.readdir.fetch_add(1, Ordering::Relaxed);
        if self.state.is_stale(dir.id) {
            return Err(MdcError::Stale);
        }
        let nodes = self.state.lock_nodes();
        let parent = nodes.get(&dir.id).ok_or(MdcError::Stale)?;

        let start_after: u64 = match whence {
            Whence::Start => 0,
            Whence::Cookie(ck) => {
                if *self.state.reject_cookies.lock().unwrap() {
                    return Err(MdcError::BadCookie(ck));
                }
                ck
            }
            Whence::Name(name) => *parent.cookies.get(name).ok_or(MdcError::NotFound)?,
        };

        let mut entries = Vec::new();
        let mut eod = true;
        for (cookie, (name, child)) in parent.children.range(start_after + 1..) {
            if entries.len() >= limit.max(1) {
                eod = false;
                break;
            }
            entries.push(RawDirent {
                name: name.clone(),
                handle: MemHandle { id: *child },
                attrs: self.state.attrs_of(&nodes, *child)?,
                cookie: *cookie,
            });
        }
        Ok(ReaddirBatch { entries, eod })
    }

    async fn create(
        &self,
        dir: &MemHandle,
        name: &str,
        attrs: &SetAttrs,
    ) -> Result<Lookup<MemHandle>> {
        self.state.counters.create.fetch_add(1, Ordering::Relaxed);
        if self.state.is_stale(dir.id) {
            return Err(MdcError::Stale);
        }
        {
            let nodes = self.state.lock_nodes();
            let parent = nodes.get(&dir.id).ok_or(MdcError::Stale)?;
            if parent.cookies.contains_key(name) {
                return Err(MdcError::Exists);
            }
        }
        let id = self.state.add_node(dir.id, name, ObjectType::RegularFile);
        if let Some(mode) = attrs.mode {
            self.state.lock_nodes().get_mut(&id).expect("node").mode = mode;
        }
        let nodes = self.state.lock_nodes();
        let attrs = self.state.attrs_of(&nodes, id)?;
        Ok(Lookup {
            handle: MemHandle { id },
            attrs,
        })
    }

    async fn mkdir(
        &self,
        dir: &MemHandle,
        name: &str,
        _attrs: &SetAttrs,
    ) -> Result<Lookup<MemHandle>> {
        self.state.counters.create.fetch_add(1, Ordering::Relaxed);
        if self.state.is_stale(dir.id) {
            return Err(MdcError::Stale);
        }
        {
            let nodes = self.state.lock_nodes();
            let parent = nodes.get(&dir.id).ok_or(MdcError::Stale)?;
            if parent.cookies.contains_key(name) {
                return Err(MdcError::Exists);
            }
        }
        let id = self.state.add_node(dir.id, name, ObjectType::Directory);
        let nodes = self.state.lock_nodes();
        let attrs = self.state.attrs_of(&nodes, id)?;
        Ok(Lookup {
            handle: MemHandle { id },
            attrs,
        })
    }

    async fn mknode(
        &self,
        dir: &MemHandle,
        name: &str,
        node_type: ObjectType,
        _attrs: &SetAttrs,
    ) -> Result<Lookup<MemHandle>> {
        let id = self.state.add_node(dir.id, name, node_type);
        let nodes = self.state.lock_nodes();
        let attrs = self.state.attrs_of(&nodes, id)?;
        Ok(Lookup {
            handle: MemHandle { id },
            attrs,
        })
    }

    async fn symlink(
        &self,
        dir: &MemHandle,
        name: &str,
        link_path: &str,
        _attrs: &SetAttrs,
    ) -> Result<Lookup<MemHandle>> {
        let id = self.state.add_node(dir.id, name, ObjectType::Symlink);
        let mut nodes = self.state.lock_nodes();
        nodes.get_mut(&id).expect("node").link_target = Some(link_path.to_string());
        let attrs = self.state.attrs_of(&nodes, id)?;
        Ok(Lookup {
            handle: MemHandle { id },
            attrs,
        })
    }

    async fn readlink(&self, obj: &MemHandle) -> Result<String> {
        let nodes = self.state.lock_nodes();
        nodes
            .get(&obj.id)
            .ok_or(MdcError::Stale)?
            .link_target
            .clone()
            .ok_or(MdcError::Invalid("not a symlink"))
    }

    async fn link(&self, obj: &MemHandle, dir: &MemHandle, name: &str) -> Result<()> {
        let mut nodes = self.state.lock_nodes();
        {
            let parent = nodes.get_mut(&dir.id).ok_or(MdcError::Stale)?;
            if parent.cookies.contains_key(name) {
                return Err(MdcError::Exists);
            }
            let cookie = parent.next_cookie;
            parent.next_cookie += 8;
            parent.children.insert(cookie, (name.to_string(), obj.id));
            parent.cookies.insert(name.to_string(), cookie);
            parent.change += 1;
        }
        let node = nodes.get_mut(&obj.id).ok_or(MdcError::Stale)?;
        node.nlink += 1;
        node.change += 1;
        Ok(())
    }

    async fn rename(
        &self,
        obj: &MemHandle,
        old_dir: &MemHandle,
        old_name: &str,
        new_dir: &MemHandle,
        new_name: &str,
    ) -> Result<()> {
        self.state.counters.rename.fetch_add(1, Ordering::Relaxed);
        let changes_key = self.features().contains(FsalFeatures::RENAME_CHANGES_KEY);
        let mut nodes = self.state.lock_nodes();

        let moved = {
            let src = nodes.get_mut(&old_dir.id).ok_or(MdcError::Stale)?;
            let cookie = *src.cookies.get(old_name).ok_or(MdcError::NotFound)?;
            let (_, child) = src.children.remove(&cookie).ok_or(MdcError::NotFound)?;
            src.cookies.remove(old_name);
            src.change += 1;
            child
        };

        {
            let dst = nodes.get_mut(&new_dir.id).ok_or(MdcError::Stale)?;
            if let Some(existing_ck) = dst.cookies.remove(new_name) {
                dst.children.remove(&existing_ck);
            }
            let cookie = dst.next_cookie;
            dst.next_cookie += 8;
            dst.children.insert(cookie, (new_name.to_string(), moved));
            dst.cookies.insert(new_name.to_string(), cookie);
            dst.change += 1;
        }

        if let Some(node) = nodes.get_mut(&obj.id) {
            if changes_key {
                node.key_gen += 1;
            }
            node.parent = new_dir.id;
            node.change += 1;
        }
        Ok(())
    }

    async fn unlink(&self, dir: &MemHandle, obj: &MemHandle, name: &str) -> Result<()> {
        self.state.counters.unlink.fetch_add(1, Ordering::Relaxed);
        if self.state.is_stale(dir.id) {
            return Err(MdcError::Stale);
        }
        let mut nodes = self.state.lock_nodes();
        if let Some(target) = nodes.get(&obj.id) {
            if target.kind.is_dir() && !target.children.is_empty() {
                return Err(MdcError::NotEmpty);
            }
        }
        let parent = nodes.get_mut(&dir.id).ok_or(MdcError::Stale)?;
        let cookie = *parent.cookies.get(name).ok_or(MdcError::NotFound)?;
        parent.children.remove(&cookie);
        parent.cookies.remove(name);
        parent.change += 1;
        nodes.remove(&obj.id);
        Ok(())
    }

    async fn getattrs(&self, obj: &MemHandle) -> Result<Attributes> {
        self.state.counters.getattrs.fetch_add(1, Ordering::Relaxed);
        if self.state.is_stale(obj.id) {
            return Err(MdcError::Stale);
        }
        let nodes = self.state.lock_nodes();
        self.state.attrs_of(&nodes, obj.id)
    }

    async fn setattrs(&self, obj: &MemHandle, _state: Option<&u64>, attrs: &SetAttrs) -> Result<()> {
        self.state.counters.setattrs.fetch_add(1, Ordering::Relaxed);
        let mut nodes = self.state.lock_nodes();
        let node = nodes.get_mut(&obj.id).ok_or(MdcError::Stale)?;
        if let Some(mode) = attrs.mode {
            node.mode = mode;
        }
        if let Some(owner) = attrs.owner {
            node.owner = owner;
        }
        if let Some(group) = attrs.group {
            node.group = group;
        }
        if let Some(size) = attrs.size {
            node.size = size;
        }
        node.change += 1;
        Ok(())
    }

    async fn open(&self, obj: &MemHandle, _flags: OpenFlags) -> Result<u64> {
        Ok(obj.id)
    }

    async fn close(&self, _obj: &MemHandle, _state: u64) -> Result<()> {
        Ok(())
    }

    async fn read(&self, _obj: &MemHandle, _offset: u64, len: usize) -> Result<Bytes> {
        Ok(Bytes::from(vec![0u8; len.min(16)]))
    }

    async fn write(&self, obj: &MemHandle, offset: u64, data: &[u8]) -> Result<usize> {
        let mut nodes = self.state.lock_nodes();
        let node = nodes.get_mut(&obj.id).ok_or(MdcError::Stale)?;
        node.size = node.size.max(offset + data.len() as u64);
        node.change += 1;
        Ok(data.len())
    }

    async fn commit(&self, _obj: &MemHandle, _offset: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    async fn lock_op(&self, _obj: &MemHandle, _request: &LockRequest) -> Result<()> {
        Ok(())
    }

    async fn getxattr(&self, obj: &MemHandle, name: &str) -> Result<Bytes> {
        let nodes = self.state.lock_nodes();
        nodes
            .get(&obj.id)
            .ok_or(MdcError::Stale)?
            .xattrs
            .get(name)
            .map(|v| Bytes::from(v.clone()))
            .ok_or(MdcError::NotFound)
    }

    async fn setxattr(&self, obj: &MemHandle, name: &str, value: &[u8]) -> Result<()> {
        let mut nodes = self.state.lock_nodes();
        let node = nodes.get_mut(&obj.id).ok_or(MdcError::Stale)?;
        node.xattrs.insert(name.to_string(), value.to_vec());
        node.change += 1;
        Ok(())
    }

    async fn removexattr(&self, obj: &MemHandle, name: &str) -> Result<()> {
        let mut nodes = self.state.lock_nodes();
        let node = nodes.get_mut(&obj.id).ok_or(MdcError::Stale)?;
        node.xattrs.remove(name);
        node.change += 1;
        Ok(())
    }

    async fn listxattrs(&self, obj: &MemHandle) -> Result<Vec<String>> {
        let nodes = self.state.lock_nodes();
        Ok(nodes
            .get(&obj.id)
            .ok_or(MdcError::Stale)?
            .xattrs
            .keys()
            .cloned()
            .collect())
    }

    fn handle_to_key(&self, obj: &MemHandle) -> Bytes {
        let nodes = self.state.lock_nodes();
        self.state.key_of(&nodes, obj.id)
    }

    fn handle_to_wire(&self, obj: &MemHandle) -> Result<Bytes> {
        Ok(Bytes::from(obj.id.to_be_bytes().to_vec()))
    }

    async fn create_handle(&self, wire: &[u8]) -> Result<Lookup<MemHandle>> {
        self.state
            .counters
            .create_handle
            .fetch_add(1, Ordering::Relaxed);
        let id = u64::from_be_bytes(wire.try_into().map_err(|_| MdcError::Invalid("bad wire"))?);
        if self.state.is_stale(id) {
            return Err(MdcError::Stale);
        }
        let nodes = self.state.lock_nodes();
        let attrs = self.state.attrs_of(&nodes, id)?;
        Ok(Lookup {
            handle: MemHandle { id },
            attrs,
        })
    }

    fn host_to_key(&self, raw: &[u8]) -> Result<Bytes> {
        let id = u64::from_be_bytes(raw.try_into().map_err(|_| MdcError::Invalid("bad wire"))?);
        let nodes = self.state.lock_nodes();
        Ok(self.state.key_of(&nodes, id))
    }

    async fn compute_readdir_cookie(&self, dir: &MemHandle, name: &str) -> u64 {
        self.state
            .counters
            .compute_cookie
            .fetch_add(1, Ordering::Relaxed);
        if !self
            .features()
            .contains(FsalFeatures::COMPUTE_READDIR_COOKIE)
        {
            return 0;
        }
        let nodes = self.state.lock_nodes();
        nodes
            .get(&dir.id)
            .and_then(|d| d.cookies.get(name))
            .copied()
            .unwrap_or(0)
    }

    async fn merge(&self, _orig: &MemHandle, _duplicate: &MemHandle) -> Result<()> {
        self.state.counters.merge.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Install a tracing subscriber for the test binary, once. Honors
/// `RUST_LOG`, e.g. `RUST_LOG=mdcache=trace cargo test`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A cache over a fresh `MemFs`, with one export mapped.
pub struct Harness {
    pub cache: Arc<MdCache<MemFs>>,
    pub ctx: OpContext<MemFs>,
    pub fs: Arc<MemState>,
}

pub fn harness(config: MdcConfig, features: FsalFeatures) -> Harness {
    init_tracing();
    let fs = MemFs::new(features);
    let state = fs.state();
    let cache = Arc::new(MdCache::new(fs, config).expect("config valid"));
    let export = cache
        .add_export(1, Default::default())
        .expect("export added");
    Harness {
        cache,
        ctx: OpContext::new(export, Credentials::ROOT),
        fs: state,
    }
}

/// Chunking config used by most suites: 8 dirents per chunk.
pub fn chunked_config() -> MdcConfig {
    let mut config = MdcConfig::default();
    config.dir.avl_chunk = 8;
    config.dir.avl_chunk_split = 16;
    config.dir.avl_detached_max = 16;
    config
}

pub fn legacy_config() -> MdcConfig {
    let mut config = MdcConfig::default();
    config.dir.avl_chunk = 0;
    config
}

/// Names returned by a full readdir from `whence`, plus the eod flag.
pub async fn collect_names_from(
    h: &Harness,
    dir: &mdcache::EntryRef<MemFs>,
    whence: u64,
) -> (Vec<String>, bool) {
    let mut names = Vec::new();
    let eod = h
        .cache
        .readdir(&h.ctx, dir, whence, &mut |entry: &mdcache::ReaddirEntry<
            '_,
            MemFs,
        >| {
            names.push(entry.name.to_string());
            mdcache::DirResult::Continue
        })
        .await
        .expect("readdir succeeds");
    (names, eod)
}

pub async fn collect_names(h: &Harness, dir: &mdcache::EntryRef<MemFs>) -> (Vec<String>, bool) {
    collect_names_from(h, dir, 0).await
}
