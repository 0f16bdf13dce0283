#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::atomic::Ordering;

use common::{chunked_config, collect_names, harness, ROOT_ID};
use mdcache::{ExportOptions, FsalFeatures, MdcError, ObjectType};

#[tokio::test]
async fn uncached_lookup_then_cached_hit() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    h.fs.add_file(ROOT_ID, "file");
    let root = h.cache.root(&h.ctx).await.unwrap();

    let first = h.cache.lookup(&h.ctx, &root, "file").await.unwrap();
    assert_eq!(first.object_type(), ObjectType::RegularFile);
    assert_eq!(h.fs.counters.lookup.load(Ordering::Relaxed), 1);

    let second = h.cache.lookup(&h.ctx, &root, "file").await.unwrap();
    assert!(h.cache.handle_cmp(&first, &second));
    assert_eq!(
        h.fs.counters.lookup.load(Ordering::Relaxed),
        1,
        "repeat lookup must be served by the dirent cache"
    );
    assert!(h.cache.stats().inode_hit >= 1, "hit counter moved");
}

#[tokio::test]
async fn missing_name_is_noent() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    let root = h.cache.root(&h.ctx).await.unwrap();
    assert_eq!(
        h.cache.lookup(&h.ctx, &root, "ghost").await.unwrap_err(),
        MdcError::NotFound
    );
}

#[tokio::test]
async fn negative_cache_answers_without_backend() {
    let mut options = ExportOptions::default();
    options.trust_readdir_negative_cache = Some(true);

    let fs = common::MemFs::new(FsalFeatures::COMPUTE_READDIR_COOKIE);
    let state = fs.state();
    state.add_file(ROOT_ID, "present");
    let cache = std::sync::Arc::new(mdcache::MdCache::new(fs, chunked_config()).unwrap());
    let export = cache.add_export(1, options).unwrap();
    let ctx = mdcache::OpContext::new(export, mdcache::Credentials::ROOT);

    let root = cache.root(&ctx).await.unwrap();
    let mut names = Vec::new();
    cache
        .readdir(&ctx, &root, 0, &mut |entry: &mdcache::ReaddirEntry<
            '_,
            common::MemFs,
        >| {
            names.push(entry.name.to_string());
            mdcache::DirResult::Continue
        })
        .await
        .unwrap();
    assert_eq!(names, vec!["present"], "directory fully populated");

    let lookups = state.counters.lookup.load(Ordering::Relaxed);
    assert_eq!(
        cache.lookup(&ctx, &root, "absent").await.unwrap_err(),
        MdcError::NotFound
    );
    assert_eq!(
        state.counters.lookup.load(Ordering::Relaxed),
        lookups,
        "a populated, trusted directory serves negative lookups itself"
    );
}

#[tokio::test]
async fn dotdot_resolves_through_parent_handle() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    let dir_id = h.fs.add_dir(ROOT_ID, "d");
    h.fs.add_dir(dir_id, "nested");
    let root = h.cache.root(&h.ctx).await.unwrap();

    let d = h.cache.lookup(&h.ctx, &root, "d").await.unwrap();
    let nested = h.cache.lookup(&h.ctx, &d, "nested").await.unwrap();

    let up = h.cache.lookup(&h.ctx, &nested, "..").await.unwrap();
    assert!(h.cache.handle_cmp(&up, &d), ".. resolves to the parent");

    let up2 = h.cache.lookup(&h.ctx, &d, "..").await.unwrap();
    assert!(h.cache.handle_cmp(&up2, &root));
}

#[tokio::test]
async fn stale_parent_lookup_kills_and_recreates() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    let p_id = h.fs.add_dir(ROOT_ID, "p");
    h.fs.add_file(p_id, "x");
    let root = h.cache.root(&h.ctx).await.unwrap();

    let p = h.cache.lookup(&h.ctx, &root, "p").await.unwrap();
    let entries_before = h.cache.entry_count();

    h.fs.mark_stale(p_id);
    assert_eq!(
        h.cache.lookup(&h.ctx, &p, "x").await.unwrap_err(),
        MdcError::NotFound,
        "a stale parent surfaces as a miss"
    );
    assert!(
        h.cache.entry_count() < entries_before,
        "the stale parent was killed"
    );

    // The protocol layer retries from the wire handle and gets a fresh
    // cache entry for the same object.
    h.fs.clear_stale(p_id);
    let wire = h.cache.handle_to_wire(&p).unwrap();
    let p2 = h.cache.create_handle(&h.ctx, &wire).await.unwrap();
    assert!(h.cache.handle_cmp(&p, &p2), "same object, fresh entry");
    h.cache.lookup(&h.ctx, &p2, "x").await.unwrap();
}

#[tokio::test]
async fn lookup_on_file_is_not_directory() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    h.fs.add_file(ROOT_ID, "plain");
    let root = h.cache.root(&h.ctx).await.unwrap();
    let plain = h.cache.lookup(&h.ctx, &root, "plain").await.unwrap();

    assert_eq!(
        h.cache.lookup(&h.ctx, &plain, "sub").await.unwrap_err(),
        MdcError::NotDirectory
    );
}

#[tokio::test]
async fn symlink_roundtrip() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    let root = h.cache.root(&h.ctx).await.unwrap();

    let link = h
        .cache
        .symlink(&h.ctx, &root, "ln", "target/path", &Default::default())
        .await
        .unwrap();
    assert_eq!(link.object_type(), ObjectType::Symlink);
    assert_eq!(
        h.cache.readlink(&h.ctx, &link).await.unwrap(),
        "target/path"
    );
    assert_eq!(
        h.cache.readlink(&h.ctx, &root).await.unwrap_err(),
        MdcError::Invalid("readlink on non-symlink")
    );
}

#[tokio::test]
async fn link_adds_second_name_for_same_object() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    h.fs.add_file(ROOT_ID, "orig");
    let root = h.cache.root(&h.ctx).await.unwrap();
    collect_names(&h, &root).await;

    let orig = h.cache.lookup(&h.ctx, &root, "orig").await.unwrap();
    h.cache.link(&h.ctx, &orig, &root, "alias").await.unwrap();

    let alias = h.cache.lookup(&h.ctx, &root, "alias").await.unwrap();
    assert!(
        h.cache.handle_cmp(&orig, &alias),
        "both names resolve to one object"
    );
}

#[tokio::test]
async fn mknode_creates_special_files() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    let root = h.cache.root(&h.ctx).await.unwrap();

    let fifo = h
        .cache
        .mknode(&h.ctx, &root, "pipe", ObjectType::NamedPipe, &Default::default())
        .await
        .unwrap();
    assert_eq!(fifo.object_type(), ObjectType::NamedPipe);

    let found = h.cache.lookup(&h.ctx, &root, "pipe").await.unwrap();
    assert!(h.cache.handle_cmp(&fifo, &found));
}
