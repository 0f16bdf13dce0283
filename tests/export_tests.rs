#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use common::{chunked_config, harness, ROOT_ID};
use mdcache::{Credentials, ExportOptions, FsalFeatures, MdcError, OpContext};

#[tokio::test]
async fn duplicate_export_id_rejected() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    assert_eq!(
        h.cache
            .add_export(1, ExportOptions::default())
            .map(|_| ())
            .unwrap_err(),
        MdcError::Exists
    );
}

#[tokio::test]
async fn entries_are_mapped_through_their_export() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    h.fs.add_file(ROOT_ID, "file");
    let root = h.cache.root(&h.ctx).await.unwrap();
    let _file = h.cache.lookup(&h.ctx, &root, "file").await.unwrap();

    assert_eq!(
        h.ctx.export.mapped_entry_count(),
        2,
        "root and the file are both reached through export 1"
    );
}

#[tokio::test]
async fn second_export_maps_shared_entries() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    h.fs.add_file(ROOT_ID, "file");
    let root = h.cache.root(&h.ctx).await.unwrap();
    h.cache.lookup(&h.ctx, &root, "file").await.unwrap();

    let export2 = h.cache.add_export(2, ExportOptions::default()).unwrap();
    let ctx2 = OpContext::new(export2, Credentials::ROOT);

    // The same cached object becomes reachable through the second export.
    let root2 = h.cache.root(&ctx2).await.unwrap();
    let again = h.cache.lookup(&ctx2, &root2, "file").await.unwrap();
    let first = h.cache.lookup(&h.ctx, &root, "file").await.unwrap();
    assert!(h.cache.handle_cmp(&first, &again));
    assert_eq!(ctx2.export.mapped_entry_count(), 2);
}

#[tokio::test]
async fn operations_during_unexport_are_stale() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    let root = h.cache.root(&h.ctx).await.unwrap();

    let export = h.ctx.export.clone();
    h.cache.remove_export(&export).await;

    // The export flag is observed before any mapping is added; the create
    // path fails stale and leaves no mapping behind.
    assert_eq!(
        h.cache
            .create(&h.ctx, &root, "during", &Default::default())
            .await
            .unwrap_err(),
        MdcError::Stale
    );
    assert_eq!(
        export.mapped_entry_count(),
        0,
        "no mapping record may be added once unexport has begun"
    );
}

#[tokio::test]
async fn unexport_kills_solely_mapped_entries() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    h.fs.add_file(ROOT_ID, "file");
    let root = h.cache.root(&h.ctx).await.unwrap();
    h.cache.lookup(&h.ctx, &root, "file").await.unwrap();
    assert_eq!(h.cache.entry_count(), 2);

    let export = h.ctx.export.clone();
    h.cache.remove_export(&export).await;

    assert_eq!(
        h.cache.entry_count(),
        0,
        "entries reachable only through the removed export are killed"
    );
}

#[tokio::test]
async fn unexport_spares_entries_mapped_elsewhere() {
    let h = harness(chunked_config(), FsalFeatures::COMPUTE_READDIR_COOKIE);
    h.fs.add_file(ROOT_ID, "file");
    let root = h.cache.root(&h.ctx).await.unwrap();
    h.cache.lookup(&h.ctx, &root, "file").await.unwrap();

    let export2 = h.cache.add_export(2, ExportOptions::default()).unwrap();
    let ctx2 = OpContext::new(export2.clone(), Credentials::ROOT);
    let root2 = h.cache.root(&ctx2).await.unwrap();
    h.cache.lookup(&ctx2, &root2, "file").await.unwrap();

    let export1 = h.ctx.export.clone();
    h.cache.remove_export(&export1).await;

    assert_eq!(
        h.cache.entry_count(),
        2,
        "entries still mapped through export 2 survive"
    );
    h.cache.lookup(&ctx2, &root2, "file").await.unwrap();
}
