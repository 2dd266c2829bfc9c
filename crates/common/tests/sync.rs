//! Directory synchronisation tests: create, copy, replace and remove.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use ::common::testkit::{init_tracing, test_tree, TestBranch};
use ::common::tree::{
    Tree, SYNC_COPY_FILE, SYNC_CREATE_DIRECTORY, SYNC_REMOVE_FILE,
};

use common::SECRET;

/// Two branches mounted side by side: `/src` read-only-ish source,
/// `/dst` writable destination.
async fn sync_setup() -> (TestBranch, TestBranch, Tree) {
    init_tracing();

    let src = TestBranch::start("src", SECRET, false).await.unwrap();
    let dst = TestBranch::start("dst", SECRET, false).await.unwrap();

    let tree = test_tree(SECRET);
    tree.add_branch("src", &src.rpc(), "").await.unwrap();
    tree.add_branch("dst", &dst.rpc(), "").await.unwrap();
    tree.add_mapping("/src", "src", false).await.unwrap();
    tree.add_mapping("/dst", "dst", true).await.unwrap();

    (src, dst, tree)
}

#[tokio::test]
async fn test_sync_copies_missing_and_replaces_mismatched() {
    let (src, dst, tree) = sync_setup().await;

    src.seed("a", b"A");
    src.seed("sub/b", b"B");

    dst.seed("a", b"X");
    dst.seed("c", b"C");

    let ops = Arc::new(Mutex::new(Vec::new()));
    let ops_clone = ops.clone();

    tree.sync(
        "/src",
        "/dst",
        true,
        Some(&move |op: &str, _src: &str, dst_file: &str, _w, _t, _cur, _total| {
            ops_clone.lock().unwrap().push((op.to_string(), dst_file.to_string()));
        }),
    )
    .await
    .unwrap();

    // Content was copied and replaced
    assert_eq!(std::fs::read(dst.local("a")).unwrap(), b"A");
    assert_eq!(std::fs::read(dst.local("sub/b")).unwrap(), b"B");
    // Extraneous files were removed
    assert!(!dst.local("c").exists());

    let ops = ops.lock().unwrap();
    let kinds: HashSet<&str> = ops.iter().map(|(op, _)| op.as_str()).collect();
    assert!(kinds.contains(SYNC_COPY_FILE));
    assert!(kinds.contains(SYNC_CREATE_DIRECTORY));
    assert!(kinds.contains(SYNC_REMOVE_FILE));

    assert!(ops
        .iter()
        .any(|(op, path)| op == SYNC_REMOVE_FILE && path == "/dst/c"));

    src.stop().await;
    dst.stop().await;
}

#[tokio::test]
async fn test_sync_is_idempotent() {
    let (src, dst, tree) = sync_setup().await;

    src.seed("a", b"A");
    src.seed("sub/b", b"B");

    tree.sync("/src", "/dst", true, None).await.unwrap();

    // A second run must not copy anything again
    let copies = Arc::new(Mutex::new(0u32));
    let copies_clone = copies.clone();
    tree.sync(
        "/src",
        "/dst",
        true,
        Some(&move |op: &str, _: &str, _: &str, _w, _t, _cur, _total| {
            if op == SYNC_COPY_FILE {
                *copies_clone.lock().unwrap() += 1;
            }
        }),
    )
    .await
    .unwrap();

    assert_eq!(*copies.lock().unwrap(), 0);

    src.stop().await;
    dst.stop().await;
}

#[tokio::test]
async fn test_sync_makes_listings_identical() {
    let (src, dst, tree) = sync_setup().await;

    src.seed("one", b"1");
    src.seed("nested/two", b"22");
    src.seed("nested/deeper/three", b"333");

    dst.seed("stale/junk", b"junk");

    tree.sync("/src", "/dst", true, None).await.unwrap();

    let (src_paths, src_infos) = tree.dir("/src", "", true, true).await.unwrap();
    let (dst_paths, dst_infos) = tree.dir("/dst", "", true, true).await.unwrap();

    let strip = |paths: &[String], prefix: &str| -> Vec<String> {
        paths
            .iter()
            .map(|p| p.strip_prefix(prefix).unwrap_or(p).to_string())
            .collect()
    };

    assert_eq!(strip(&src_paths, "/src"), strip(&dst_paths, "/dst"));

    // Same (name, checksum) pairs at every level
    for (s_fis, d_fis) in src_infos.iter().zip(&dst_infos) {
        let mut s: Vec<(String, String)> = s_fis
            .iter()
            .map(|fi| (fi.name.clone(), fi.checksum.clone()))
            .collect();
        let mut d: Vec<(String, String)> = d_fis
            .iter()
            .map(|fi| (fi.name.clone(), fi.checksum.clone()))
            .collect();
        s.sort();
        d.sort();
        assert_eq!(s, d);
    }

    src.stop().await;
    dst.stop().await;
}

#[tokio::test]
async fn test_sync_removes_extraneous_directories() {
    let (src, dst, tree) = sync_setup().await;

    src.seed("keep", b"k");
    dst.seed("gone/inner/file", b"x");

    tree.sync("/src", "/dst", true, None).await.unwrap();

    assert!(dst.local("keep").is_file());
    assert!(!dst.local("gone").exists());

    src.stop().await;
    dst.stop().await;
}

#[tokio::test]
async fn test_non_recursive_sync_only_touches_the_top_level() {
    let (src, dst, tree) = sync_setup().await;

    src.seed("top", b"t");
    src.seed("sub/inner", b"i");

    tree.sync("/src", "/dst", false, None).await.unwrap();

    assert!(dst.local("top").is_file());
    // The directory itself is created, its contents are not synced
    assert!(dst.local("sub").is_dir());
    assert!(!dst.local("sub/inner").exists());

    src.stop().await;
    dst.stop().await;
}
