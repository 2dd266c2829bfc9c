//! Union namespace listing tests: overlay merge, pseudo directories,
//! stat and refresh.

mod common;

use ::common::fileinfo::MODE_DIR;
use ::common::testkit::{init_tracing, test_tree, TestBranch};
use ::common::tree::TreeError;

use common::{names, overlay_setup, SECRET};

#[tokio::test]
async fn test_overlay_dir_merge() {
    let (foo, bar, tree) = overlay_setup().await;

    let (paths, infos) = tree.dir("/", "", false, false).await.unwrap();

    assert_eq!(paths, vec!["/"]);
    // test1 exists on both branches; foo was mapped first and wins
    assert_eq!(names(&infos[0]), vec!["sub1", "test1", "test2", "test4"]);

    let test1 = infos[0].iter().find(|fi| fi.name == "test1").unwrap();
    let test2 = infos[0].iter().find(|fi| fi.name == "test2").unwrap();
    assert_eq!(test1.size, 10);
    assert_eq!(test2.size, 10);

    // The content behind test1 is foo's, not bar's
    let mut buf = [0u8; 32];
    let n = tree.read_file("/test1", &mut buf, 0).await.unwrap();
    assert_eq!(&buf[..n], b"Test1 file");

    foo.stop().await;
    bar.stop().await;
}

#[tokio::test]
async fn test_recursive_dir_and_pattern() {
    let (foo, bar, tree) = overlay_setup().await;

    let (paths, infos) = tree.dir("/", "", true, false).await.unwrap();
    assert_eq!(paths, vec!["/", "/sub1"]);
    assert_eq!(names(&infos[1]), vec!["test3"]);

    // Patterns filter entries but not traversal
    let (paths, infos) = tree.dir("/", "test3", true, false).await.unwrap();
    assert_eq!(paths, vec!["/", "/sub1"]);
    assert!(infos[0].is_empty());
    assert_eq!(names(&infos[1]), vec!["test3"]);

    foo.stop().await;
    bar.stop().await;
}

#[tokio::test]
async fn test_pseudo_directories_for_mapping_components() {
    init_tracing();

    let inner = TestBranch::start("inner", SECRET, false).await.unwrap();
    inner.seed("data", b"payload");

    let tree = test_tree(SECRET);
    tree.add_branch("inner", &inner.rpc(), "").await.unwrap();
    tree.add_mapping("/mnt/deep", "inner", true).await.unwrap();

    // Neither /mnt nor /mnt/deep exist physically anywhere
    let (paths, infos) = tree.dir("/", "", false, false).await.unwrap();
    assert_eq!(paths, vec!["/"]);
    assert_eq!(names(&infos[0]), vec!["mnt"]);

    let pseudo = &infos[0][0];
    assert!(pseudo.is_dir());
    assert_eq!(pseudo.mode, MODE_DIR | 0o777);
    assert_eq!(pseudo.size, 0);

    // Recursing lists the synthesised levels and the real content
    let (paths, infos) = tree.dir("/", "", true, false).await.unwrap();

    let mut sorted: Vec<(&String, &Vec<_>)> = paths.iter().zip(&infos).collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let listed: Vec<&str> = sorted.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(listed, vec!["/", "/mnt", "/mnt/deep"]);
    assert_eq!(names(sorted[2].1), vec!["data"]);

    // Pseudo entries respect the caller's pattern
    let (_, infos) = tree.dir("/", "nomatch", false, false).await.unwrap();
    assert!(infos[0].is_empty());

    inner.stop().await;
}

#[tokio::test]
async fn test_stat() {
    let (foo, bar, tree) = overlay_setup().await;

    let fi = tree.stat("/test2").await.unwrap();
    assert_eq!(fi.name, "test2");
    assert_eq!(fi.size, 10);
    assert!(!fi.is_dir());
    // Stat always carries checksums
    assert!(!fi.checksum.is_empty());

    let fi = tree.stat("/sub1").await.unwrap();
    assert!(fi.is_dir());

    let err = tree.stat("/missing").await.unwrap_err();
    assert!(err.is_not_exist());

    foo.stop().await;
    bar.stop().await;
}

#[tokio::test]
async fn test_stat_survives_unreachable_overlay_branch() {
    let (foo, bar, tree) = overlay_setup().await;

    // bar drops out and no refresh has run yet
    bar.stop().await;

    // Plain listings still fail on the dead branch
    assert!(tree.dir("/", "", false, false).await.is_err());

    // test1 lives on foo, which answered before bar failed; the entry
    // wins over the partial-listing error
    let fi = tree.stat("/test1").await.unwrap();
    assert_eq!(fi.name, "test1");
    assert_eq!(fi.size, 10);
    assert!(!fi.checksum.is_empty());

    // A file only bar held really is gone
    assert!(tree.stat("/test4").await.is_err());

    foo.stop().await;
}

#[tokio::test]
async fn test_dir_fails_when_branch_unreachable() {
    let (foo, bar, tree) = overlay_setup().await;

    bar.stop().await;

    let err = tree.dir("/", "", false, false).await.unwrap_err();
    assert!(matches!(err, TreeError::Node(_)));

    // Refresh moves the dead branch out of the live tree; listings
    // work again with what is left
    tree.refresh().await;

    let (_, infos) = tree.dir("/", "", false, false).await.unwrap();
    assert_eq!(names(&infos[0]), vec!["sub1", "test1", "test2"]);

    assert_eq!(tree.not_reachable_branches().await.len(), 1);
    assert_eq!(tree.active_branches().0, vec!["foo"]);
    assert_eq!(tree.known_branches().await.len(), 2);

    foo.stop().await;
}

#[tokio::test]
async fn test_mapping_document_roundtrip() {
    init_tracing();

    let branch = TestBranch::start("footest", SECRET, false).await.unwrap();
    branch.seed("test1", b"Test1 file");

    let tree = test_tree(SECRET);

    let doc = format!(
        r#"{{ "branches": [ {{"branch":"footest","rpc":"{}","fingerprint":""}} ],
             "tree":     [ {{"path":"/","branch":"footest","writeable":true}} ] }}"#,
        branch.rpc()
    );
    tree.set_mapping(&doc).await.unwrap();

    let (_, infos) = tree.dir("/", "", false, false).await.unwrap();
    assert_eq!(names(&infos[0]), vec!["test1"]);

    // The emitted config carries the adopted fingerprint
    let config = tree.config().await;
    assert!(config.contains(&branch.fingerprint()));
    assert!(config.contains("\"writeable\": true"));

    branch.stop().await;
}

#[tokio::test]
async fn test_tree_string_rendering() {
    let (foo, bar, tree) = overlay_setup().await;

    tree.add_mapping("/extra", "bar", false).await.unwrap();

    let rendered = tree.tree_string().await;
    assert_eq!(rendered, "/: foo(w), bar(w)\n  extra/: bar(r)\n");

    foo.stop().await;
    bar.stop().await;
}

#[tokio::test]
async fn test_reset() {
    let (foo, bar, tree) = overlay_setup().await;

    tree.reset(false).await;
    // Mappings are gone, branches stay registered
    let (paths, infos) = tree.dir("/", "", false, false).await.unwrap();
    assert_eq!(paths, vec!["/"]);
    assert!(infos[0].is_empty());
    assert_eq!(tree.active_branches().0.len(), 2);

    tree.reset(true).await;
    assert!(tree.active_branches().0.is_empty());
    assert!(tree.known_branches().await.is_empty());

    foo.stop().await;
    bar.stop().await;
}
