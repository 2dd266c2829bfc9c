//! Item operations through the tree: mkdir, rename, delete and the
//! partial-failure aggregates.

mod common;

use ::common::node::ItemOp;
use ::common::testkit::{init_tracing, test_tree, TestBranch};
use ::common::tree::TreeError;

use common::{names, overlay_setup, single_setup, SECRET};

#[tokio::test]
async fn test_mkdir_and_rename() {
    let (branch, tree) = single_setup("footest").await;
    branch.seed("test1", b"Test1 file");

    let ok = tree
        .item_op(
            "/",
            &ItemOp::Mkdir {
                name: "newdir".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(ok);
    assert!(branch.local("newdir").is_dir());

    let ok = tree
        .item_op(
            "/",
            &ItemOp::Rename {
                name: "test1".to_string(),
                new_name: "test1_renamed".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(ok);
    assert!(branch.local("test1_renamed").is_file());
    assert!(!branch.local("test1").exists());

    branch.stop().await;
}

#[tokio::test]
async fn test_delete_aggregates_not_exists() {
    let (foo, bar, tree) = overlay_setup().await;

    // Exists only on bar; foo's not-exists must not fail the call
    let ok = tree
        .item_op(
            "/",
            &ItemOp::Delete {
                name: "test4".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(ok);
    assert!(!bar.local("test4").exists());

    // Missing everywhere aggregates into not-exists
    let err = tree
        .item_op(
            "/",
            &ItemOp::Delete {
                name: "missing".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_not_exist());

    foo.stop().await;
    bar.stop().await;
}

#[tokio::test]
async fn test_item_op_not_writable_aggregate() {
    init_tracing();

    let branch = TestBranch::start("footest", SECRET, false).await.unwrap();
    branch.seed("test1", b"Test1 file");

    let tree = test_tree(SECRET);
    tree.add_branch("footest", &branch.rpc(), "").await.unwrap();
    tree.add_mapping("/", "footest", false).await.unwrap();

    let err = tree
        .item_op(
            "/",
            &ItemOp::Delete {
                name: "test1".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, TreeError::NotWritable);

    // Reads are unaffected by the mapping's write flag
    let (_, infos) = tree.dir("/", "", false, false).await.unwrap();
    assert_eq!(names(&infos[0]), vec!["test1"]);

    branch.stop().await;
}

#[tokio::test]
async fn test_delete_with_recursive_pattern() {
    init_tracing();

    // Two branches mapped at different levels of the namespace
    let top = TestBranch::start("top", SECRET, false).await.unwrap();
    top.seed("x1.tmp", b"a");
    top.seed("keep", b"b");

    let nested = TestBranch::start("nested", SECRET, false).await.unwrap();
    nested.seed("x2.tmp", b"c");

    let tree = test_tree(SECRET);
    tree.add_branch("top", &top.rpc(), "").await.unwrap();
    tree.add_branch("nested", &nested.rpc(), "").await.unwrap();
    tree.add_mapping("/", "top", true).await.unwrap();
    tree.add_mapping("/sub", "nested", true).await.unwrap();

    // A name ending in ** walks the whole mapping subtree
    let ok = tree
        .item_op(
            "/",
            &ItemOp::Delete {
                name: "x**".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(ok);

    assert!(!top.local("x1.tmp").exists());
    assert!(!nested.local("x2.tmp").exists());
    assert!(top.local("keep").exists());

    top.stop().await;
    nested.stop().await;
}

#[tokio::test]
async fn test_delete_plain_name_does_not_recurse_into_mappings() {
    init_tracing();

    let top = TestBranch::start("top", SECRET, false).await.unwrap();
    top.seed("victim", b"a");

    let nested = TestBranch::start("nested", SECRET, false).await.unwrap();
    nested.seed("victim", b"b");

    let tree = test_tree(SECRET);
    tree.add_branch("top", &top.rpc(), "").await.unwrap();
    tree.add_branch("nested", &nested.rpc(), "").await.unwrap();
    tree.add_mapping("/", "top", true).await.unwrap();
    tree.add_mapping("/sub", "nested", true).await.unwrap();

    tree.item_op(
        "/",
        &ItemOp::Delete {
            name: "victim".to_string(),
        },
    )
    .await
    .unwrap();

    assert!(!top.local("victim").exists());
    // The nested mapping level was not visited
    assert!(nested.local("victim").exists());

    top.stop().await;
    nested.stop().await;
}

#[tokio::test]
async fn test_mixed_writable_mounts_succeed_on_the_writable_one() {
    init_tracing();

    let rw = TestBranch::start("rw", SECRET, false).await.unwrap();
    rw.seed("target", b"a");

    let ro = TestBranch::start("ro", SECRET, false).await.unwrap();
    ro.seed("target", b"b");

    let tree = test_tree(SECRET);
    tree.add_branch("rw", &rw.rpc(), "").await.unwrap();
    tree.add_branch("ro", &ro.rpc(), "").await.unwrap();
    tree.add_mapping("/", "rw", true).await.unwrap();
    tree.add_mapping("/", "ro", false).await.unwrap();

    let ok = tree
        .item_op(
            "/",
            &ItemOp::Delete {
                name: "target".to_string(),
            },
        )
        .await
        .unwrap();

    assert!(ok);
    assert!(!rw.local("target").exists());
    // The read-only mount was ignored, not failed
    assert!(ro.local("target").exists());

    rw.stop().await;
    ro.stop().await;
}
