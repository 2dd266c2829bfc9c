//! Read/write semantics through the tree: round trips, offsets,
//! write fan-out and policy enforcement.

mod common;

use std::io::Cursor;

use ::common::node;
use ::common::testkit::{init_tracing, test_tree, TestBranch};
use ::common::tree::TreeError;
use ::common::util::DEFAULT_READ_BUFFER_SIZE;

use common::{overlay_setup, single_setup, SECRET};

#[tokio::test]
async fn test_write_read_roundtrip() {
    let (branch, tree) = single_setup("footest").await;

    let payload = b"The quick brown fox jumps over the lazy dog";
    let n = tree.write_file("/roundtrip", payload, 0).await.unwrap();
    assert_eq!(n, payload.len());

    let mut buf = vec![0u8; 128];
    let n = tree.read_file("/roundtrip", &mut buf, 0).await.unwrap();
    assert_eq!(&buf[..n], payload);

    // And the bytes really are on the branch
    assert_eq!(std::fs::read(branch.local("roundtrip")).unwrap(), payload);

    branch.stop().await;
}

#[tokio::test]
async fn test_write_at_offset_pads_with_zeroes() {
    let (branch, tree) = single_setup("footest").await;

    tree.write_file("/padded", b"tail", 6).await.unwrap();
    assert_eq!(
        std::fs::read(branch.local("padded")).unwrap(),
        b"\0\0\0\0\0\0tail"
    );

    branch.stop().await;
}

#[tokio::test]
async fn test_zero_length_write_finalises_empty_file() {
    let (branch, tree) = single_setup("footest").await;

    let n = tree.write_file("/empty", &[], 0).await.unwrap();
    assert_eq!(n, 0);
    assert_eq!(std::fs::read(branch.local("empty")).unwrap(), b"");

    branch.stop().await;
}

#[tokio::test]
async fn test_eof_propagates_to_the_caller() {
    let (branch, tree) = single_setup("footest").await;
    branch.seed("data", b"0123456789");

    let mut buf = [0u8; 4];
    let err = tree.read_file("/data", &mut buf, 10).await.unwrap_err();
    assert!(err.is_eof());

    branch.stop().await;
}

#[tokio::test]
async fn test_overlay_read_skips_not_exists() {
    let (foo, bar, tree) = overlay_setup().await;

    // test4 only exists on bar, the second branch in overlay order
    let mut buf = [0u8; 32];
    let n = tree.read_file("/test4", &mut buf, 0).await.unwrap();
    assert_eq!(&buf[..n], b"Test4 file");

    let err = tree
        .read_file("/nowhere", &mut buf, 0)
        .await
        .unwrap_err();
    assert!(err.is_not_exist());

    foo.stop().await;
    bar.stop().await;
}

#[tokio::test]
async fn test_write_fans_out_to_all_writable_branches() {
    let (foo, bar, tree) = overlay_setup().await;

    tree.write_file("/fanout", b"both", 0).await.unwrap();

    assert_eq!(std::fs::read(foo.local("fanout")).unwrap(), b"both");
    assert_eq!(std::fs::read(bar.local("fanout")).unwrap(), b"both");

    foo.stop().await;
    bar.stop().await;
}

#[tokio::test]
async fn test_write_rejected_when_nothing_writable() {
    init_tracing();

    let branch = TestBranch::start("ro", SECRET, true).await.unwrap();

    let tree = test_tree(SECRET);
    tree.add_branch("ro", &branch.rpc(), "").await.unwrap();
    tree.add_mapping("/", "ro", false).await.unwrap();

    let err = tree.write_file("/x", b"hi", 0).await.unwrap_err();
    assert_eq!(err, TreeError::NotWritable);
    assert_eq!(
        err.to_string(),
        "All applicable branches for the requested path were mounted as not writable"
    );

    branch.stop().await;
}

#[tokio::test]
async fn test_branch_side_read_only_enforcement() {
    init_tracing();

    // Mounted writable, but the branch itself refuses writes
    let branch = TestBranch::start("ro", SECRET, true).await.unwrap();

    let tree = test_tree(SECRET);
    tree.add_branch("ro", &branch.rpc(), "").await.unwrap();
    tree.add_mapping("/", "ro", true).await.unwrap();

    let err = tree.write_file("/x", b"hi", 0).await.unwrap_err();
    assert_eq!(
        err,
        TreeError::Node(node::Error::remote("Branch ro is read-only"))
    );

    branch.stop().await;
}

#[tokio::test]
async fn test_streaming_roundtrip() {
    let (branch, tree) = single_setup("footest").await;

    // More than two chunks worth of data
    let payload: Vec<u8> = (0..DEFAULT_READ_BUFFER_SIZE * 2 + 123)
        .map(|i| (i % 251) as u8)
        .collect();

    tree.write_from_reader("/streamed", &mut Cursor::new(payload.clone()))
        .await
        .unwrap();
    assert_eq!(std::fs::read(branch.local("streamed")).unwrap(), payload);

    let mut sink = Vec::new();
    tree.read_to_writer("/streamed", &mut sink).await.unwrap();
    assert_eq!(sink, payload);

    // An empty source still produces the destination file
    tree.write_from_reader("/streamed-empty", &mut Cursor::new(Vec::new()))
        .await
        .unwrap();
    assert_eq!(std::fs::read(branch.local("streamed-empty")).unwrap(), b"");

    branch.stop().await;
}

#[tokio::test]
async fn test_write_into_mapped_subpath() {
    init_tracing();

    let branch = TestBranch::start("inner", SECRET, false).await.unwrap();

    let tree = test_tree(SECRET);
    tree.add_branch("inner", &branch.rpc(), "").await.unwrap();
    tree.add_mapping("/mnt", "inner", true).await.unwrap();

    tree.write_file("/mnt/sub/file", b"deep", 0).await.unwrap();
    assert_eq!(std::fs::read(branch.local("sub/file")).unwrap(), b"deep");

    let mut buf = [0u8; 8];
    let n = tree.read_file("/mnt/sub/file", &mut buf, 0).await.unwrap();
    assert_eq!(&buf[..n], b"deep");

    branch.stop().await;
}
