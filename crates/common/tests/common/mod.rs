#![allow(dead_code)]

use ::common::testkit::{init_tracing, test_tree, TestBranch};
use ::common::tree::Tree;

pub const SECRET: &str = "123";

/// Two writable branches overlayed at `/`, `foo` before `bar`.
///
/// `foo` holds `test1`/`test2` and `sub1/test3`, `bar` holds a
/// conflicting `test1` plus its own `test4`.
pub async fn overlay_setup() -> (TestBranch, TestBranch, Tree) {
    init_tracing();

    let foo = TestBranch::start("foo", SECRET, false).await.unwrap();
    foo.seed("test1", b"Test1 file");
    foo.seed("test2", b"Test2 file");
    foo.seed("sub1/test3", b"Test3 file content");

    let bar = TestBranch::start("bar", SECRET, false).await.unwrap();
    bar.seed("test1", b"Test3 file");
    bar.seed("test4", b"Test4 file");

    let tree = test_tree(SECRET);
    tree.add_branch("foo", &foo.rpc(), "").await.unwrap();
    tree.add_branch("bar", &bar.rpc(), "").await.unwrap();

    tree.add_mapping("/", "foo", true).await.unwrap();
    tree.add_mapping("/", "bar", true).await.unwrap();

    (foo, bar, tree)
}

/// A single writable branch mapped at `/`.
pub async fn single_setup(name: &str) -> (TestBranch, Tree) {
    init_tracing();

    let branch = TestBranch::start(name, SECRET, false).await.unwrap();

    let tree = test_tree(SECRET);
    tree.add_branch(name, &branch.rpc(), "").await.unwrap();
    tree.add_mapping("/", name, true).await.unwrap();

    (branch, tree)
}

/// Entry names of one listing level, sorted.
pub fn names(infos: &[::common::fileinfo::FileInfo]) -> Vec<String> {
    let mut names: Vec<String> = infos.iter().map(|fi| fi.name.clone()).collect();
    names.sort();
    names
}
