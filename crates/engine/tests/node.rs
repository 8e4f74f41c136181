//! Single-node engine tests: the commit state machine, diff persistence,
//! and crash recovery via shard delete/add, exercised without a router.

use bytes::Bytes;
use chrono::Utc;
use engine::{Config, Node};
use model::{CommitType, DiffInfo, Error, Kind, RepoRecord};
use protocol::BlockApi;
use std::sync::Arc;

const SHARDS: u64 = 4;

fn config() -> Config {
    Config {
        file_shards: SHARDS,
        block_shards: 1,
    }
}

async fn node(root: &std::path::Path) -> Arc<Node> {
    let driver = drive::Driver::open(root).await.unwrap();
    let node = Arc::new(Node::new(driver, config()));
    for shard in 0..SHARDS {
        node.add_shard(shard).await.unwrap();
    }
    node
}

async fn start_commit(node: &Node, repo: &str, parent: Option<&str>, branch: &str) -> String {
    let id = model::new_commit_id();
    node.start_commit(repo, &id, parent.map(String::from), branch, Utc::now())
        .await
        .unwrap();
    id
}

async fn put(node: &Node, repo: &str, commit: &str, path: &str, content: &str) {
    let shard = node.hasher().file_shard(repo, path);
    node.put_file(shard, repo, commit, path, "handle", Bytes::from(content.to_string()))
        .await
        .unwrap();
}

async fn get(node: &Node, repo: &str, commit: &str, path: &str) -> String {
    let shard = node.hasher().file_shard(repo, path);
    let content = node
        .get_file(shard, repo, commit, path, 0, 0, None, true)
        .await
        .unwrap();
    String::from_utf8(content.to_vec()).unwrap()
}

async fn create_repo(node: &Node, repo: &str) {
    node.create_repo(RepoRecord {
        name: repo.to_string(),
        created: Utc::now(),
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_block_api() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;

    for commit in ["c1", "c2", "c3"] {
        node.create_diff(DiffInfo::new("blocks", commit, 0, None, "", Utc::now()))
            .await
            .unwrap();
    }
    // Write-once per key.
    let err = node
        .create_diff(DiffInfo::new("blocks", "c1", 0, None, "", Utc::now()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Kind::AlreadyExists);

    use futures::TryStreamExt;
    let diffs: Vec<DiffInfo> = node.list_diff(0).await.unwrap().try_collect().await.unwrap();
    assert_eq!(diffs.len(), 3);

    let diff = node.inspect_diff("blocks", "c2", 0).await.unwrap();
    assert_eq!(diff.commit, "c2");
    assert!(matches!(
        node.inspect_diff("blocks", "c9", 0).await,
        Err(Error::DiffNotFound { .. })
    ));
}

#[tokio::test]
async fn test_commit_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    create_repo(&node, "test").await;

    let c1 = start_commit(&node, "test", None, "").await;
    put(&node, "test", &c1, "foo", "foo\n").await;

    let info = node.inspect_commit("test", &c1).await.unwrap();
    assert_eq!(info.commit_type, CommitType::Write);
    assert!(info.finished.is_none());
    assert_eq!(info.size_bytes, 4);

    node.finish_commit("test", &c1, false).await.unwrap();
    let info = node.inspect_commit("test", &c1).await.unwrap();
    assert_eq!(info.commit_type, CommitType::Read);
    assert!(info.finished.unwrap() >= info.started);

    // A finished commit is immutable.
    let shard = node.hasher().file_shard("test", "foo");
    let err = node
        .put_file(shard, "test", &c1, "foo", "h", Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Kind::FailedPrecondition);
    let err = node.finish_commit("test", &c1, false).await.unwrap_err();
    assert_eq!(err.kind(), Kind::FailedPrecondition);

    assert_eq!(get(&node, "test", &c1, "foo").await, "foo\n");
}

#[tokio::test]
async fn test_start_commit_validation() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    create_repo(&node, "test").await;

    // Unknown repo.
    let err = node
        .start_commit("nope", &model::new_commit_id(), None, "", Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Kind::NotFound);

    // Unknown parent: the DAG is forward-only.
    let err = node
        .start_commit(
            "test",
            &model::new_commit_id(),
            Some(model::new_commit_id()),
            "",
            Utc::now(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Kind::NotFound);

    // A second open commit on one branch.
    let c1 = start_commit(&node, "test", None, "master").await;
    let err = node
        .start_commit("test", &model::new_commit_id(), None, "master", Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Kind::AlreadyExists);

    // Free again once the first finishes.
    node.finish_commit("test", &c1, false).await.unwrap();
    start_commit(&node, "test", Some(&c1), "master").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_finish_waits_for_parent() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    create_repo(&node, "test").await;

    let c1 = start_commit(&node, "test", None, "").await;
    let c2 = start_commit(&node, "test", Some(&c1), "").await;

    let waiter = {
        let node = node.clone();
        let c2 = c2.clone();
        tokio::spawn(async move { node.finish_commit("test", &c2, false).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    assert!(!waiter.is_finished());

    node.finish_commit("test", &c1, false).await.unwrap();
    waiter.await.unwrap().unwrap();

    let info1 = node.inspect_commit("test", &c1).await.unwrap();
    let info2 = node.inspect_commit("test", &c2).await.unwrap();
    assert!(info2.finished.unwrap() >= info1.finished.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_contagion() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    create_repo(&node, "test").await;

    let c1 = start_commit(&node, "test", None, "").await;
    let c2 = start_commit(&node, "test", Some(&c1), "").await;

    let waiter = {
        let node = node.clone();
        let c2 = c2.clone();
        tokio::spawn(async move { node.finish_commit("test", &c2, false).await })
    };
    // Cancelling the parent releases the child, which inherits the flag
    // while still finishing successfully.
    node.finish_commit("test", &c1, true).await.unwrap();
    waiter.await.unwrap().unwrap();

    assert!(node.inspect_commit("test", &c1).await.unwrap().cancelled);
    assert!(node.inspect_commit("test", &c2).await.unwrap().cancelled);

    // Cancellation is sticky and idempotent.
    node.finish_commit("test", &c1, true).await.unwrap();
    assert!(node.inspect_commit("test", &c1).await.unwrap().cancelled);
}

#[tokio::test]
async fn test_delete_recorded_on_every_shard() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    create_repo(&node, "test").await;

    let c1 = start_commit(&node, "test", None, "").await;
    put(&node, "test", &c1, "dir/foo", "foo1").await;
    put(&node, "test", &c1, "dir/bar", "bar1").await;
    node.finish_commit("test", &c1, false).await.unwrap();

    let c2 = start_commit(&node, "test", Some(&c1), "").await;
    node.record_delete("test", &c2, "dir").await.unwrap();
    node.finish_commit("test", &c2, false).await.unwrap();

    for shard in 0..SHARDS {
        let diff = node.inspect_diff("test", &c2, shard).await.unwrap();
        assert!(diff.deletes.contains_key("dir"));
    }
    let files = node
        .list_file("test", &c2, "", None, None, false, true)
        .await
        .unwrap();
    assert!(files.is_empty());
}

#[tokio::test]
async fn test_size_accounting_with_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    create_repo(&node, "test").await;

    let c1 = start_commit(&node, "test", None, "").await;
    put(&node, "test", &c1, "foo", "foofoo").await;
    put(&node, "test", &c1, "bar", "bar").await;
    node.finish_commit("test", &c1, false).await.unwrap();
    assert_eq!(node.inspect_commit("test", &c1).await.unwrap().size_bytes, 9);

    // A delete-only commit carries the covered bytes as negative size.
    let c2 = start_commit(&node, "test", Some(&c1), "").await;
    node.record_delete("test", &c2, "foo").await.unwrap();
    node.finish_commit("test", &c2, false).await.unwrap();
    assert_eq!(node.inspect_commit("test", &c2).await.unwrap().size_bytes, -6);

    // The repo aggregate is the surviving total.
    assert_eq!(node.inspect_repo("test").await.unwrap().size_bytes, 3);
}

#[tokio::test]
async fn test_restart_reindexes_from_diffs() {
    let dir = tempfile::tempdir().unwrap();
    let (c1, c2) = {
        let node = node(dir.path()).await;
        create_repo(&node, "test").await;
        let c1 = start_commit(&node, "test", None, "master").await;
        put(&node, "test", &c1, "foo", "foo\n").await;
        node.finish_commit("test", &c1, false).await.unwrap();
        let c2 = start_commit(&node, "test", Some(&c1), "master").await;
        put(&node, "test", &c2, "foo", "foo\n").await;
        node.finish_commit("test", &c2, false).await.unwrap();
        (c1, c2)
    };

    // A fresh node over the same driver root starts empty and rebuilds
    // everything from persisted diffs on add_shard.
    let node = node(dir.path()).await;

    assert_eq!(get(&node, "test", &c1, "foo").await, "foo\n");
    assert_eq!(get(&node, "test", &c2, "foo").await, "foo\nfoo\n");
    assert_eq!(node.inspect_repo("test").await.unwrap().size_bytes, 8);

    let branches = node.list_branch("test").await.unwrap();
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].branch, "master");
    assert_eq!(branches[0].commit.id, c2);

    // An open commit at crash time is still open.
    let c3 = start_commit(&node, "test", Some(&c2), "").await;
    let node = self::node(dir.path()).await;
    let info = node.inspect_commit("test", &c3).await.unwrap();
    assert_eq!(info.commit_type, CommitType::Write);
    assert!(!info.cancelled);
}

#[tokio::test]
async fn test_delete_shard_drops_indexes_not_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    create_repo(&node, "test").await;

    let c1 = start_commit(&node, "test", None, "").await;
    put(&node, "test", &c1, "foo", "foo\n").await;
    node.finish_commit("test", &c1, false).await.unwrap();

    let shard = node.hasher().file_shard("test", "foo");
    node.delete_shard(shard).await.unwrap();
    let err = node
        .get_file(shard, "test", &c1, "foo", 0, 0, None, true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Kind::Unavailable);

    // Persisted bytes survive; re-adding restores the view.
    node.add_shard(shard).await.unwrap();
    assert_eq!(get(&node, "test", &c1, "foo").await, "foo\n");
}
