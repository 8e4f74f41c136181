//! Service contracts of the filesystem tier.
//!
//! `InternalApi` is the per-node surface: the front API routes every request
//! to owning nodes through it, and a node serves the shards it owns locally.
//! `BlockApi` is the narrower surface over the persisted diff-record store.
//! The RPC transport wrapping these traits is out of scope here; in-process
//! handles and remote stubs are interchangeable behind them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::BTreeMap;

use model::{
    BranchInfo, CommitInfo, CommitType, DiffInfo, Error, FileInfo, RepoInfo, RepoRecord,
    ShardFilter,
};

/// A stream of diff records, as returned by `BlockApi::list_diff`.
pub type DiffStream = BoxStream<'static, Result<DiffInfo, Error>>;

#[async_trait::async_trait]
pub trait InternalApi: Send + Sync {
    // Repositories. Creation and deletion fan out to every node; inspection
    // returns this node's share of the aggregate.
    async fn create_repo(&self, record: RepoRecord) -> Result<(), Error>;
    async fn inspect_repo(&self, repo: &str) -> Result<RepoInfo, Error>;
    async fn list_repo(&self) -> Result<Vec<RepoInfo>, Error>;
    async fn delete_repo(&self, repo: &str) -> Result<(), Error>;

    // Commit lifecycle. The front API allocates the commit id and fans out;
    // each node registers the commit and creates diffs for its shards.
    async fn start_commit(
        &self,
        repo: &str,
        id: &str,
        parent: Option<String>,
        branch: &str,
        started: DateTime<Utc>,
    ) -> Result<(), Error>;
    /// Finish (or, with `cancel`, cancel) an open commit. A plain finish
    /// suspends until the commit's parent is terminal.
    async fn finish_commit(&self, repo: &str, id: &str, cancel: bool) -> Result<(), Error>;
    async fn inspect_commit(&self, repo: &str, id: &str) -> Result<CommitInfo, Error>;
    /// Scan commits. Returns this node's finish generation as observed
    /// before the scan, for use with `await_generation`.
    async fn list_commit(
        &self,
        repos: &[String],
        from: &BTreeMap<String, String>,
        commit_type: Option<CommitType>,
        include_cancelled: bool,
    ) -> Result<(u64, Vec<CommitInfo>), Error>;
    /// Suspend until this node's finish generation exceeds `after`.
    async fn await_generation(&self, after: u64) -> Result<u64, Error>;
    async fn list_branch(&self, repo: &str) -> Result<Vec<BranchInfo>, Error>;
    /// Resolve a commit id or branch name to a commit id.
    async fn resolve_commit(&self, repo: &str, id_or_branch: &str) -> Result<String, Error>;

    // File operations, addressed to the owning file shard — except deletes,
    // which are recorded on every shard so that directory tombstones are
    // visible wherever descendants materialise.
    async fn put_file(
        &self,
        shard: u64,
        repo: &str,
        commit: &str,
        path: &str,
        handle: &str,
        content: Bytes,
    ) -> Result<(), Error>;
    async fn make_directory(
        &self,
        shard: u64,
        repo: &str,
        commit: &str,
        path: &str,
    ) -> Result<(), Error>;
    async fn record_delete(&self, repo: &str, commit: &str, path: &str) -> Result<(), Error>;
    async fn get_file(
        &self,
        shard: u64,
        repo: &str,
        commit: &str,
        path: &str,
        offset: i64,
        size: i64,
        from: Option<&str>,
        safe: bool,
    ) -> Result<Bytes, Error>;
    /// This node's view of `path`: the explicit entry if the owning shard is
    /// served here, merged with children contributed by every served shard.
    async fn inspect_file(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        from: Option<&str>,
        filter: Option<ShardFilter>,
        safe: bool,
    ) -> Result<Option<FileInfo>, Error>;
    async fn list_file(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        from: Option<&str>,
        filter: Option<ShardFilter>,
        recursive: bool,
        safe: bool,
    ) -> Result<Vec<FileInfo>, Error>;

    // Shard lifecycle: the crash-recovery primitives. `add_shard` re-indexes
    // persisted diffs into the in-memory view; `delete_shard` drops indexes
    // without touching persisted bytes.
    async fn add_shard(&self, shard: u64) -> Result<(), Error>;
    async fn delete_shard(&self, shard: u64) -> Result<(), Error>;
}

#[async_trait::async_trait]
pub trait BlockApi: Send + Sync {
    /// Persist a diff record. Write-once per `(repo, commit, shard)`.
    async fn create_diff(&self, diff: DiffInfo) -> Result<(), Error>;
    async fn inspect_diff(&self, repo: &str, commit: &str, shard: u64) -> Result<DiffInfo, Error>;
    async fn list_diff(&self, shard: u64) -> Result<DiffStream, Error>;
}
