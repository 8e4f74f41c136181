//! The commit engine. A [`Node`] is one server of the deployment: it owns a
//! set of file shards, keeps an in-memory registry of repos and commits
//! rebuilt from persisted diffs on `add_shard`, and serves every per-shard
//! operation of the internal API locally. Cross-commit semantics (the
//! parent-finish barrier, cancellation contagion, materialisation across
//! ancestors) live here; raw persistence lives in the driver.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

use model::{Commit, DiffInfo, Error, Hasher, RepoRecord};

mod commits;
mod files;
mod read;

/// Shard-space configuration of one deployment. Every node and the front
/// API must share one configuration; changing it under existing data is
/// undefined.
#[derive(Debug, Copy, Clone)]
pub struct Config {
    pub file_shards: u64,
    pub block_shards: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file_shards: 32,
            block_shards: 1,
        }
    }
}

impl Config {
    pub fn hasher(&self) -> Hasher {
        Hasher::new(self.file_shards, self.block_shards)
    }
}

/// The terminal state of a commit: reached exactly once, never left.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Terminal {
    pub finished: DateTime<Utc>,
    pub cancelled: bool,
}

/// In-memory registration of one commit. The watch channel holds None while
/// the commit is open and its Terminal once finished or cancelled; waiters
/// (children finishing, blocked listers) subscribe to it.
pub(crate) struct CommitMeta {
    pub repo: String,
    pub id: String,
    pub parent: Option<String>,
    pub branch: String,
    pub started: DateTime<Utc>,
    pub term: watch::Sender<Option<Terminal>>,
}

impl CommitMeta {
    pub fn commit(&self) -> Commit {
        Commit::new(self.repo.clone(), self.id.clone())
    }

    pub fn terminal(&self) -> Option<Terminal> {
        *self.term.borrow()
    }
}

pub(crate) type SharedDiff = Arc<tokio::sync::Mutex<DiffInfo>>;

#[derive(Default)]
pub(crate) struct State {
    shards: BTreeSet<u64>,
    repos: BTreeMap<String, RepoRecord>,
    commits: HashMap<(String, String), Arc<CommitMeta>>,
    diffs: HashMap<(String, String, u64), SharedDiff>,
}

impl State {
    fn meta(&self, repo: &str, id: &str) -> Result<Arc<CommitMeta>, Error> {
        self.commits
            .get(&(repo.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| Error::CommitNotFound(Commit::new(repo, id)))
    }

    /// Register a persisted diff: create the commit's registration if this
    /// is the first shard to surface it, and index the diff.
    fn register(&mut self, diff: DiffInfo) {
        let key = (diff.repo.clone(), diff.commit.clone());

        self.commits.entry(key.clone()).or_insert_with(|| {
            let terminal = match (diff.finished, diff.cancelled) {
                (Some(finished), cancelled) => Some(Terminal {
                    finished,
                    cancelled,
                }),
                // A cancel always stamps a finish time; tolerate records
                // which predate that by falling back to the start time.
                (None, true) => Some(Terminal {
                    finished: diff.started,
                    cancelled: true,
                }),
                (None, false) => None,
            };
            Arc::new(CommitMeta {
                repo: diff.repo.clone(),
                id: diff.commit.clone(),
                parent: diff.parent.clone(),
                branch: diff.branch.clone(),
                started: diff.started,
                term: watch::channel(terminal).0,
            })
        });

        let shard = diff.shard;
        self.diffs.insert(
            (key.0, key.1, shard),
            Arc::new(tokio::sync::Mutex::new(diff)),
        );
    }
}

pub struct Node {
    driver: drive::Driver,
    hasher: Hasher,
    state: RwLock<State>,
    /// Bumped on every local transition to terminal; blocked ListCommit
    /// calls wait for it to advance.
    finish_gen: watch::Sender<u64>,
}

impl Node {
    pub fn new(driver: drive::Driver, config: Config) -> Node {
        Node {
            driver,
            hasher: config.hasher(),
            state: RwLock::new(State::default()),
            finish_gen: watch::channel(0).0,
        }
    }

    pub fn hasher(&self) -> &Hasher {
        &self.hasher
    }

    pub(crate) fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap()
    }

    pub(crate) fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap()
    }

    pub(crate) fn driver(&self) -> &drive::Driver {
        &self.driver
    }

    pub(crate) fn owned_shards(&self) -> Vec<u64> {
        self.read_state().shards.iter().copied().collect()
    }

    /// The ancestor chain of `(repo, id)`, newest first, stopping at the
    /// root or just before `from` when given.
    pub(crate) fn chain(
        &self,
        repo: &str,
        id: &str,
        from: Option<&str>,
    ) -> Result<Vec<Arc<CommitMeta>>, Error> {
        let state = self.read_state();
        let mut out = Vec::new();
        let mut cursor = Some(id.to_string());

        while let Some(cur) = cursor {
            if from == Some(cur.as_str()) {
                break;
            }
            let meta = state.meta(repo, &cur)?;
            cursor = meta.parent.clone();
            out.push(meta);
        }
        Ok(out)
    }

    /// The ancestor chain with each commit's diff for one shard attached.
    pub(crate) fn chain_with_diffs(
        &self,
        repo: &str,
        id: &str,
        shard: u64,
        from: Option<&str>,
    ) -> Result<Vec<(Arc<CommitMeta>, SharedDiff)>, Error> {
        let metas = self.chain(repo, id, from)?;
        let state = self.read_state();
        if !state.shards.contains(&shard) {
            return Err(Error::ShardNotServed(shard));
        }
        metas
            .into_iter()
            .map(|meta| {
                let key = (repo.to_string(), meta.id.clone(), shard);
                let diff = state.diffs.get(&key).cloned().ok_or_else(|| {
                    Error::DiffNotFound {
                        commit: meta.commit(),
                        shard,
                    }
                })?;
                Ok((meta, diff))
            })
            .collect()
    }

    pub async fn add_shard(&self, shard: u64) -> Result<(), Error> {
        let repos = self.driver.list_repos().await?;
        let diffs = self.driver.list_diffs(shard).await?;

        let mut state = self.write_state();
        state.shards.insert(shard);
        for record in repos {
            state.repos.entry(record.name.clone()).or_insert(record);
        }
        let indexed = diffs.len();
        for diff in diffs {
            state.register(diff);
        }
        tracing::info!(shard, indexed, "added shard");
        Ok(())
    }

    pub async fn delete_shard(&self, shard: u64) -> Result<(), Error> {
        let mut state = self.write_state();
        if !state.shards.remove(&shard) {
            return Ok(());
        }
        state.diffs.retain(|(_, _, s), _| *s != shard);

        // Commits with no diff left on this node are forgotten; their
        // waiters, if any, observe a closed channel and fail Cancelled.
        let live: HashSet<(String, String)> = state
            .diffs
            .keys()
            .map(|(repo, id, _)| (repo.clone(), id.clone()))
            .collect();
        state.commits.retain(|key, _| live.contains(key));
        tracing::info!(shard, "deleted shard");
        Ok(())
    }
}

#[async_trait::async_trait]
impl protocol::InternalApi for Node {
    async fn create_repo(&self, record: RepoRecord) -> Result<(), Error> {
        Node::create_repo(self, record).await
    }
    async fn inspect_repo(&self, repo: &str) -> Result<model::RepoInfo, Error> {
        Node::inspect_repo(self, repo).await
    }
    async fn list_repo(&self) -> Result<Vec<model::RepoInfo>, Error> {
        Node::list_repo(self).await
    }
    async fn delete_repo(&self, repo: &str) -> Result<(), Error> {
        Node::delete_repo(self, repo).await
    }

    async fn start_commit(
        &self,
        repo: &str,
        id: &str,
        parent: Option<String>,
        branch: &str,
        started: DateTime<Utc>,
    ) -> Result<(), Error> {
        Node::start_commit(self, repo, id, parent, branch, started).await
    }
    async fn finish_commit(&self, repo: &str, id: &str, cancel: bool) -> Result<(), Error> {
        Node::finish_commit(self, repo, id, cancel).await
    }
    async fn inspect_commit(&self, repo: &str, id: &str) -> Result<model::CommitInfo, Error> {
        Node::inspect_commit(self, repo, id).await
    }
    async fn list_commit(
        &self,
        repos: &[String],
        from: &BTreeMap<String, String>,
        commit_type: Option<model::CommitType>,
        include_cancelled: bool,
    ) -> Result<(u64, Vec<model::CommitInfo>), Error> {
        Node::list_commit(self, repos, from, commit_type, include_cancelled).await
    }
    async fn await_generation(&self, after: u64) -> Result<u64, Error> {
        Node::await_generation(self, after).await
    }
    async fn list_branch(&self, repo: &str) -> Result<Vec<model::BranchInfo>, Error> {
        Node::list_branch(self, repo).await
    }
    async fn resolve_commit(&self, repo: &str, id_or_branch: &str) -> Result<String, Error> {
        Node::resolve_commit(self, repo, id_or_branch)
    }

    async fn put_file(
        &self,
        shard: u64,
        repo: &str,
        commit: &str,
        path: &str,
        handle: &str,
        content: bytes::Bytes,
    ) -> Result<(), Error> {
        Node::put_file(self, shard, repo, commit, path, handle, content).await
    }
    async fn make_directory(
        &self,
        shard: u64,
        repo: &str,
        commit: &str,
        path: &str,
    ) -> Result<(), Error> {
        Node::make_directory(self, shard, repo, commit, path).await
    }
    async fn record_delete(&self, repo: &str, commit: &str, path: &str) -> Result<(), Error> {
        Node::record_delete(self, repo, commit, path).await
    }
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
    ) -> Result<bytes::Bytes, Error> {
        Node::get_file(self, shard, repo, commit, path, offset, size, from, safe).await
    }
    async fn inspect_file(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        from: Option<&str>,
        filter: Option<model::ShardFilter>,
        safe: bool,
    ) -> Result<Option<model::FileInfo>, Error> {
        Node::inspect_file(self, repo, commit, path, from, filter, safe).await
    }
    async fn list_file(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        from: Option<&str>,
        filter: Option<model::ShardFilter>,
        recursive: bool,
        safe: bool,
    ) -> Result<Vec<model::FileInfo>, Error> {
        Node::list_file(self, repo, commit, path, from, filter, recursive, safe).await
    }

    async fn add_shard(&self, shard: u64) -> Result<(), Error> {
        Node::add_shard(self, shard).await
    }
    async fn delete_shard(&self, shard: u64) -> Result<(), Error> {
        Node::delete_shard(self, shard).await
    }
}

#[async_trait::async_trait]
impl protocol::BlockApi for Node {
    async fn create_diff(&self, diff: DiffInfo) -> Result<(), Error> {
        let key = (diff.repo.clone(), diff.commit.clone(), diff.shard);
        let indexed = self.read_state().diffs.contains_key(&key);
        if indexed
            || self
                .driver
                .read_diff(&diff.repo, &diff.commit, diff.shard)
                .await?
                .is_some()
        {
            return Err(Error::DiffExists {
                commit: Commit::new(diff.repo, diff.commit),
                shard: diff.shard,
            });
        }
        self.driver.write_diff(&diff).await?;

        let mut state = self.write_state();
        if state.shards.contains(&diff.shard) {
            state.register(diff);
        }
        Ok(())
    }

    async fn inspect_diff(&self, repo: &str, commit: &str, shard: u64) -> Result<DiffInfo, Error> {
        self.driver
            .read_diff(repo, commit, shard)
            .await?
            .ok_or_else(|| Error::DiffNotFound {
                commit: Commit::new(repo, commit),
                shard,
            })
    }

    async fn list_diff(&self, shard: u64) -> Result<protocol::DiffStream, Error> {
        let diffs = self.driver.list_diffs(shard).await?;
        Ok(Box::pin(futures::stream::iter(diffs.into_iter().map(Ok))))
    }
}
