//! The public front API. Every operation validates its input, routes to the
//! owning shards through the [`Router`], and merges cross-shard results
//! before returning. Commit and repo mutations fan out to every peer;
//! per-path operations go to the single owning file shard.

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use std::collections::BTreeMap;

use model::{
    is_commit_id, path, BranchInfo, Commit, CommitInfo, CommitType, Error, FileInfo, FileType,
    Hasher, RepoInfo, RepoRecord, ShardFilter,
};

mod router;
mod writer;

pub use router::{Peer, Router};
pub use writer::FileWriter;

pub struct Api {
    hasher: Hasher,
    router: Router,
}

impl Api {
    pub fn new(hasher: Hasher, router: Router) -> Api {
        Api { hasher, router }
    }

    // ---- Repositories ----

    pub async fn create_repo(&self, repo: &str) -> Result<(), Error> {
        model::check_repo_name(repo)?;
        let record = RepoRecord {
            name: repo.to_string(),
            created: Utc::now(),
        };
        let results = futures::future::join_all(
            self.router
                .peers()
                .iter()
                .map(|peer| peer.client.create_repo(record.clone())),
        )
        .await;
        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(())
    }

    pub async fn inspect_repo(&self, repo: &str) -> Result<RepoInfo, Error> {
        let results = futures::future::join_all(
            self.router
                .peers()
                .iter()
                .map(|peer| peer.client.inspect_repo(repo)),
        )
        .await;
        let mut infos = results
            .into_iter()
            .collect::<Result<Vec<RepoInfo>, _>>()?
            .into_iter();
        let mut merged = infos.next().expect("a topology has at least one peer");
        for info in infos {
            merged.size_bytes += info.size_bytes;
        }
        Ok(merged)
    }

    pub async fn list_repo(&self) -> Result<Vec<RepoInfo>, Error> {
        let results = futures::future::join_all(
            self.router
                .peers()
                .iter()
                .map(|peer| peer.client.list_repo()),
        )
        .await;
        let mut merged: BTreeMap<String, RepoInfo> = BTreeMap::new();
        for infos in results.into_iter().collect::<Result<Vec<_>, _>>()? {
            for info in infos {
                match merged.get_mut(&info.name) {
                    Some(existing) => existing.size_bytes += info.size_bytes,
                    None => {
                        merged.insert(info.name.clone(), info);
                    }
                }
            }
        }
        let mut out: Vec<RepoInfo> = merged.into_values().collect();
        out.sort_by(|a, b| b.created.cmp(&a.created).then(b.name.cmp(&a.name)));
        Ok(out)
    }

    pub async fn delete_repo(&self, repo: &str) -> Result<(), Error> {
        let results = futures::future::join_all(
            self.router
                .peers()
                .iter()
                .map(|peer| peer.client.delete_repo(repo)),
        )
        .await;
        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(())
    }

    // ---- Commits ----

    /// Open a commit. `parent` may be empty (the repo root, or the branch
    /// tip when `branch` is given), a commit id, or a branch name whose
    /// finished tip becomes the parent.
    pub async fn start_commit(
        &self,
        repo: &str,
        parent: &str,
        branch: &str,
    ) -> Result<Commit, Error> {
        if !branch.is_empty() && is_commit_id(branch) {
            return Err(Error::InvalidBranchName(branch.to_string()));
        }
        let parent = if parent.is_empty() {
            if branch.is_empty() {
                None
            } else {
                self.branch_tip(repo, branch).await?
            }
        } else if is_commit_id(parent) {
            Some(parent.to_string())
        } else {
            match self.branch_tip(repo, parent).await? {
                Some(tip) => Some(tip),
                None => {
                    return Err(Error::BranchNotFound {
                        repo: repo.to_string(),
                        branch: parent.to_string(),
                    })
                }
            }
        };

        let id = model::new_commit_id();
        let started = Utc::now();
        let results = futures::future::join_all(self.router.peers().iter().map(|peer| {
            peer.client
                .start_commit(repo, &id, parent.clone(), branch, started)
        }))
        .await;
        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(Commit::new(repo, id))
    }

    /// Finish an open commit, blocking until its parent is terminal. If
    /// the parent ended cancelled the commit ends cancelled too, and the
    /// call still succeeds.
    pub async fn finish_commit(&self, repo: &str, commit: &str) -> Result<(), Error> {
        self.terminate_commit(repo, commit, false).await
    }

    /// Cancel an open commit. Idempotent, immediate.
    pub async fn cancel_commit(&self, repo: &str, commit: &str) -> Result<(), Error> {
        self.terminate_commit(repo, commit, true).await
    }

    async fn terminate_commit(&self, repo: &str, commit: &str, cancel: bool) -> Result<(), Error> {
        let id = self.resolve(repo, commit).await?;
        let results = futures::future::join_all(
            self.router
                .peers()
                .iter()
                .map(|peer| peer.client.finish_commit(repo, &id, cancel)),
        )
        .await;
        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(())
    }

    /// Deleting commits is unsupported; the call fails rather than being
    /// silently ignored.
    pub async fn delete_commit(&self, _repo: &str, _commit: &str) -> Result<(), Error> {
        Err(Error::DeleteCommitUnsupported)
    }

    pub async fn inspect_commit(&self, repo: &str, commit: &str) -> Result<CommitInfo, Error> {
        let id = self.resolve(repo, commit).await?;
        let results = futures::future::join_all(
            self.router
                .peers()
                .iter()
                .map(|peer| peer.client.inspect_commit(repo, &id)),
        )
        .await;
        let mut infos = results
            .into_iter()
            .collect::<Result<Vec<CommitInfo>, _>>()?
            .into_iter();
        let mut merged = infos.next().expect("a topology has at least one peer");
        for info in infos {
            merged.size_bytes += info.size_bytes;
            if info.finished > merged.finished {
                merged.finished = info.finished;
            }
            merged.cancelled |= info.cancelled;
        }
        Ok(merged)
    }

    /// List commits of `repos`, optionally restricted to strict descendants
    /// of the index-aligned `from` commits. With `block`, suspend until a
    /// qualifying commit exists.
    pub async fn list_commit(
        &self,
        repos: &[&str],
        from: &[&str],
        commit_type: Option<CommitType>,
        block: bool,
        include_cancelled: bool,
    ) -> Result<Vec<CommitInfo>, Error> {
        let repos: Vec<String> = repos.iter().map(|r| r.to_string()).collect();
        let mut from_map = BTreeMap::new();
        for (repo, from) in repos.iter().zip(from.iter()) {
            from_map.insert(repo.clone(), self.resolve(repo, from).await?);
        }

        loop {
            let results = futures::future::join_all(self.router.peers().iter().map(|peer| {
                peer.client
                    .list_commit(&repos, &from_map, commit_type, include_cancelled)
            }))
            .await;
            let scans = results.into_iter().collect::<Result<Vec<_>, _>>()?;

            let mut generations = Vec::with_capacity(scans.len());
            let mut merged: BTreeMap<(String, String), CommitInfo> = BTreeMap::new();
            for (generation, infos) in scans {
                generations.push(generation);
                for info in infos {
                    let key = (info.commit.repo.clone(), info.commit.id.clone());
                    match merged.get_mut(&key) {
                        Some(existing) => {
                            existing.size_bytes += info.size_bytes;
                            if info.finished > existing.finished {
                                existing.finished = info.finished;
                            }
                            existing.cancelled |= info.cancelled;
                        }
                        None => {
                            merged.insert(key, info);
                        }
                    }
                }
            }

            if !merged.is_empty() || !block {
                let mut out: Vec<CommitInfo> = merged.into_values().collect();
                out.sort_by(|a, b| {
                    b.started
                        .cmp(&a.started)
                        .then_with(|| b.commit.id.cmp(&a.commit.id))
                });
                return Ok(out);
            }

            // Nothing yet: wait for any peer to finish another commit,
            // then rescan.
            let waits: Vec<_> = self
                .router
                .peers()
                .iter()
                .zip(generations)
                .map(|(peer, generation)| {
                    let client = peer.client.clone();
                    Box::pin(async move { client.await_generation(generation).await })
                })
                .collect();
            let (result, _, _) = futures::future::select_all(waits).await;
            result?;
        }
    }

    pub async fn list_branch(&self, repo: &str) -> Result<Vec<BranchInfo>, Error> {
        let shard = self.hasher.block_shard(repo, "");
        self.router.block_peer(shard).client.list_branch(repo).await
    }

    // ---- Files ----

    /// Write a stream of chunks to `path` under one fresh handle: the
    /// stream's content reads back contiguously relative to concurrent
    /// writers. Returns the bytes written.
    pub async fn put_file(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        content: impl futures::Stream<Item = std::io::Result<Bytes>> + Send,
    ) -> Result<i64, Error> {
        let mut writer = self
            .put_file_writer(repo, commit, file_path, "")
            .await?;
        futures::pin_mut!(content);
        let mut written = 0;
        while let Some(chunk) = content.next().await {
            written += writer.write(chunk?).await?;
        }
        writer.close().await?;
        Ok(written)
    }

    /// Write one buffer to `path`.
    pub async fn put_file_bytes(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        content: Bytes,
    ) -> Result<i64, Error> {
        self.put_file(
            repo,
            commit,
            file_path,
            futures::stream::once(async move { Ok(content) }),
        )
        .await
    }

    /// Open a handle-scoped writer. An empty `handle` gets a fresh label.
    pub async fn put_file_writer(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        handle: &str,
    ) -> Result<FileWriter, Error> {
        let id = self.resolve(repo, commit).await?;
        path::check(file_path)?;
        self.check_ancestors_not_files(repo, &id, file_path).await?;

        // Directories are often implicit (synthesised from children on
        // other shards), so the owning node alone cannot reject this.
        if let Some(info) = self
            .inspect_merged(repo, &id, file_path, None, None, false)
            .await?
        {
            if info.file_type == FileType::Directory {
                return Err(Error::IsDirectory(file_path.to_string()));
            }
        }

        let handle = if handle.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            handle.to_string()
        };
        let shard = self.hasher.file_shard(repo, file_path);
        Ok(FileWriter {
            peer: self.router.file_peer(shard).clone(),
            shard,
            repo: repo.to_string(),
            commit: id,
            path: file_path.to_string(),
            handle,
        })
    }

    pub async fn make_directory(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
    ) -> Result<(), Error> {
        let id = self.resolve(repo, commit).await?;
        path::check(file_path)?;
        self.check_ancestors_not_files(repo, &id, file_path).await?;

        let shard = self.hasher.file_shard(repo, file_path);
        let peer = self.router.file_peer(shard);
        router::retry(|| {
            let client = peer.client.clone();
            let id = id.clone();
            async move { client.make_directory(shard, repo, &id, file_path).await }
        })
        .await
    }

    /// Delete `path` within an open commit. Only paths which already exist
    /// in the parent chain may be deleted; a path first created within the
    /// commit itself is rejected.
    pub async fn delete_file(&self, repo: &str, commit: &str, file_path: &str) -> Result<(), Error> {
        let id = self.resolve(repo, commit).await?;
        path::check(file_path)?;

        let shard = self.hasher.block_shard(repo, &id);
        let info = self
            .router
            .block_peer(shard)
            .client
            .inspect_commit(repo, &id)
            .await?;

        let at_parent = match &info.parent {
            Some(parent) => self
                .inspect_merged(repo, &parent.id, file_path, None, None, false)
                .await?
                .is_some(),
            None => false,
        };
        if !at_parent {
            if self
                .inspect_merged(repo, &id, file_path, None, None, false)
                .await?
                .is_some()
            {
                return Err(Error::FreshDelete {
                    commit: Commit::new(repo, id),
                    path: file_path.to_string(),
                });
            }
            return Err(Error::FileNotFound {
                commit: Commit::new(repo, id),
                path: file_path.to_string(),
            });
        }

        let results = futures::future::join_all(
            self.router
                .peers()
                .iter()
                .map(|peer| peer.client.record_delete(repo, &id, file_path)),
        )
        .await;
        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(())
    }

    /// Read a window of `path`. Fails if any commit of the ancestor chain
    /// is still open; `get_file_unsafe` reads through open commits instead.
    pub async fn get_file(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        offset: i64,
        size: i64,
        from: Option<&str>,
        filter: Option<ShardFilter>,
    ) -> Result<Bytes, Error> {
        self.get_file_inner(repo, commit, file_path, offset, size, from, filter, true)
            .await
    }

    pub async fn get_file_unsafe(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        offset: i64,
        size: i64,
        from: Option<&str>,
        filter: Option<ShardFilter>,
    ) -> Result<Bytes, Error> {
        self.get_file_inner(repo, commit, file_path, offset, size, from, filter, false)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn get_file_inner(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        offset: i64,
        size: i64,
        from: Option<&str>,
        filter: Option<ShardFilter>,
        safe: bool,
    ) -> Result<Bytes, Error> {
        let id = self.resolve(repo, commit).await?;
        path::check(file_path)?;
        if let Some(filter) = filter {
            if !filter.selects(repo, file_path) {
                return Err(Error::FileNotFound {
                    commit: Commit::new(repo, id),
                    path: file_path.to_string(),
                });
            }
        }
        let from = match from {
            Some(from) => Some(self.resolve(repo, from).await?),
            None => None,
        };

        let shard = self.hasher.file_shard(repo, file_path);
        let peer = self.router.file_peer(shard);
        router::retry(|| {
            let client = peer.client.clone();
            let id = id.clone();
            let from = from.clone();
            async move {
                client
                    .get_file(shard, repo, &id, file_path, offset, size, from.as_deref(), safe)
                    .await
            }
        })
        .await
    }

    pub async fn inspect_file(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        from: Option<&str>,
        filter: Option<ShardFilter>,
    ) -> Result<FileInfo, Error> {
        self.inspect_file_inner(repo, commit, file_path, from, filter, true)
            .await
    }

    pub async fn inspect_file_unsafe(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        from: Option<&str>,
        filter: Option<ShardFilter>,
    ) -> Result<FileInfo, Error> {
        self.inspect_file_inner(repo, commit, file_path, from, filter, false)
            .await
    }

    async fn inspect_file_inner(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        from: Option<&str>,
        filter: Option<ShardFilter>,
        safe: bool,
    ) -> Result<FileInfo, Error> {
        let id = self.resolve(repo, commit).await?;
        path::check(file_path)?;
        let from = match from {
            Some(from) => Some(self.resolve(repo, from).await?),
            None => None,
        };
        self.inspect_merged(repo, &id, file_path, from.as_deref(), filter, safe)
            .await?
            .ok_or_else(|| Error::FileNotFound {
                commit: Commit::new(repo, id),
                path: file_path.to_string(),
            })
    }

    /// List the entries directly under `path` (or every visible descendant
    /// with `recursive`); the empty path lists the root. The safe variant
    /// materialises the finished-only view and does not fail against an
    /// open commit.
    pub async fn list_file(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        from: Option<&str>,
        filter: Option<ShardFilter>,
        recursive: bool,
    ) -> Result<Vec<FileInfo>, Error> {
        self.list_file_inner(repo, commit, file_path, from, filter, recursive, true)
            .await
    }

    pub async fn list_file_unsafe(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        from: Option<&str>,
        filter: Option<ShardFilter>,
        recursive: bool,
    ) -> Result<Vec<FileInfo>, Error> {
        self.list_file_inner(repo, commit, file_path, from, filter, recursive, false)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn list_file_inner(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        from: Option<&str>,
        filter: Option<ShardFilter>,
        recursive: bool,
        safe: bool,
    ) -> Result<Vec<FileInfo>, Error> {
        let id = self.resolve(repo, commit).await?;
        path::check_listable(file_path)?;
        let from = match from {
            Some(from) => Some(self.resolve(repo, from).await?),
            None => None,
        };

        let results = futures::future::join_all(self.router.peers().iter().map(|peer| {
            peer.client
                .list_file(repo, &id, file_path, from.as_deref(), filter, recursive, safe)
        }))
        .await;
        let mut merged: BTreeMap<String, FileInfo> = BTreeMap::new();
        for infos in results.into_iter().collect::<Result<Vec<_>, _>>()? {
            for info in infos {
                match merged.get_mut(&info.path) {
                    Some(existing) => existing.merge(info),
                    None => {
                        merged.insert(info.path.clone(), info);
                    }
                }
            }
        }

        if merged.is_empty()
            && !file_path.is_empty()
            && self
                .inspect_merged(repo, &id, file_path, from.as_deref(), filter, false)
                .await?
                .is_none()
        {
            return Err(Error::FileNotFound {
                commit: Commit::new(repo, id),
                path: file_path.to_string(),
            });
        }
        Ok(merged.into_values().collect())
    }

    // ---- Helpers ----

    /// Resolve a commit id or branch name to a commit id.
    async fn resolve(&self, repo: &str, commit: &str) -> Result<String, Error> {
        if is_commit_id(commit) {
            return Ok(commit.to_string());
        }
        let shard = self.hasher.block_shard(repo, commit);
        self.router
            .block_peer(shard)
            .client
            .resolve_commit(repo, commit)
            .await
    }

    /// The finished tip of a branch, if the branch exists.
    async fn branch_tip(&self, repo: &str, branch: &str) -> Result<Option<String>, Error> {
        let tips = self.list_branch(repo).await?;
        Ok(tips
            .into_iter()
            .find(|info| info.branch == branch)
            .map(|info| info.commit.id))
    }

    /// The cross-node merged view of one path, None when it is invisible.
    async fn inspect_merged(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        from: Option<&str>,
        filter: Option<ShardFilter>,
        safe: bool,
    ) -> Result<Option<FileInfo>, Error> {
        let results = futures::future::join_all(self.router.peers().iter().map(|peer| {
            peer.client
                .inspect_file(repo, commit, file_path, from, filter, safe)
        }))
        .await;
        let mut merged: Option<FileInfo> = None;
        for info in results
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
        {
            match merged.as_mut() {
                Some(merged) => merged.merge(info),
                None => merged = Some(info),
            }
        }
        Ok(merged)
    }

    /// Writing beneath a path which materialises as a regular file is a
    /// path/type conflict, checked against the in-progress visible state.
    async fn check_ancestors_not_files(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
    ) -> Result<(), Error> {
        for ancestor in path::ancestors(file_path) {
            if let Some(info) = self
                .inspect_merged(repo, commit, ancestor, None, None, false)
                .await?
            {
                if info.file_type == FileType::Regular {
                    return Err(Error::IsRegularFile(ancestor.to_string()));
                }
            }
        }
        Ok(())
    }
}
