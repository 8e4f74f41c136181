//! Repository and commit lifecycle: registration, the parent-finish
//! barrier, cancellation contagion, and the derived size accounting.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{CommitMeta, Node, Terminal};
use model::{
    is_commit_id, BranchInfo, Commit, CommitInfo, CommitType, DiffInfo, Error, RepoInfo,
    RepoRecord,
};

impl Node {
    pub async fn create_repo(&self, record: RepoRecord) -> Result<(), Error> {
        {
            let mut state = self.write_state();
            if state.repos.contains_key(&record.name) {
                return Err(Error::RepoExists(record.name));
            }
            state.repos.insert(record.name.clone(), record.clone());
        }
        if let Err(err) = self.driver().create_repo(&record).await {
            self.write_state().repos.remove(&record.name);
            return Err(err);
        }
        tracing::debug!(repo = %record.name, "created repo");
        Ok(())
    }

    pub async fn inspect_repo(&self, repo: &str) -> Result<RepoInfo, Error> {
        let (record, metas) = {
            let state = self.read_state();
            let record = state
                .repos
                .get(repo)
                .cloned()
                .ok_or_else(|| Error::RepoNotFound(repo.to_string()))?;
            let metas: Vec<Arc<CommitMeta>> = state
                .commits
                .values()
                .filter(|meta| meta.repo == repo)
                .cloned()
                .collect();
            (record, metas)
        };

        let mut size_bytes = 0;
        for meta in metas {
            match meta.terminal() {
                Some(term) if !term.cancelled => {
                    size_bytes += self.commit_size(&meta).await?;
                }
                _ => (),
            }
        }
        Ok(RepoInfo {
            name: record.name,
            created: record.created,
            size_bytes,
        })
    }

    pub async fn list_repo(&self) -> Result<Vec<RepoInfo>, Error> {
        let names: Vec<String> = self.read_state().repos.keys().cloned().collect();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(self.inspect_repo(&name).await?);
        }
        Ok(out)
    }

    pub async fn delete_repo(&self, repo: &str) -> Result<(), Error> {
        {
            let mut state = self.write_state();
            if state.repos.remove(repo).is_none() {
                return Err(Error::RepoNotFound(repo.to_string()));
            }
            state.commits.retain(|(r, _), _| r != repo);
            state.diffs.retain(|(r, _, _), _| r != repo);
        }
        self.driver().delete_repo(repo).await?;
        tracing::debug!(repo, "deleted repo");
        Ok(())
    }

    pub async fn start_commit(
        &self,
        repo: &str,
        id: &str,
        parent: Option<String>,
        branch: &str,
        started: DateTime<Utc>,
    ) -> Result<(), Error> {
        let owned = {
            let state = self.read_state();
            check_start(&state, repo, id, parent.as_deref(), branch)?;
            state.shards.iter().copied().collect::<Vec<u64>>()
        };

        // Persist an empty diff on every owned shard before registering, so
        // that a crash between the two leaves a recoverable open commit.
        let mut diffs = Vec::with_capacity(owned.len());
        for shard in owned {
            let diff = DiffInfo::new(repo, id, shard, parent.clone(), branch, started);
            self.driver().write_diff(&diff).await?;
            diffs.push(diff);
        }

        let mut state = self.write_state();
        check_start(&state, repo, id, parent.as_deref(), branch)?;
        for diff in diffs {
            state.register(diff);
        }
        tracing::debug!(repo, id, branch, "started commit");
        Ok(())
    }

    /// Finish an open commit, or cancel it when `cancel` is set. A plain
    /// finish suspends until the parent is terminal and inherits its
    /// cancellation; the call still succeeds in that case.
    pub async fn finish_commit(&self, repo: &str, id: &str, cancel: bool) -> Result<(), Error> {
        let meta = self.read_state().meta(repo, id)?;

        match meta.terminal() {
            Some(term) if cancel && term.cancelled => return Ok(()),
            Some(_) => return Err(Error::CommitNotOpen(meta.commit())),
            None => (),
        }

        let terminal = if cancel {
            Terminal {
                finished: Utc::now(),
                cancelled: true,
            }
        } else {
            let parent = match &meta.parent {
                Some(pid) => Some(self.await_terminal(repo, pid).await?),
                None => None,
            };
            let mut finished = Utc::now();
            if let Some(parent) = parent {
                // A child is never visibly finished before its parent.
                finished = finished.max(parent.finished);
            }
            Terminal {
                finished,
                cancelled: parent.map_or(false, |p| p.cancelled),
            }
        };

        // Freeze this node's diffs before waking anyone.
        let shared: Vec<crate::SharedDiff> = {
            let state = self.read_state();
            state
                .diffs
                .iter()
                .filter(|((r, c, _), _)| r == repo && c == id)
                .map(|(_, diff)| diff.clone())
                .collect()
        };
        for diff in shared {
            let mut diff = diff.lock().await;
            diff.finished = Some(terminal.finished);
            diff.cancelled = terminal.cancelled;
            self.driver().write_diff(&diff).await?;
        }

        let mut first = false;
        meta.term.send_modify(|t| {
            if t.is_none() {
                *t = Some(terminal);
                first = true;
            }
        });
        if first {
            self.finish_gen.send_modify(|g| *g += 1);
            tracing::debug!(repo, id, cancelled = terminal.cancelled, "commit became terminal");
        }
        Ok(())
    }

    /// Suspend until `(repo, id)` reaches its terminal state.
    async fn await_terminal(&self, repo: &str, id: &str) -> Result<Terminal, Error> {
        let meta = self.read_state().meta(repo, id)?;
        let mut rx = meta.term.subscribe();
        loop {
            if let Some(term) = *rx.borrow_and_update() {
                return Ok(term);
            }
            rx.changed().await.map_err(|_| Error::Cancelled)?;
        }
    }

    pub async fn inspect_commit(&self, repo: &str, id: &str) -> Result<CommitInfo, Error> {
        let meta = self.read_state().meta(repo, id)?;
        let size_bytes = self.commit_size(&meta).await?;
        Ok(self.commit_info(&meta, size_bytes))
    }

    fn commit_info(&self, meta: &CommitMeta, size_bytes: i64) -> CommitInfo {
        let term = meta.terminal();
        CommitInfo {
            commit: meta.commit(),
            branch: meta.branch.clone(),
            parent: meta
                .parent
                .as_ref()
                .map(|pid| Commit::new(meta.repo.clone(), pid.clone())),
            commit_type: if term.is_some() {
                CommitType::Read
            } else {
                CommitType::Write
            },
            started: meta.started,
            finished: term.map(|t| t.finished),
            cancelled: term.map_or(false, |t| t.cancelled),
            size_bytes,
        }
    }

    pub async fn list_commit(
        &self,
        repos: &[String],
        from: &BTreeMap<String, String>,
        commit_type: Option<CommitType>,
        include_cancelled: bool,
    ) -> Result<(u64, Vec<CommitInfo>), Error> {
        let generation = *self.finish_gen.borrow();

        let metas = {
            let state = self.read_state();
            for repo in repos {
                if !state.repos.contains_key(repo) {
                    return Err(Error::RepoNotFound(repo.clone()));
                }
            }
            let mut metas = Vec::new();
            for meta in state.commits.values() {
                if !repos.iter().any(|r| *r == meta.repo) {
                    continue;
                }
                let term = meta.terminal();
                if term.map_or(false, |t| t.cancelled) && !include_cancelled {
                    continue;
                }
                match commit_type {
                    Some(CommitType::Write) if term.is_some() => continue,
                    Some(CommitType::Read) if term.is_none() => continue,
                    _ => (),
                }
                if let Some(ancestor) = from.get(&meta.repo) {
                    if !is_strict_descendant(&state, meta, ancestor) {
                        continue;
                    }
                }
                metas.push(meta.clone());
            }
            metas
        };

        let mut out = Vec::with_capacity(metas.len());
        for meta in metas {
            let size_bytes = self.commit_size(&meta).await?;
            out.push(self.commit_info(&meta, size_bytes));
        }
        Ok((generation, out))
    }

    pub async fn await_generation(&self, after: u64) -> Result<u64, Error> {
        let mut rx = self.finish_gen.subscribe();
        loop {
            let generation = *rx.borrow_and_update();
            if generation > after {
                return Ok(generation);
            }
            rx.changed().await.map_err(|_| Error::Cancelled)?;
        }
    }

    pub async fn list_branch(&self, repo: &str) -> Result<Vec<BranchInfo>, Error> {
        let state = self.read_state();
        if !state.repos.contains_key(repo) {
            return Err(Error::RepoNotFound(repo.to_string()));
        }

        // One entry per branch name: the newest finished, non-cancelled
        // commit opened under it.
        let mut tips: BTreeMap<&str, &Arc<CommitMeta>> = BTreeMap::new();
        for meta in state.commits.values() {
            if meta.repo != repo || meta.branch.is_empty() {
                continue;
            }
            match meta.terminal() {
                Some(term) if !term.cancelled => (),
                _ => continue,
            }
            match tips.get(meta.branch.as_str()) {
                Some(cur) if cur.started >= meta.started => (),
                _ => {
                    tips.insert(&meta.branch, meta);
                }
            }
        }

        let mut out: Vec<(DateTime<Utc>, BranchInfo)> = tips
            .into_values()
            .map(|meta| {
                (
                    meta.started,
                    BranchInfo {
                        branch: meta.branch.clone(),
                        commit: meta.commit(),
                    },
                )
            })
            .collect();
        out.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(out.into_iter().map(|(_, info)| info).collect())
    }

    /// Resolve a commit id or branch name to a commit id. Branch names
    /// resolve to the newest non-cancelled commit opened under the name —
    /// the open commit while one exists.
    pub fn resolve_commit(&self, repo: &str, id_or_branch: &str) -> Result<String, Error> {
        if is_commit_id(id_or_branch) {
            return Ok(id_or_branch.to_string());
        }
        let state = self.read_state();
        state
            .commits
            .values()
            .filter(|meta| {
                meta.repo == repo
                    && meta.branch == id_or_branch
                    && !meta.terminal().map_or(false, |t| t.cancelled)
            })
            .max_by_key(|meta| meta.started)
            .map(|meta| meta.id.clone())
            .ok_or_else(|| Error::BranchNotFound {
                repo: repo.to_string(),
                branch: id_or_branch.to_string(),
            })
    }
}

fn check_start(
    state: &crate::State,
    repo: &str,
    id: &str,
    parent: Option<&str>,
    branch: &str,
) -> Result<(), Error> {
    if !state.repos.contains_key(repo) {
        return Err(Error::RepoNotFound(repo.to_string()));
    }
    if state.commits.contains_key(&(repo.to_string(), id.to_string())) {
        return Err(Error::CommitExists(Commit::new(repo, id)));
    }
    // Forward-only DAG: the parent must already be registered.
    if let Some(parent) = parent {
        state.meta(repo, parent)?;
    }
    if !branch.is_empty() {
        let busy = state.commits.values().any(|meta| {
            meta.repo == repo && meta.branch == branch && meta.terminal().is_none()
        });
        if busy {
            return Err(Error::BranchBusy {
                repo: repo.to_string(),
                branch: branch.to_string(),
            });
        }
    }
    Ok(())
}

fn is_strict_descendant(state: &crate::State, meta: &Arc<CommitMeta>, ancestor: &str) -> bool {
    let mut cursor = meta.parent.clone();
    while let Some(cur) = cursor {
        if cur == ancestor {
            return true;
        }
        cursor = match state.commits.get(&(meta.repo.clone(), cur)) {
            Some(parent) => parent.parent.clone(),
            None => return false,
        };
    }
    false
}
