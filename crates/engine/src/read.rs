//! Materialisation: computing the visible state of paths at a commit by
//! layering each ancestor's diff, honoring in-commit deletes (the per-diff
//! mutation sequence arbitrates delete-vs-append order) and directory
//! tombstones from newer commits, and serialising concurrent writers by
//! handle group.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{CommitMeta, Node, SharedDiff};
use model::{path, AppendRecord, Error, FileType, ShardFilter};

/// One visible path of a shard's materialised state.
#[derive(Debug, Clone)]
pub(crate) struct Vis {
    pub file_type: FileType,
    /// Accumulated surviving bytes (regular files; zero for directories).
    pub size: i64,
    /// Newest commit contributing a surviving record.
    pub modified: String,
    pub modified_at: DateTime<Utc>,
}

/// The surviving content of one regular file: per contributing commit,
/// oldest first, its handle-grouped append records.
#[derive(Debug)]
pub(crate) struct ContentView {
    pub file_type: FileType,
    pub segments: Vec<Segment>,
    pub modified: String,
    pub modified_at: DateTime<Utc>,
    pub total_len: i64,
}

#[derive(Debug)]
pub(crate) struct Segment {
    pub commit: String,
    pub appends: Vec<AppendRecord>,
}

/// Group appends by handle: every handle's chunks stay in send order, and
/// one writer's output is contiguous relative to another's. Groups are
/// ordered by first-append sequence.
pub(crate) fn group_by_handle(appends: Vec<AppendRecord>) -> Vec<AppendRecord> {
    let mut groups: Vec<(String, Vec<AppendRecord>)> = Vec::new();
    for record in appends {
        match groups.iter_mut().find(|(handle, _)| *handle == record.handle) {
            Some((_, group)) => group.push(record),
            None => groups.push((record.handle.clone(), vec![record])),
        }
    }
    groups.into_iter().flat_map(|(_, group)| group).collect()
}

impl Node {
    /// Materialise the content of `path` along a chain (newest first).
    /// Returns None when nothing visible remains.
    pub(crate) async fn file_content(
        &self,
        chain: &[(Arc<CommitMeta>, SharedDiff)],
        path: &str,
    ) -> Result<Option<ContentView>, Error> {
        let mut view: Option<ContentView> = None;

        for (meta, shared) in chain {
            let diff = shared.lock().await;
            let cut = diff.covering_delete(path);

            if let Some(fd) = diff.files.get(path) {
                let survives_cut = |seq: u64| cut.map_or(true, |c| seq > c);
                match fd.file_type {
                    FileType::Directory if survives_cut(fd.seq) => {
                        // A surviving directory entry settles the type,
                        // unless a newer commit already saw it regular.
                        if view.is_none() {
                            view = Some(ContentView {
                                file_type: FileType::Directory,
                                segments: Vec::new(),
                                modified: meta.id.clone(),
                                modified_at: meta.started,
                                total_len: 0,
                            });
                        }
                    }
                    FileType::Directory => (),
                    FileType::Regular => {
                        let kept: Vec<AppendRecord> = fd
                            .appends
                            .iter()
                            .filter(|a| survives_cut(a.seq))
                            .cloned()
                            .collect();
                        if !kept.is_empty() {
                            let view = view.get_or_insert_with(|| ContentView {
                                file_type: FileType::Regular,
                                segments: Vec::new(),
                                modified: meta.id.clone(),
                                modified_at: meta.started,
                                total_len: 0,
                            });
                            if view.file_type == FileType::Regular {
                                view.total_len +=
                                    kept.iter().map(|a| a.len as i64).sum::<i64>();
                                view.segments.push(Segment {
                                    commit: meta.id.clone(),
                                    appends: group_by_handle(kept),
                                });
                            }
                        }
                    }
                }
            }

            // A covering delete truncates the view at this commit.
            if cut.is_some() {
                break;
            }
        }

        if let Some(view) = view.as_mut() {
            // Collected newest-first; content reads oldest-first.
            view.segments.reverse();
        }
        Ok(view)
    }

    /// The complete visible state of one shard along a chain: every path
    /// with a surviving record, with sizes accumulated across commits.
    /// With `skip_unfinished`, diffs of commits which are not yet terminal
    /// are ignored entirely — appends, directory entries, and deletes.
    pub(crate) async fn visible_files(
        &self,
        repo: &str,
        chain: &[(Arc<CommitMeta>, SharedDiff)],
        filter: Option<ShardFilter>,
        skip_unfinished: bool,
    ) -> Result<BTreeMap<String, Vis>, Error> {
        let mut out: BTreeMap<String, Vis> = BTreeMap::new();
        let mut tombstones: Vec<String> = Vec::new();

        for (meta, shared) in chain {
            if skip_unfinished && meta.terminal().is_none() {
                continue;
            }
            let diff = shared.lock().await;

            for (p, fd) in &diff.files {
                if let Some(filter) = filter {
                    if fd.file_type == FileType::Regular && !filter.selects(repo, p) {
                        continue;
                    }
                }
                if tombstones.iter().any(|t| path::covers(t, p)) {
                    continue;
                }
                let cut = diff.covering_delete(p);
                let survives_cut = |seq: u64| cut.map_or(true, |c| seq > c);

                match fd.file_type {
                    FileType::Regular => {
                        let kept: i64 = fd
                            .appends
                            .iter()
                            .filter(|a| survives_cut(a.seq))
                            .map(|a| a.len as i64)
                            .sum();
                        let any = fd.appends.iter().any(|a| survives_cut(a.seq));
                        if !any {
                            continue;
                        }
                        match out.get_mut(p) {
                            // Older appends accumulate beneath the newer view.
                            Some(vis) if vis.file_type == FileType::Regular => {
                                vis.size += kept;
                            }
                            Some(_) => (),
                            None => {
                                out.insert(
                                    p.clone(),
                                    Vis {
                                        file_type: FileType::Regular,
                                        size: kept,
                                        modified: meta.id.clone(),
                                        modified_at: meta.started,
                                    },
                                );
                            }
                        }
                    }
                    FileType::Directory => {
                        if survives_cut(fd.seq) && !out.contains_key(p) {
                            out.insert(
                                p.clone(),
                                Vis {
                                    file_type: FileType::Directory,
                                    size: 0,
                                    modified: meta.id.clone(),
                                    modified_at: meta.started,
                                },
                            );
                        }
                    }
                }
            }

            // This commit's deletes hide matching records of older commits.
            for del in diff.deletes.keys() {
                tombstones.push(del.clone());
            }
        }
        Ok(out)
    }

    /// Net bytes this commit added across the shards this node serves:
    /// surviving appends, minus parent-chain bytes covered by its deletes.
    pub(crate) async fn commit_size(&self, meta: &Arc<CommitMeta>) -> Result<i64, Error> {
        let mut total = 0;
        for shard in self.owned_shards() {
            total += self.shard_commit_size(meta, shard).await?;
        }
        Ok(total)
    }

    async fn shard_commit_size(&self, meta: &Arc<CommitMeta>, shard: u64) -> Result<i64, Error> {
        let shared = {
            let state = self.read_state();
            match state
                .diffs
                .get(&(meta.repo.clone(), meta.id.clone(), shard))
            {
                Some(shared) => shared.clone(),
                None => return Ok(0),
            }
        };

        // Copy what accounting needs, releasing the lock before any walk.
        let (live, deletes) = {
            let diff = shared.lock().await;
            let mut live = 0;
            for (p, fd) in &diff.files {
                let cut = diff.covering_delete(p);
                live += fd
                    .appends
                    .iter()
                    .filter(|a| cut.map_or(true, |c| a.seq > c))
                    .map(|a| a.len as i64)
                    .sum::<i64>();
            }
            let deletes: Vec<String> = diff.deletes.keys().cloned().collect();
            (live, deletes)
        };

        if deletes.is_empty() {
            return Ok(live);
        }
        let Some(parent) = meta.parent.clone() else {
            return Ok(live);
        };

        // Bytes visible at the parent which this commit's deletes cover,
        // each path counted once even under overlapping deletes.
        let chain = self.chain_with_diffs(&meta.repo, &parent, shard, None)?;
        let vis = self.visible_files(&meta.repo, &chain, None, false).await?;
        let covered: i64 = vis
            .iter()
            .filter(|(p, vis)| {
                vis.file_type == FileType::Regular
                    && deletes.iter().any(|del| path::covers(del, p))
            })
            .map(|(_, vis)| vis.size)
            .sum();

        Ok(live - covered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, handle: &str, len: u64) -> AppendRecord {
        AppendRecord {
            seq,
            handle: handle.to_string(),
            len,
        }
    }

    #[test]
    fn test_group_by_handle() {
        // Interleaved writers: each handle's chunks stay in order, and
        // groups are ordered by first-append sequence.
        let grouped = group_by_handle(vec![
            record(0, "h1", 3),
            record(1, "h2", 3),
            record(2, "h1", 3),
        ]);
        let order: Vec<(u64, &str)> = grouped
            .iter()
            .map(|a| (a.seq, a.handle.as_str()))
            .collect();
        assert_eq!(order, vec![(0, "h1"), (2, "h1"), (1, "h2")]);
    }

    #[test]
    fn test_group_by_handle_single_writer() {
        let grouped = group_by_handle(vec![record(0, "h", 1), record(1, "h", 2)]);
        assert_eq!(grouped.len(), 2);
        assert!(grouped.windows(2).all(|w| w[0].seq < w[1].seq));
    }
}
