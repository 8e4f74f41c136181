//! Per-shard file operations: appends under the diff mutex, directory
//! entries, delete recording, and the read-side assembly of windows,
//! file infos, and directory listings.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::read::Vis;
use crate::{CommitMeta, Node, SharedDiff};
use model::{path, AppendRecord, Commit, Error, FileDiff, FileInfo, FileType, ShardFilter};

impl Node {
    /// Attach one shard's diffs to a resolved ancestor chain.
    fn attach(
        &self,
        metas: &[Arc<CommitMeta>],
        shard: u64,
    ) -> Result<Vec<(Arc<CommitMeta>, SharedDiff)>, Error> {
        let state = self.read_state();
        if !state.shards.contains(&shard) {
            return Err(Error::ShardNotServed(shard));
        }
        metas
            .iter()
            .map(|meta| {
                let key = (meta.repo.clone(), meta.id.clone(), shard);
                let diff = state
                    .diffs
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| Error::DiffNotFound {
                        commit: meta.commit(),
                        shard,
                    })?;
                Ok((meta.clone(), diff))
            })
            .collect()
    }

    pub async fn put_file(
        &self,
        shard: u64,
        repo: &str,
        commit: &str,
        file_path: &str,
        handle: &str,
        content: Bytes,
    ) -> Result<(), Error> {
        let chain = self.chain_with_diffs(repo, commit, shard, None)?;
        let meta = chain[0].0.clone();
        if meta.terminal().is_some() {
            return Err(Error::CommitNotOpen(meta.commit()));
        }
        // The path must not currently materialise as a directory.
        if let Some(view) = self.file_content(&chain, file_path).await? {
            if view.file_type == FileType::Directory {
                return Err(Error::IsDirectory(file_path.to_string()));
            }
        }

        let shared = chain[0].1.clone();
        let mut diff = shared.lock().await;
        if meta.terminal().is_some() {
            return Err(Error::CommitNotOpen(meta.commit()));
        }
        let cut = diff.covering_delete(file_path);
        if let Some(fd) = diff.files.get(file_path) {
            if fd.file_type == FileType::Directory && cut.map_or(true, |c| fd.seq > c) {
                return Err(Error::IsDirectory(file_path.to_string()));
            }
        }

        let seq = diff.bump();
        self.driver()
            .put_block(repo, commit, shard, seq, &content)
            .await?;

        let len = content.len() as u64;
        let fd = diff
            .files
            .entry(file_path.to_string())
            .or_insert_with(|| FileDiff {
                file_type: FileType::Regular,
                seq,
                appends: Vec::new(),
            });
        if fd.file_type == FileType::Directory {
            // A dead directory entry (deleted earlier in this commit) is
            // superseded by the regular file.
            *fd = FileDiff {
                file_type: FileType::Regular,
                seq,
                appends: Vec::new(),
            };
        }
        fd.appends.push(AppendRecord {
            seq,
            handle: handle.to_string(),
            len,
        });
        self.driver().write_diff(&diff).await?;
        Ok(())
    }

    pub async fn make_directory(
        &self,
        shard: u64,
        repo: &str,
        commit: &str,
        file_path: &str,
    ) -> Result<(), Error> {
        let chain = self.chain_with_diffs(repo, commit, shard, None)?;
        let meta = chain[0].0.clone();
        if meta.terminal().is_some() {
            return Err(Error::CommitNotOpen(meta.commit()));
        }
        if let Some(view) = self.file_content(&chain, file_path).await? {
            if view.file_type == FileType::Regular {
                return Err(Error::IsRegularFile(file_path.to_string()));
            }
        }

        let shared = chain[0].1.clone();
        let mut diff = shared.lock().await;
        if meta.terminal().is_some() {
            return Err(Error::CommitNotOpen(meta.commit()));
        }
        let cut = diff.covering_delete(file_path);
        let seq = diff.bump();
        match diff.files.get_mut(file_path) {
            Some(fd) if fd.file_type == FileType::Regular => {
                if fd.appends.iter().any(|a| cut.map_or(true, |c| a.seq > c)) {
                    return Err(Error::IsRegularFile(file_path.to_string()));
                }
                *fd = FileDiff {
                    file_type: FileType::Directory,
                    seq,
                    appends: Vec::new(),
                };
            }
            Some(fd) => fd.seq = seq,
            None => {
                diff.files.insert(
                    file_path.to_string(),
                    FileDiff {
                        file_type: FileType::Directory,
                        seq,
                        appends: Vec::new(),
                    },
                );
            }
        }
        self.driver().write_diff(&diff).await?;
        Ok(())
    }

    /// Record a delete of `file_path` in this commit's diff on every shard
    /// this node serves, so that descendants materialising elsewhere
    /// observe the tombstone locally. Validation that the path exists in
    /// the parent chain happens at the front API, across all nodes.
    pub async fn record_delete(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
    ) -> Result<(), Error> {
        let meta = self.read_state().meta(repo, commit)?;
        if meta.terminal().is_some() {
            return Err(Error::CommitNotOpen(meta.commit()));
        }
        for shard in self.owned_shards() {
            let shared = {
                let state = self.read_state();
                state
                    .diffs
                    .get(&(repo.to_string(), commit.to_string(), shard))
                    .cloned()
            };
            let Some(shared) = shared else { continue };
            let mut diff = shared.lock().await;
            diff.record_delete(file_path);
            self.driver().write_diff(&diff).await?;
        }
        Ok(())
    }

    pub async fn get_file(
        &self,
        shard: u64,
        repo: &str,
        commit: &str,
        file_path: &str,
        offset: i64,
        size: i64,
        from: Option<&str>,
        safe: bool,
    ) -> Result<Bytes, Error> {
        let chain = self.chain_with_diffs(repo, commit, shard, from)?;
        if safe {
            if let Some((meta, _)) = chain.iter().find(|(m, _)| m.terminal().is_none()) {
                return Err(Error::CommitUnfinished(meta.commit()));
            }
        }
        let view = self
            .file_content(&chain, file_path)
            .await?
            .ok_or_else(|| Error::FileNotFound {
                commit: Commit::new(repo, commit),
                path: file_path.to_string(),
            })?;
        if view.file_type == FileType::Directory {
            return Err(Error::IsDirectory(file_path.to_string()));
        }

        // Assemble the requested window. An offset past EOF yields empty
        // content rather than an error.
        let mut skip = offset.max(0) as u64;
        let mut remaining = if size <= 0 { u64::MAX } else { size as u64 };
        let mut out = bytes::BytesMut::new();
        'outer: for segment in &view.segments {
            for record in &segment.appends {
                if remaining == 0 {
                    break 'outer;
                }
                if skip >= record.len {
                    skip -= record.len;
                    continue;
                }
                let block = self
                    .driver()
                    .get_block(repo, &segment.commit, shard, record.seq)
                    .await?;
                let start = skip as usize;
                skip = 0;
                let take = remaining.min((block.len() - start) as u64) as usize;
                out.extend_from_slice(&block[start..start + take]);
                remaining -= take as u64;
            }
        }
        Ok(out.freeze())
    }

    pub async fn inspect_file(
        &self,
        repo: &str,
        commit: &str,
        file_path: &str,
        from: Option<&str>,
        filter: Option<ShardFilter>,
        safe: bool,
    ) -> Result<Option<FileInfo>, Error> {
        let metas = self.chain(repo, commit, from)?;
        if safe {
            if let Some(meta) = metas.iter().find(|m| m.terminal().is_none()) {
                return Err(Error::CommitUnfinished(meta.commit()));
            }
        }
        let owned = self.owned_shards();
        let own_shard = self.hasher().file_shard(repo, file_path);

        // The explicit entry, when this node serves the owning shard.
        let mut info: Option<FileInfo> = None;
        if owned.contains(&own_shard) {
            let chain = self.attach(&metas, own_shard)?;
            if let Some(view) = self.file_content(&chain, file_path).await? {
                let selected = view.file_type == FileType::Directory
                    || filter.map_or(true, |f| f.selects(repo, file_path));
                if selected {
                    info = Some(FileInfo {
                        path: file_path.to_string(),
                        file_type: view.file_type,
                        size_bytes: view.total_len,
                        commit_modified: Commit::new(repo, view.modified),
                        modified_at: view.modified_at,
                        children: BTreeSet::new(),
                    });
                }
            }
        }

        // Children contributed by every served shard make the path a
        // directory even without an explicit entry.
        let mut children = BTreeSet::new();
        let mut newest: Option<(String, DateTime<Utc>)> = None;
        for shard in owned {
            let chain = self.attach(&metas, shard)?;
            let vis = self.visible_files(repo, &chain, filter, false).await?;
            for (q, v) in vis {
                if !path::is_under(file_path, &q) {
                    continue;
                }
                if let Some(child) = path::direct_child(file_path, &q) {
                    children.insert(child.to_string());
                }
                if newest.as_ref().map_or(true, |(_, at)| v.modified_at > *at) {
                    newest = Some((v.modified, v.modified_at));
                }
            }
        }
        if !children.is_empty() {
            let (modified, modified_at) = newest.expect("children imply a contributor");
            let mut fi = match info.take() {
                Some(fi) if fi.file_type == FileType::Directory => fi,
                _ => FileInfo {
                    path: file_path.to_string(),
                    file_type: FileType::Directory,
                    size_bytes: 0,
                    commit_modified: Commit::new(repo, modified.clone()),
                    modified_at,
                    children: BTreeSet::new(),
                },
            };
            if modified_at > fi.modified_at {
                fi.commit_modified = Commit::new(repo, modified);
                fi.modified_at = modified_at;
            }
            fi.children = children;
            fi.size_bytes = fi.children.len() as i64;
            info = Some(fi);
        }
        Ok(info)
    }

    pub async fn list_file(
        &self,
        repo: &str,
        commit: &str,
        dir: &str,
        from: Option<&str>,
        filter: Option<ShardFilter>,
        recursive: bool,
        safe: bool,
    ) -> Result<Vec<FileInfo>, Error> {
        let metas = self.chain(repo, commit, from)?;

        // The safe variant materialises the finished-only view; it does
        // not fail against an open commit.
        let mut vis_all: BTreeMap<String, Vis> = BTreeMap::new();
        for shard in self.owned_shards() {
            let chain = self.attach(&metas, shard)?;
            vis_all.extend(self.visible_files(repo, &chain, filter, safe).await?);
        }

        // Listing a regular file returns the file itself.
        if !dir.is_empty() {
            if let Some(v) = vis_all.get(dir) {
                if v.file_type == FileType::Regular {
                    return Ok(vec![file_info(repo, dir, v)]);
                }
            }
        }

        let mut out: BTreeMap<String, FileInfo> = BTreeMap::new();
        for (q, v) in &vis_all {
            if !path::is_under(dir, q) {
                continue;
            }
            if recursive {
                upsert(&mut out, repo, q, v);
                for a in path::ancestors(q) {
                    if path::is_under(dir, a) {
                        let child = path::direct_child(a, q).expect("q is under a").to_string();
                        upsert_dir(&mut out, repo, a, v).children.insert(child);
                    }
                }
            } else {
                let child = path::direct_child(dir, q).expect("q is under dir");
                if child == q {
                    upsert(&mut out, repo, q, v);
                } else {
                    let grand = path::direct_child(child, q).expect("q is under child").to_string();
                    upsert_dir(&mut out, repo, child, v).children.insert(grand);
                }
            }
        }
        for info in out.values_mut() {
            if info.file_type == FileType::Directory {
                info.size_bytes = info.children.len() as i64;
            }
        }
        Ok(out.into_values().collect())
    }
}

fn file_info(repo: &str, file_path: &str, v: &Vis) -> FileInfo {
    FileInfo {
        path: file_path.to_string(),
        file_type: v.file_type,
        size_bytes: v.size,
        commit_modified: Commit::new(repo, v.modified.clone()),
        modified_at: v.modified_at,
        children: BTreeSet::new(),
    }
}

fn upsert(out: &mut BTreeMap<String, FileInfo>, repo: &str, file_path: &str, v: &Vis) {
    match out.get_mut(file_path) {
        Some(info) => {
            if v.modified_at > info.modified_at {
                info.commit_modified = Commit::new(repo, v.modified.clone());
                info.modified_at = v.modified_at;
            }
        }
        None => {
            out.insert(file_path.to_string(), file_info(repo, file_path, v));
        }
    }
}

fn upsert_dir<'m>(
    out: &'m mut BTreeMap<String, FileInfo>,
    repo: &str,
    dir: &str,
    contributor: &Vis,
) -> &'m mut FileInfo {
    let info = out.entry(dir.to_string()).or_insert_with(|| FileInfo {
        path: dir.to_string(),
        file_type: FileType::Directory,
        size_bytes: 0,
        commit_modified: Commit::new(repo, contributor.modified.clone()),
        modified_at: contributor.modified_at,
        children: BTreeSet::new(),
    });
    info.file_type = FileType::Directory;
    if contributor.modified_at > info.modified_at {
        info.commit_modified = Commit::new(repo, contributor.modified.clone());
        info.modified_at = contributor.modified_at;
    }
    info
}
