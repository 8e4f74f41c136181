//! The local per-shard store. A Driver persists repo records, one JSON
//! document per `(repo, commit, shard)` diff, and the append-only block
//! region holding raw file bytes. It knows nothing of commit parents or
//! path semantics; the engine layers those on top.
//!
//! Layout under the root directory:
//! ```text
//! repos/<repo>.json
//! diffs/<shard>/<repo>/<commit>.json
//! blocks/<shard>/<repo>/<commit>/<seq>
//! ```
//! Diff documents are rewritten atomically (temp file + rename), and block
//! bytes are written before the diff record which references them, so a
//! torn append is never observable after a crash.

use bytes::Bytes;
use model::{DiffInfo, Error, RepoRecord};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Driver {
    root: PathBuf,
}

impl Driver {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Driver, Error> {
        let root = root.into();
        for dir in ["repos", "diffs", "blocks"] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        tracing::debug!(root = %root.display(), "opened driver");
        Ok(Driver { root })
    }

    pub async fn create_repo(&self, record: &RepoRecord) -> Result<(), Error> {
        let path = self.repo_path(&record.name);
        write_atomic(&path, &serde_json::to_vec(record).expect("repo records serialize")).await
    }

    pub async fn delete_repo(&self, repo: &str) -> Result<(), Error> {
        remove_file_if_present(&self.repo_path(repo)).await?;

        // Drop the repo's diffs and blocks beneath every shard directory.
        for region in ["diffs", "blocks"] {
            let region = self.root.join(region);
            let mut shards = tokio::fs::read_dir(&region).await?;
            while let Some(shard) = shards.next_entry().await? {
                remove_dir_if_present(&shard.path().join(repo)).await?;
            }
        }
        Ok(())
    }

    pub async fn list_repos(&self) -> Result<Vec<RepoRecord>, Error> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("repos")).await?;
        while let Some(entry) = entries.next_entry().await? {
            // Skip temp files from in-flight atomic writes.
            if entry.path().extension().map_or(true, |e| e != "json") {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            out.push(decode(&entry.path(), &bytes)?);
        }
        Ok(out)
    }

    /// Persist a diff record, creating or replacing it atomically.
    pub async fn write_diff(&self, diff: &DiffInfo) -> Result<(), Error> {
        let path = self.diff_path(&diff.repo, &diff.commit, diff.shard);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, &serde_json::to_vec(diff).expect("diff records serialize")).await
    }

    pub async fn read_diff(
        &self,
        repo: &str,
        commit: &str,
        shard: u64,
    ) -> Result<Option<DiffInfo>, Error> {
        let path = self.diff_path(repo, commit, shard);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(decode(&path, &bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Every persisted diff of one shard, across repos and commits.
    pub async fn list_diffs(&self, shard: u64) -> Result<Vec<DiffInfo>, Error> {
        let shard_dir = self.root.join("diffs").join(shard.to_string());
        let mut out = Vec::new();

        let mut repos = match tokio::fs::read_dir(&shard_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };
        while let Some(repo) = repos.next_entry().await? {
            let mut commits = tokio::fs::read_dir(repo.path()).await?;
            while let Some(commit) = commits.next_entry().await? {
                // Skip temp files from in-flight atomic writes.
                if commit.path().extension().map_or(true, |e| e != "json") {
                    continue;
                }
                let bytes = tokio::fs::read(commit.path()).await?;
                out.push(decode(&commit.path(), &bytes)?);
            }
        }
        Ok(out)
    }

    /// Write one appended chunk into the block region.
    pub async fn put_block(
        &self,
        repo: &str,
        commit: &str,
        shard: u64,
        seq: u64,
        content: &[u8],
    ) -> Result<(), Error> {
        let path = self.block_path(repo, commit, shard, seq);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, content).await
    }

    pub async fn get_block(
        &self,
        repo: &str,
        commit: &str,
        shard: u64,
        seq: u64,
    ) -> Result<Bytes, Error> {
        let bytes = tokio::fs::read(self.block_path(repo, commit, shard, seq)).await?;
        Ok(Bytes::from(bytes))
    }

    fn repo_path(&self, repo: &str) -> PathBuf {
        self.root.join("repos").join(format!("{repo}.json"))
    }

    fn diff_path(&self, repo: &str, commit: &str, shard: u64) -> PathBuf {
        self.root
            .join("diffs")
            .join(shard.to_string())
            .join(repo)
            .join(format!("{commit}.json"))
    }

    fn block_path(&self, repo: &str, commit: &str, shard: u64, seq: u64) -> PathBuf {
        self.root
            .join("blocks")
            .join(shard.to_string())
            .join(repo)
            .join(commit)
            .join(seq.to_string())
    }
}

async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_file_if_present(path: &Path) -> Result<(), Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn remove_dir_if_present(path: &Path) -> Result<(), Error> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(|source| Error::Corrupt {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use model::{AppendRecord, FileDiff, FileType};

    async fn fixture() -> (tempfile::TempDir, Driver) {
        let dir = tempfile::tempdir().unwrap();
        let driver = Driver::open(dir.path()).await.unwrap();
        (dir, driver)
    }

    #[tokio::test]
    async fn test_repo_records_roundtrip() {
        let (_dir, driver) = fixture().await;

        assert!(driver.list_repos().await.unwrap().is_empty());

        driver
            .create_repo(&RepoRecord {
                name: "test".to_string(),
                created: Utc::now(),
            })
            .await
            .unwrap();
        let repos = driver.list_repos().await.unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].name, "test");

        driver.delete_repo("test").await.unwrap();
        assert!(driver.list_repos().await.unwrap().is_empty());
        // Deleting again is a no-op.
        driver.delete_repo("test").await.unwrap();
    }

    #[tokio::test]
    async fn test_diffs_roundtrip_and_list() {
        let (_dir, driver) = fixture().await;

        for (commit, shard) in [("c1", 0), ("c1", 1), ("c2", 0)] {
            let mut diff = DiffInfo::new("test", commit, shard, None, "master", Utc::now());
            let seq = diff.bump();
            diff.files.insert(
                "foo".to_string(),
                FileDiff {
                    file_type: FileType::Regular,
                    seq,
                    appends: vec![AppendRecord {
                        seq,
                        handle: "h".to_string(),
                        len: 4,
                    }],
                },
            );
            driver.write_diff(&diff).await.unwrap();
        }

        let got = driver.read_diff("test", "c1", 0).await.unwrap().unwrap();
        assert_eq!(got.branch, "master");
        assert_eq!(got.files["foo"].appends.len(), 1);
        assert!(driver.read_diff("test", "c9", 0).await.unwrap().is_none());

        assert_eq!(driver.list_diffs(0).await.unwrap().len(), 2);
        assert_eq!(driver.list_diffs(1).await.unwrap().len(), 1);
        assert_eq!(driver.list_diffs(7).await.unwrap().len(), 0);

        // Rewriting a diff replaces, not duplicates.
        let mut diff = driver.read_diff("test", "c1", 0).await.unwrap().unwrap();
        diff.finished = Some(Utc::now());
        driver.write_diff(&diff).await.unwrap();
        assert_eq!(driver.list_diffs(0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_block_region() {
        let (_dir, driver) = fixture().await;

        driver.put_block("test", "c1", 3, 0, b"foo\n").await.unwrap();
        driver.put_block("test", "c1", 3, 1, b"bar\n").await.unwrap();

        assert_eq!(&driver.get_block("test", "c1", 3, 0).await.unwrap()[..], b"foo\n");
        assert_eq!(&driver.get_block("test", "c1", 3, 1).await.unwrap()[..], b"bar\n");
        assert!(driver.get_block("test", "c1", 3, 9).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_repo_drops_diffs_and_blocks() {
        let (_dir, driver) = fixture().await;

        let diff = DiffInfo::new("test", "c1", 0, None, "", Utc::now());
        driver.write_diff(&diff).await.unwrap();
        driver.put_block("test", "c1", 0, 0, b"foo").await.unwrap();

        driver.delete_repo("test").await.unwrap();
        assert!(driver.read_diff("test", "c1", 0).await.unwrap().is_none());
        assert!(driver.get_block("test", "c1", 0, 0).await.is_err());
    }
}
