use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

mod diff;
mod error;
mod hash;
pub mod path;

pub use diff::{AppendRecord, DiffInfo, FileDiff};
pub use error::{Error, Kind};
pub use hash::{key_hash, Hasher, ShardFilter};

/// Commit identifies one commit of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commit {
    pub repo: String,
    pub id: String,
}

impl Commit {
    pub fn new(repo: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.repo, self.id)
    }
}

/// Allocate a new commit identifier: 32 lowercase hex characters.
pub fn new_commit_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Determine if `s` has the shape of a commit identifier.
/// Branch names are required not to, which makes every reference
/// unambiguously either a commit id or a branch name.
pub fn is_commit_id(s: &str) -> bool {
    s.len() == 32
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Validate a repository name: non-empty, drawn from `[A-Za-z0-9_-]`.
pub fn check_repo_name(name: &str) -> Result<(), Error> {
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(Error::InvalidRepoName(name.to_string()));
    }
    Ok(())
}

/// RepoRecord is the persisted identity of a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRecord {
    pub name: String,
    pub created: DateTime<Utc>,
}

/// RepoInfo is the aggregated view of a repository.
#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub name: String,
    pub created: DateTime<Utc>,
    /// Sum of net-new bytes across finished, non-cancelled commits.
    pub size_bytes: i64,
}

/// The two observable lifecycles of a commit: WRITE while open,
/// READ once finished (or cancelled).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommitType {
    Write,
    Read,
}

/// CommitInfo is the aggregated view of a commit.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub commit: Commit,
    pub branch: String,
    pub parent: Option<Commit>,
    pub commit_type: CommitType,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub cancelled: bool,
    /// Net bytes added by this commit alone. Negative for commits
    /// which delete more than they append.
    pub size_bytes: i64,
}

/// BranchInfo pairs a branch name with its tip commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub branch: String,
    pub commit: Commit,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Regular,
    Directory,
}

/// FileInfo is the merged, cross-shard view of one path within a commit.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub file_type: FileType,
    /// Accumulated bytes for regular files; direct-entry count for directories.
    pub size_bytes: i64,
    /// Newest commit in which the path (or, for directories, anything
    /// beneath it) changed.
    pub commit_modified: Commit,
    /// Start time of `commit_modified`, used to merge shard results.
    pub modified_at: DateTime<Utc>,
    /// Direct children. Populated for directories only.
    pub children: BTreeSet<String>,
}

impl FileInfo {
    /// Fold another shard's view of the same path into this one.
    pub fn merge(&mut self, other: FileInfo) {
        debug_assert_eq!(self.path, other.path);

        if other.file_type == FileType::Directory {
            self.file_type = FileType::Directory;
        }
        if other.modified_at > self.modified_at {
            self.modified_at = other.modified_at;
            self.commit_modified = other.commit_modified;
        }
        self.size_bytes += other.size_bytes;
        self.children.extend(other.children);

        if self.file_type == FileType::Directory {
            self.size_bytes = self.children.len() as i64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_id_shape() {
        let id = new_commit_id();
        assert_eq!(id.len(), 32);
        assert!(is_commit_id(&id));

        assert!(!is_commit_id("master"));
        assert!(!is_commit_id(""));
        // Uppercase hex is not a commit id.
        assert!(!is_commit_id("ABCDEF00112233445566778899AABBCC"));
        // Correct alphabet, wrong length.
        assert!(!is_commit_id("abcdef"));
    }

    #[test]
    fn test_repo_name_validation() {
        assert!(check_repo_name("test").is_ok());
        assert!(check_repo_name("repo_1-a").is_ok());
        assert!(check_repo_name("").is_err());
        assert!(check_repo_name("/repo").is_err());
        assert!(check_repo_name("a/b").is_err());
        assert!(check_repo_name("a b").is_err());
    }
}
