use crate::{path, FileType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One appended chunk of a file. The bytes themselves live in the driver's
/// block region under `(repo, commit, shard, seq)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRecord {
    /// Position in the diff's total mutation order.
    pub seq: u64,
    /// Label of the logical write stream this chunk belongs to.
    pub handle: String,
    pub len: u64,
}

/// The per-path portion of a diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub file_type: FileType,
    /// Mutation sequence at which the entry was (last) created.
    /// Arbitrates directory re-creation against covering deletes.
    pub seq: u64,
    pub appends: Vec<AppendRecord>,
}

/// DiffInfo is the atomic unit of writes: everything one commit changed
/// within one shard, plus denormalised commit metadata for recovery.
/// It is write-once for its `(repo, commit, shard)` key, mutated only
/// while the commit is open, and frozen by FinishCommit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffInfo {
    pub repo: String,
    pub commit: String,
    pub shard: u64,

    pub parent: Option<String>,
    pub branch: String,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub cancelled: bool,

    /// Next mutation sequence. Totally orders appends and deletes
    /// within this diff.
    pub next_seq: u64,
    pub files: BTreeMap<String, FileDiff>,
    /// Explicitly deleted paths, each tagged with the sequence at which
    /// the delete landed.
    pub deletes: BTreeMap<String, u64>,
}

impl DiffInfo {
    pub fn new(
        repo: impl Into<String>,
        commit: impl Into<String>,
        shard: u64,
        parent: Option<String>,
        branch: impl Into<String>,
        started: DateTime<Utc>,
    ) -> Self {
        Self {
            repo: repo.into(),
            commit: commit.into(),
            shard,
            parent,
            branch: branch.into(),
            started,
            finished: None,
            cancelled: false,
            next_seq: 0,
            files: BTreeMap::new(),
            deletes: BTreeMap::new(),
        }
    }

    /// Claim the next mutation sequence.
    pub fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// The highest-sequence delete covering `path` (the path itself or an
    /// ancestor directory), if any. Records with a lower sequence are dead;
    /// records with a higher one were written after the delete and live.
    pub fn covering_delete(&self, path: &str) -> Option<u64> {
        self.deletes
            .iter()
            .filter(|(del, _)| path::covers(del, path))
            .map(|(_, seq)| *seq)
            .max()
    }

    /// Record a delete of `path` at the next mutation sequence.
    pub fn record_delete(&mut self, path: &str) {
        let seq = self.bump();
        self.deletes.insert(path.to_string(), seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> DiffInfo {
        DiffInfo::new("test", "c1", 0, None, "", Utc::now())
    }

    #[test]
    fn test_covering_delete() {
        let mut d = fixture();

        assert_eq!(d.covering_delete("dir/foo"), None);

        d.record_delete("dir");
        assert_eq!(d.covering_delete("dir"), Some(0));
        assert_eq!(d.covering_delete("dir/foo"), Some(0));
        assert_eq!(d.covering_delete("dirt"), None);

        // A repeated delete advances the covering sequence.
        d.record_delete("dir/foo");
        d.record_delete("dir");
        assert_eq!(d.covering_delete("dir/foo"), Some(2));
    }

    #[test]
    fn test_sequences_order_appends_against_deletes() {
        let mut d = fixture();

        let before = d.bump();
        d.record_delete("dir");
        let after = d.bump();

        let cut = d.covering_delete("dir/foo").unwrap();
        assert!(before < cut);
        assert!(after > cut);
    }
}
