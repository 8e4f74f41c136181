use crate::Commit;

/// Error kinds, mirroring the RPC status codes the front API maps to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Kind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Cancelled,
    Unavailable,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid repo name '{0}'")]
    InvalidRepoName(String),
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("the root directory cannot be addressed directly")]
    RootPath,
    #[error("branch name '{0}' has the shape of a commit id")]
    InvalidBranchName(String),
    #[error("'{0}' is a directory")]
    IsDirectory(String),
    #[error("'{0}' is a regular file")]
    IsRegularFile(String),

    #[error("repo '{0}' not found")]
    RepoNotFound(String),
    #[error("commit {0} not found")]
    CommitNotFound(Commit),
    #[error("branch '{branch}' not found in repo '{repo}'")]
    BranchNotFound { repo: String, branch: String },
    #[error("file '{path}' not found in commit {commit}")]
    FileNotFound { commit: Commit, path: String },
    #[error("no diff for commit {commit} on shard {shard}")]
    DiffNotFound { commit: Commit, shard: u64 },

    #[error("repo '{0}' already exists")]
    RepoExists(String),
    #[error("commit {0} already exists")]
    CommitExists(Commit),
    #[error("branch '{branch}' of repo '{repo}' already has an open commit")]
    BranchBusy { repo: String, branch: String },
    #[error("diff for commit {commit} on shard {shard} already exists")]
    DiffExists { commit: Commit, shard: u64 },

    #[error("commit {0} is not open")]
    CommitNotOpen(Commit),
    #[error("commit {0} is not finished")]
    CommitUnfinished(Commit),
    #[error("'{path}' was created within commit {commit} and cannot be deleted there")]
    FreshDelete { commit: Commit, path: String },
    #[error("deleting commits is not supported")]
    DeleteCommitUnsupported,

    #[error("the operation was cancelled")]
    Cancelled,

    #[error("shard {0} is not served by this node")]
    ShardNotServed(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupt record at '{path}'")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub fn kind(&self) -> Kind {
        use Error::*;
        match self {
            InvalidRepoName(_) | InvalidPath { .. } | RootPath | InvalidBranchName(_)
            | IsDirectory(_) | IsRegularFile(_) => Kind::InvalidArgument,
            RepoNotFound(_) | CommitNotFound(_) | BranchNotFound { .. } | FileNotFound { .. }
            | DiffNotFound { .. } => Kind::NotFound,
            RepoExists(_) | CommitExists(_) | BranchBusy { .. } | DiffExists { .. } => {
                Kind::AlreadyExists
            }
            CommitNotOpen(_) | CommitUnfinished(_) | FreshDelete { .. }
            | DeleteCommitUnsupported => Kind::FailedPrecondition,
            Cancelled => Kind::Cancelled,
            ShardNotServed(_) => Kind::Unavailable,
            Io(_) | Corrupt { .. } => Kind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::RootPath.kind(), Kind::InvalidArgument);
        assert_eq!(
            Error::RepoNotFound("x".to_string()).kind(),
            Kind::NotFound,
        );
        assert_eq!(Error::DeleteCommitUnsupported.kind(), Kind::FailedPrecondition);
        assert_eq!(Error::ShardNotServed(3).kind(), Kind::Unavailable);
    }
}
