//! Shard placement. Two independent hash spaces: file shards route per-path
//! operations to their owning node, block shards place per-commit diff
//! records. Both use a stable non-cryptographic hash so that placement is
//! identical on every node and across restarts.

/// Stable 64-bit hash of a `(repo, key)` pair. Repo names cannot contain
/// `/`, so joining with one is unambiguous.
pub fn key_hash(repo: &str, key: &str) -> u64 {
    let mut h = fxhash::FxHasher64::default();
    std::hash::Hasher::write(&mut h, repo.as_bytes());
    std::hash::Hasher::write(&mut h, b"/");
    std::hash::Hasher::write(&mut h, key.as_bytes());
    std::hash::Hasher::finish(&h)
}

/// Hasher maps repo-scoped keys into the deployment's two shard spaces.
#[derive(Debug, Copy, Clone)]
pub struct Hasher {
    file_modulus: u64,
    block_modulus: u64,
}

impl Hasher {
    pub fn new(file_modulus: u64, block_modulus: u64) -> Hasher {
        assert!(file_modulus > 0 && block_modulus > 0);
        Hasher {
            file_modulus,
            block_modulus,
        }
    }

    pub fn file_shards(&self) -> u64 {
        self.file_modulus
    }

    /// Shard owning all operations on `(repo, path)`.
    pub fn file_shard(&self, repo: &str, path: &str) -> u64 {
        key_hash(repo, path) % self.file_modulus
    }

    /// Shard placing the diff records of `(repo, key)`, where `key` is a
    /// commit id or another piece of per-repo metadata.
    pub fn block_shard(&self, repo: &str, key: &str) -> u64 {
        key_hash(repo, key) % self.block_modulus
    }
}

/// An optional restriction of file operations to one slice of the path
/// space, used by pipeline workers to partition their input. A modulus of
/// zero selects everything.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ShardFilter {
    pub number: u64,
    pub modulus: u64,
}

impl ShardFilter {
    pub fn selects(&self, repo: &str, path: &str) -> bool {
        self.modulus == 0 || key_hash(repo, path) % self.modulus == self.number
    }
}
