use crate::router::{self, Peer};
use bytes::Bytes;
use model::Error;

/// A handle-scoped streaming writer. Every chunk written lands as one
/// append under the writer's handle, so the chunks of one writer read
/// back contiguously and in order relative to any concurrent writers of
/// the same path.
pub struct FileWriter {
    pub(crate) peer: Peer,
    pub(crate) shard: u64,
    pub(crate) repo: String,
    pub(crate) commit: String,
    pub(crate) path: String,
    pub(crate) handle: String,
}

impl FileWriter {
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Append one chunk. Returns the bytes written; empty chunks are
    /// dropped rather than sent, as they would otherwise read as EOFs.
    pub async fn write(&mut self, chunk: Bytes) -> Result<i64, Error> {
        if chunk.is_empty() {
            return Ok(0);
        }
        let len = chunk.len() as i64;
        let shard = self.shard;
        let repo = self.repo.clone();
        let commit = self.commit.clone();
        let path = self.path.clone();
        let handle = self.handle.clone();
        router::retry(|| {
            let client = self.peer.client.clone();
            let chunk = chunk.clone();
            let repo = repo.clone();
            let commit = commit.clone();
            let path = path.clone();
            let handle = handle.clone();
            async move {
                client
                    .put_file(shard, &repo, &commit, &path, &handle, chunk)
                    .await
            }
        })
        .await?;
        Ok(len)
    }

    /// Seal the writer. Chunks already written are durable; closing is
    /// what ends the handle's group.
    pub async fn close(self) -> Result<(), Error> {
        Ok(())
    }
}
