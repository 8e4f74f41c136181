use exponential_backoff::Backoff;
use model::{Error, Kind};
use protocol::InternalApi;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One member of the serving topology: an address and a ready client
/// handle for it. The transport behind the handle is interchangeable;
/// in-process nodes and remote stubs route identically.
#[derive(Clone)]
pub struct Peer {
    pub address: String,
    pub client: Arc<dyn InternalApi>,
}

/// Router maps shard IDs onto the members of a static serving topology:
/// peers ordered by index, shard modulo peer count. File shards and block
/// shards are independent spaces routed the same way.
pub struct Router {
    peers: Vec<Peer>,
}

impl Router {
    pub fn new(peers: Vec<Peer>) -> Router {
        assert!(!peers.is_empty(), "a topology has at least one peer");
        Router { peers }
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// The peer owning a file shard.
    pub fn file_peer(&self, shard: u64) -> &Peer {
        &self.peers[(shard % self.peers.len() as u64) as usize]
    }

    /// The peer placing a block shard's records.
    pub fn block_peer(&self, shard: u64) -> &Peer {
        &self.peers[(shard % self.peers.len() as u64) as usize]
    }
}

/// Drive `op`, retrying transient route misses (a node which no longer
/// serves the addressed shard) with bounded exponential backoff. All other
/// errors surface immediately.
pub(crate) async fn retry<T, F, Fut>(op: F) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let backoff = Backoff::new(4, Duration::from_millis(50), Some(Duration::from_secs(1)));
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.kind() == Kind::Unavailable => {
                attempt += 1;
                match backoff.next(attempt) {
                    Some(delay) => {
                        tracing::debug!(%err, attempt, "route miss; retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                }
            }
            result => return result,
        }
    }
}
