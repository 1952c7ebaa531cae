mod cache;
mod client;

pub use cache::BlockCache;
pub use client::{Client, Config, PeerStatus};

use std::sync::Arc;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid peer endpoint: '{0}'")]
    InvalidEndpoint(String),
    #[error("request to peer failed")]
    Request(#[from] reqwest::Error),
    #[error("peer fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("peer returned an invalid block: {0}")]
    InvalidBlock(&'static str),
    #[error("block {0} is unavailable from all configured peers")]
    BlockUnavailable(u64),
    #[error("{0}")]
    Coalesced(Arc<Error>),
}

/// Delay before retrying a failed fetch attempt against one peer.
/// The base delay grows by a linear multiple of the attempt ordinal.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    base * attempt.max(1)
}
