use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod command;
pub mod memory;

pub use command::{CommandConfig, CommandSnapshots};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no snapshot exists at or below block {0}")]
    NoSnapshot(u64),
    #[error("snapshot command exited with status {status}: {stderr}")]
    Command { status: i32, stderr: String },
    #[error("failed to run snapshot command")]
    Spawn(#[source] std::io::Error),
    #[error("unparseable snapshot listing line: {0:?}")]
    BadListing(String),
}

/// A point-in-time frozen state of the graph store, identified by block
/// number and checkpoint hash.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRef {
    pub block_num: u64,
    pub hash: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// The snapshot/rollback subsystem. Production implementations shell out
/// to filesystem-level snapshot tooling; tests use the in-memory double.
#[async_trait]
pub trait Snapshots: Send + Sync {
    async fn create_checkpoint(&self, block_num: u64, hash: &str) -> Result<SnapshotRef>;

    /// Roll the store back to the newest snapshot at or below `block_num`,
    /// stopping dependent services before the rollback and restarting them
    /// after. Returns the block number actually restored.
    async fn rollback_to_checkpoint(&self, block_num: u64) -> Result<u64>;

    async fn list(&self) -> Result<Vec<SnapshotRef>>;

    async fn clone_checkpoint(&self, block_num: u64, name: &str) -> Result<String>;
}

/// The newest snapshot at or below `block_num`, if any.
pub async fn latest_at_or_below(
    snapshots: &dyn Snapshots,
    block_num: u64,
) -> Result<Option<SnapshotRef>> {
    let mut refs = snapshots.list().await?;
    refs.retain(|s| s.block_num <= block_num);
    refs.sort_by_key(|s| s.block_num);
    Ok(refs.pop())
}
