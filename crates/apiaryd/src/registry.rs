use chrono::{DateTime, Utc};
use models::Operation;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// FIFO buffer capacity per fork. Overflow drops the oldest entry
    /// while the total operation count keeps incrementing.
    pub buffer_cap: usize,
    /// Cap on distinct forks tracked for one block.
    pub max_forks_per_block: usize,
    /// Forks idle longer than this are deleted by the periodic sweep.
    pub retention: std::time::Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            buffer_cap: models::DEFAULT_FORK_BUFFER,
            max_forks_per_block: models::DEFAULT_MAX_FORKS_PER_BLOCK,
            retention: std::time::Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AppendError {
    #[error("fork limit reached for block {block_num}")]
    ForkLimit { block_num: u64 },
}

/// Why a fork failed checkpoint-boundary validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryReason {
    Empty,
    MissingWriteMarker,
    OpsAfterMarker,
    WrongBlock,
}

impl std::fmt::Display for BoundaryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BoundaryReason::Empty => "empty",
            BoundaryReason::MissingWriteMarker => "missing_write_marker",
            BoundaryReason::OpsAfterMarker => "ops_after_marker",
            BoundaryReason::WrongBlock => "wrong_block",
        };
        f.write_str(name)
    }
}

struct Fork {
    hash: String,
    block_num: u64,
    nodes: HashSet<String>,
    buffer: VecDeque<Operation>,
    op_count: u64,
    /// `(block, index)` of the most recent write-marker.
    last_marker: Option<(u64, u64)>,
    boundary_violated: bool,
    confirmed: bool,
    first_seen: DateTime<Utc>,
    last_update: DateTime<Utc>,
}

impl Fork {
    fn new(hash: String, block_num: u64, now: DateTime<Utc>) -> Self {
        Self {
            hash,
            block_num,
            nodes: HashSet::new(),
            buffer: VecDeque::new(),
            op_count: 0,
            last_marker: None,
            boundary_violated: false,
            confirmed: false,
            first_seen: now,
            last_update: now,
        }
    }
}

/// Read-only view of one fork, for lookups and the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ForkSnapshot {
    pub hash: String,
    pub block_num: u64,
    pub node_count: usize,
    pub buffered: usize,
    pub op_count: u64,
    pub boundary_violated: bool,
    pub confirmed: bool,
    pub first_seen: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// In-memory registry of forks, exclusively owning their state. Nodes and
/// the arbiter refer to forks by hash only.
pub struct ForkRegistry {
    inner: RwLock<Inner>,
    cfg: RegistryConfig,
}

struct Inner {
    forks: HashMap<String, Fork>,
    /// node-id → the fork-hash it most recently appended to.
    active: HashMap<String, String>,
}

impl ForkRegistry {
    pub fn new(cfg: RegistryConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                forks: HashMap::new(),
                active: HashMap::new(),
            }),
            cfg,
        }
    }

    /// Explicitly start a fork and claim it for `node_id`.
    pub fn start_fork(
        &self,
        fork_hash: &str,
        block_num: u64,
        node_id: &str,
    ) -> Result<(), AppendError> {
        let mut inner = self.inner.write().unwrap();
        self.create_if_absent(&mut inner, fork_hash, block_num)?;
        let fork = inner.forks.get_mut(fork_hash).expect("fork just ensured");
        fork.nodes.insert(node_id.to_string());
        inner
            .active
            .insert(node_id.to_string(), fork_hash.to_string());
        Ok(())
    }

    /// Append one operation under the registry's write lock, creating the
    /// fork lazily. Appends never block on network I/O.
    pub fn append(&self, node_id: &str, op: &Operation) -> Result<(), AppendError> {
        let mut inner = self.inner.write().unwrap();
        self.create_if_absent(&mut inner, &op.fork_hash, op.block_num)?;

        let fork = inner.forks.get_mut(&op.fork_hash).expect("fork just ensured");
        fork.nodes.insert(node_id.to_string());

        // A write-marker terminates its block; anything after it (or a
        // marker that does not advance the block) breaks the boundary.
        if let Some((marker_block, _)) = fork.last_marker {
            if !op.kind.is_write_marker() || op.block_num <= marker_block {
                fork.boundary_violated = true;
            }
        }

        fork.buffer.push_back(op.clone());
        if fork.buffer.len() > self.cfg.buffer_cap {
            fork.buffer.pop_front();
        }
        fork.op_count += 1;
        fork.last_update = Utc::now();
        if op.kind.is_write_marker() {
            fork.last_marker = Some((op.block_num, op.index));
        }

        inner
            .active
            .insert(node_id.to_string(), op.fork_hash.clone());
        metrics::counter!("apiary_ops_appended").increment(1);
        Ok(())
    }

    fn create_if_absent(
        &self,
        inner: &mut Inner,
        fork_hash: &str,
        block_num: u64,
    ) -> Result<(), AppendError> {
        if inner.forks.contains_key(fork_hash) {
            return Ok(());
        }
        let same_block = inner
            .forks
            .values()
            .filter(|f| f.block_num == block_num)
            .count();
        if same_block >= self.cfg.max_forks_per_block {
            return Err(AppendError::ForkLimit { block_num });
        }
        inner.forks.insert(
            fork_hash.to_string(),
            Fork::new(fork_hash.to_string(), block_num, Utc::now()),
        );
        Ok(())
    }

    /// Validate a fork against a candidate checkpoint block: the fork must
    /// be non-empty, unviolated, and end with a write-marker for the block
    /// immediately preceding the checkpoint.
    pub fn validate_boundary(
        &self,
        fork_hash: &str,
        checkpoint_block: u64,
    ) -> Result<(), BoundaryReason> {
        let inner = self.inner.read().unwrap();
        let Some(fork) = inner.forks.get(fork_hash) else {
            return Err(BoundaryReason::Empty);
        };
        if fork.op_count == 0 {
            return Err(BoundaryReason::Empty);
        }
        if fork.boundary_violated {
            return Err(BoundaryReason::OpsAfterMarker);
        }
        let Some(last) = fork.buffer.back() else {
            return Err(BoundaryReason::Empty);
        };
        if !last.kind.is_write_marker() {
            return Err(BoundaryReason::MissingWriteMarker);
        }
        if checkpoint_block == 0 || last.block_num != checkpoint_block - 1 {
            return Err(BoundaryReason::WrongBlock);
        }
        Ok(())
    }

    /// Delete every fork for `block_num` other than the winner, clearing
    /// the active-fork pointer of any node that referenced a loser.
    /// Returns the deleted fork hashes.
    pub fn cleanup_for_block(&self, block_num: u64, winner: &str) -> Vec<String> {
        let mut inner = self.inner.write().unwrap();

        let losers: Vec<String> = inner
            .forks
            .values()
            .filter(|f| f.block_num == block_num && f.hash != winner)
            .map(|f| f.hash.clone())
            .collect();

        for hash in &losers {
            inner.forks.remove(hash);
        }
        inner.active.retain(|_, fork_hash| !losers.contains(fork_hash));

        if let Some(win) = inner.forks.get_mut(winner) {
            win.confirmed = true;
        }

        if !losers.is_empty() {
            tracing::info!(block_num, winner, pruned = losers.len(), "pruned losing forks");
            metrics::counter!("apiary_forks_pruned").increment(losers.len() as u64);
        }
        losers
    }

    /// Delete forks idle longer than the retention window.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.cfg.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut inner = self.inner.write().unwrap();

        let stale: Vec<String> = inner
            .forks
            .values()
            .filter(|f| now - f.last_update > retention)
            .map(|f| f.hash.clone())
            .collect();

        for hash in &stale {
            inner.forks.remove(hash);
        }
        inner.active.retain(|_, fork_hash| !stale.contains(fork_hash));

        if !stale.is_empty() {
            tracing::info!(swept = stale.len(), "swept idle forks");
        }
        stale.len()
    }

    pub fn active_fork(&self, node_id: &str) -> Option<String> {
        self.inner.read().unwrap().active.get(node_id).cloned()
    }

    pub fn fork(&self, fork_hash: &str) -> Option<ForkSnapshot> {
        let inner = self.inner.read().unwrap();
        inner.forks.get(fork_hash).map(snapshot)
    }

    pub fn forks(&self) -> Vec<ForkSnapshot> {
        let inner = self.inner.read().unwrap();
        inner.forks.values().map(snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().forks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn snapshot(fork: &Fork) -> ForkSnapshot {
    ForkSnapshot {
        hash: fork.hash.clone(),
        block_num: fork.block_num,
        node_count: fork.nodes.len(),
        buffered: fork.buffer.len(),
        op_count: fork.op_count,
        boundary_violated: fork.boundary_violated,
        confirmed: fork.confirmed,
        first_seen: fork.first_seen,
        last_update: fork.last_update,
    }
}
