use crate::{Error, Result, SnapshotRef, Snapshots};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Recording in-memory snapshot capability for tests and local runs.
#[derive(Default)]
pub struct MemorySnapshots {
    inner: Mutex<State>,
    fail_rollback: AtomicBool,
}

#[derive(Default)]
struct State {
    snapshots: Vec<SnapshotRef>,
    rollbacks: Vec<u64>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing snapshot.
    pub fn with_snapshot(self, block_num: u64, hash: &str) -> Self {
        self.inner.lock().unwrap().snapshots.push(SnapshotRef {
            block_num,
            hash: hash.to_string(),
            created_at: Some(Utc::now()),
        });
        self
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.fail_rollback.store(fail, Ordering::SeqCst);
    }

    pub fn rollbacks(&self) -> Vec<u64> {
        self.inner.lock().unwrap().rollbacks.clone()
    }

    pub fn snapshot_blocks(&self) -> Vec<u64> {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .map(|s| s.block_num)
            .collect()
    }
}

#[async_trait]
impl Snapshots for MemorySnapshots {
    async fn create_checkpoint(&self, block_num: u64, hash: &str) -> Result<SnapshotRef> {
        let created = SnapshotRef {
            block_num,
            hash: hash.to_string(),
            created_at: Some(Utc::now()),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.snapshots.retain(|s| s.block_num != block_num);
        inner.snapshots.push(created.clone());
        Ok(created)
    }

    async fn rollback_to_checkpoint(&self, block_num: u64) -> Result<u64> {
        if self.fail_rollback.load(Ordering::SeqCst) {
            return Err(Error::Command {
                status: 1,
                stderr: "injected rollback failure".to_string(),
            });
        }
        let mut inner = self.inner.lock().unwrap();
        let target = inner
            .snapshots
            .iter()
            .filter(|s| s.block_num <= block_num)
            .map(|s| s.block_num)
            .max()
            .ok_or(Error::NoSnapshot(block_num))?;
        inner.rollbacks.push(target);
        Ok(target)
    }

    async fn list(&self) -> Result<Vec<SnapshotRef>> {
        let mut snapshots = self.inner.lock().unwrap().snapshots.clone();
        snapshots.sort_by_key(|s| s.block_num);
        Ok(snapshots)
    }

    async fn clone_checkpoint(&self, block_num: u64, name: &str) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        if !inner.snapshots.iter().any(|s| s.block_num == block_num) {
            return Err(Error::NoSnapshot(block_num));
        }
        Ok(name.to_string())
    }
}
