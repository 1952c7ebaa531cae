use crate::{BlockContext, Error, GraphStore, MutationBatch, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-memory graph store. Stands in for the real store in local runs and
/// tests, applying mutations to a path-keyed document map.
#[derive(Default)]
pub struct MemoryGraph {
    inner: Mutex<State>,
    /// Fail this many upcoming writes with a retryable status.
    fail_next: AtomicUsize,
}

#[derive(Default)]
struct State {
    documents: HashMap<String, Value>,
    /// Every accepted batch, in application order, with its context.
    batches: Vec<(MutationBatch, BlockContext)>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a transient (503) error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn document(&self, path: &str) -> Option<Value> {
        self.inner.lock().unwrap().documents.get(path).cloned()
    }

    pub fn batches(&self) -> Vec<(MutationBatch, BlockContext)> {
        self.inner.lock().unwrap().batches.clone()
    }

    /// Indices delivered for one fork, in application order.
    pub fn delivered_indices(&self, fork: &str) -> Vec<u64> {
        self.inner
            .lock()
            .unwrap()
            .batches
            .iter()
            .flat_map(|(batch, _)| batch.sets.iter().chain(batch.deletes.iter()))
            .filter(|m| m["key"]["fork"].as_str() == Some(fork))
            .filter_map(|m| m["key"]["index"].as_u64())
            .collect()
    }
}

#[async_trait::async_trait]
impl GraphStore for MemoryGraph {
    async fn query(&self, query: &str) -> Result<Value> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .documents
            .get(query)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn write_batch(&self, batch: MutationBatch, ctx: &BlockContext) -> Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Status {
                status: 503,
                body: "injected failure".to_string(),
            });
        }

        let mut inner = self.inner.lock().unwrap();
        for set in &batch.sets {
            if let Some(path) = set["key"]["path"].as_str() {
                inner.documents.insert(path.to_string(), set["data"].clone());
            }
        }
        for delete in &batch.deletes {
            if let Some(path) = delete["key"]["path"].as_str() {
                inner.documents.remove(path);
            }
        }
        inner.batches.push((batch, ctx.clone()));
        Ok(())
    }

    async fn alter(&self, _schema: &str) -> Result<()> {
        Ok(())
    }
}
