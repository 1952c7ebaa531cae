use crate::events::{Event, EventBus};
use chrono::{DateTime, Utc};
use graph::{BlockContext, GraphStore, Transformer};
use models::Operation;
use serde::Serialize;
use snapshots::Snapshots;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Write attempts before an item dead-letters.
    pub write_retries: u32,
    /// Base delay for the exponential retry backoff.
    pub retry_base: Duration,
    /// Buffered items per lane before enqueue applies backpressure.
    pub lane_capacity: usize,
    /// Newest dead-letter items retained for the operator.
    pub dead_letter_cap: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            write_retries: 5,
            retry_base: Duration::from_millis(500),
            lane_capacity: 1024,
            dead_letter_cap: 256,
        }
    }
}

/// One unit of replication work within a lane.
#[derive(Debug, Clone)]
enum Item {
    Op(Operation),
    /// Checkpoint boundary: snapshot the store once everything enqueued
    /// before it has been delivered.
    Boundary { block_num: u64, hash: String },
}

/// A lane is the unit of ordering: items for one `(token, fork)` pair are
/// applied strictly in enqueue order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LaneKey {
    token: String,
    fork_hash: String,
}

/// An item that exhausted its retries, kept for operator inspection.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub token: String,
    pub fork_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    pub block_num: u64,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Ordered, retrying delivery of operation batches to the graph store.
///
/// Lanes are created on first use, each served by its own worker task, so
/// ordering holds per `(token, fork)` while lanes proceed independently.
/// Delivery is at-least-once; mutations are keyed so redelivery is
/// idempotent downstream.
#[derive(Clone)]
pub struct ReplicationQueue {
    inner: Arc<Inner>,
}

struct Inner {
    lanes: Mutex<HashMap<LaneKey, mpsc::Sender<Item>>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    graph: Arc<dyn GraphStore>,
    transformer: Arc<dyn Transformer>,
    snapshots: Option<Arc<dyn Snapshots>>,
    events: EventBus,
    dead: Mutex<VecDeque<DeadLetter>>,
    /// Highest index delivered per token, answering `sync_status`.
    delivered: Mutex<HashMap<String, u64>>,
    shutdown: CancellationToken,
    cfg: QueueConfig,
}

impl ReplicationQueue {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        transformer: Arc<dyn Transformer>,
        snapshots: Option<Arc<dyn Snapshots>>,
        events: EventBus,
        cfg: QueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                lanes: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                graph,
                transformer,
                snapshots,
                events,
                dead: Mutex::new(VecDeque::new()),
                delivered: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                cfg,
            }),
        }
    }

    pub async fn enqueue_op(&self, op: Operation) -> anyhow::Result<()> {
        let key = LaneKey {
            token: op.token.clone(),
            fork_hash: op.fork_hash.clone(),
        };
        self.send(key, Item::Op(op)).await
    }

    pub async fn enqueue_boundary(
        &self,
        token: &str,
        fork_hash: &str,
        block_num: u64,
        hash: &str,
    ) -> anyhow::Result<()> {
        let key = LaneKey {
            token: token.to_string(),
            fork_hash: fork_hash.to_string(),
        };
        self.send(
            key,
            Item::Boundary {
                block_num,
                hash: hash.to_string(),
            },
        )
        .await
    }

    async fn send(&self, key: LaneKey, item: Item) -> anyhow::Result<()> {
        if self.inner.shutdown.is_cancelled() {
            anyhow::bail!("replication queue is draining");
        }
        let tx = self.lane(key);
        tx.send(item).await.map_err(|_| {
            anyhow::anyhow!("replication lane closed while enqueueing")
        })
    }

    fn lane(&self, key: LaneKey) -> mpsc::Sender<Item> {
        let mut lanes = self.inner.lanes.lock().unwrap();
        if let Some(tx) = lanes.get(&key) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(self.inner.cfg.lane_capacity);
        let inner = self.inner.clone();
        let worker_key = key.clone();
        let handle = tokio::spawn(async move {
            Inner::worker(inner, worker_key, rx).await;
        });
        self.inner.workers.lock().unwrap().push(handle);
        lanes.insert(key, tx.clone());
        metrics::gauge!("apiary_replication_lanes").set(lanes.len() as f64);
        tx
    }

    /// Forward confirmed checkpoints from the event bus into their lane
    /// as ordering boundaries. Runs until drain or bus close.
    pub fn subscribe_boundaries(&self, bus: &EventBus) {
        let mut rx = bus.subscribe();
        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(Event::CheckpointConfirmed { block_num, hash, token, fork_hash }) => {
                            if let Err(err) = queue
                                .enqueue_boundary(&token, &fork_hash, block_num, &hash)
                                .await
                            {
                                tracing::warn!(%err, block_num, "failed to enqueue checkpoint boundary");
                            }
                        }
                        Ok(_) => (),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "boundary subscriber lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                    _ = shutdown.cancelled() => return,
                }
            }
        });
        self.inner.workers.lock().unwrap().push(handle);
    }

    pub fn last_delivered(&self, token: &str) -> u64 {
        self.inner
            .delivered
            .lock()
            .unwrap()
            .get(token)
            .copied()
            .unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead.lock().unwrap().iter().cloned().collect()
    }

    /// Stop accepting, close every lane, and wait up to `grace` for the
    /// workers to finish what is already queued. Returns whether the
    /// drain completed in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.inner.shutdown.cancel();
        self.inner.lanes.lock().unwrap().clear();

        let workers: Vec<_> = std::mem::take(&mut *self.inner.workers.lock().unwrap());
        let drained = tokio::time::timeout(grace, async {
            for handle in workers {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!("replication queue drain exceeded its grace period");
        }
        drained
    }
}

impl Inner {
    async fn worker(inner: Arc<Inner>, key: LaneKey, mut rx: mpsc::Receiver<Item>) {
        while let Some(item) = rx.recv().await {
            match item {
                Item::Op(op) => Self::deliver(&inner, &key, op).await,
                Item::Boundary { block_num, hash } => {
                    if let Some(snaps) = &inner.snapshots {
                        if let Err(err) = snaps.create_checkpoint(block_num, &hash).await {
                            tracing::warn!(%err, block_num, "boundary snapshot failed");
                        }
                    }
                    metrics::counter!("apiary_boundaries_processed").increment(1);
                }
            }
        }
    }

    /// Deliver one operation, retrying transient failures with
    /// exponential backoff. An exhausted or permanent failure
    /// dead-letters the item; the lane keeps going.
    async fn deliver(inner: &Arc<Inner>, key: &LaneKey, op: Operation) {
        let ctx = BlockContext {
            block: op.block_num,
            hash: None,
            timestamp: Some(op.timestamp),
            replay: false,
        };
        let batch = inner.transformer.transform(std::slice::from_ref(&op), &ctx);

        let mut attempt = 0u32;
        loop {
            match inner.graph.write_batch(batch.clone(), &ctx).await {
                Ok(()) => {
                    let mut delivered = inner.delivered.lock().unwrap();
                    let entry = delivered.entry(key.token.clone()).or_default();
                    *entry = (*entry).max(op.index);
                    metrics::counter!("apiary_ops_replicated").increment(1);
                    return;
                }
                Err(err) if err.is_transient() && attempt < inner.cfg.write_retries => {
                    let delay = inner.cfg.retry_base * 2u32.saturating_pow(attempt);
                    tracing::debug!(%err, attempt, ?delay, "graph write failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(%err, index = op.index, fork_hash = %key.fork_hash, "graph write dead-lettered");
                    Self::dead_letter(inner, key, Some(op.index), op.block_num, &err);
                    return;
                }
            }
        }
    }

    fn dead_letter(
        inner: &Arc<Inner>,
        key: &LaneKey,
        index: Option<u64>,
        block_num: u64,
        err: &graph::Error,
    ) {
        let mut dead = inner.dead.lock().unwrap();
        dead.push_back(DeadLetter {
            token: key.token.clone(),
            fork_hash: key.fork_hash.clone(),
            index,
            block_num,
            error: err.to_string(),
            at: Utc::now(),
        });
        while dead.len() > inner.cfg.dead_letter_cap {
            dead.pop_front();
        }
        metrics::counter!("apiary_replication_dead_letters").increment(1);

        inner.events.emit(Event::ReplicationFailed {
            token: key.token.clone(),
            fork_hash: key.fork_hash.clone(),
            index,
            error: err.to_string(),
        });
    }
}
