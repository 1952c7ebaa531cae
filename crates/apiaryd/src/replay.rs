use crate::events::{Event, EventBus};
use anyhow::Context;
use futures::StreamExt;
use graph::{BlockContext, GraphStore, Transformer};
use models::BlockRecord;
use snapshots::Snapshots;
use std::sync::Arc;

/// Outcome of a successful recovery run.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    /// Block the store was rolled back to before replay.
    pub from: u64,
    /// Divergence block replayed through.
    pub to: u64,
    /// Blocks replayed.
    pub count: usize,
    /// `(block, fetched hash)` per replayed block, ascending.
    pub replayed: Vec<(u64, Option<String>)>,
}

/// Restores a consistent downstream state after a confirmed divergence:
/// roll back to the last snapshot, download the canonical blocks from
/// peers, and replay them into the graph store.
pub struct ReplayEngine {
    peers: peers::Client,
    graph: Arc<dyn GraphStore>,
    snapshots: Option<Arc<dyn Snapshots>>,
    transformer: Arc<dyn Transformer>,
    events: EventBus,
    /// Concurrent block downloads.
    concurrency: usize,
}

impl ReplayEngine {
    pub fn new(
        peers: peers::Client,
        graph: Arc<dyn GraphStore>,
        snapshots: Option<Arc<dyn Snapshots>>,
        transformer: Arc<dyn Transformer>,
        events: EventBus,
        concurrency: usize,
    ) -> Self {
        Self {
            peers,
            graph,
            snapshots,
            transformer,
            events,
            concurrency: concurrency.max(1),
        }
    }

    /// Recover from a divergence at `target` whose canonical hash is
    /// `canonical_hash`. `checkpoint_block` is the arbiter's last
    /// trusted confirmation, bounding the rollback.
    ///
    /// Failures leave the store in the rolled-back state; the run is
    /// fatal and an operator may re-trigger it.
    #[tracing::instrument(skip(self), err)]
    pub async fn recover(
        &self,
        checkpoint_block: u64,
        target: u64,
        fork_hash: &str,
        canonical_hash: &str,
    ) -> anyhow::Result<RecoveryOutcome> {
        let result = self
            .run(checkpoint_block, target, canonical_hash)
            .await;

        match &result {
            Ok(outcome) => {
                self.events.emit(Event::RecoveryComplete {
                    from: outcome.from,
                    to: outcome.to,
                    count: outcome.count,
                    canonical_hash: canonical_hash.to_string(),
                });
                metrics::counter!("apiary_recoveries_completed").increment(1);
            }
            Err(err) => {
                self.events.emit(Event::RecoveryFailed {
                    block_num: target,
                    error: format!("{err:#}"),
                });
                metrics::counter!("apiary_recoveries_failed").increment(1);
            }
        }
        result
    }

    async fn run(
        &self,
        checkpoint_block: u64,
        target: u64,
        canonical_hash: &str,
    ) -> anyhow::Result<RecoveryOutcome> {
        let from = match &self.snapshots {
            Some(snaps) => snaps
                .rollback_to_checkpoint(checkpoint_block)
                .await
                .context("rollback failed")?,
            None => checkpoint_block,
        };

        let fetched = self.download(from + 1, target).await?;

        let mut replayed = Vec::with_capacity(fetched.len());
        for record in fetched {
            self.replay_block(&record).await?;
            replayed.push((record.block_num, record.block_hash.clone()));
        }

        // A snapshot of the recovered state, unless one already exists.
        if let Some(snaps) = &self.snapshots {
            let exists = snaps
                .list()
                .await
                .context("listing snapshots")?
                .iter()
                .any(|s| s.block_num == target);
            if !exists {
                snaps
                    .create_checkpoint(target, canonical_hash)
                    .await
                    .context("creating post-recovery snapshot")?;
            }
        }

        Ok(RecoveryOutcome {
            from,
            to: target,
            count: replayed.len(),
            replayed,
        })
    }

    /// Download `[first ..= last]` from peers, `concurrency` at a time,
    /// and return the records sorted ascending by block number.
    async fn download(&self, first: u64, last: u64) -> anyhow::Result<Vec<BlockRecord>> {
        let mut results: Vec<(u64, peers::Result<BlockRecord>)> =
            futures::stream::iter(first..=last)
                .map(|block_num| {
                    let peers = self.peers.clone();
                    async move { (block_num, peers.fetch_block(block_num).await) }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
        results.sort_by_key(|(block_num, _)| *block_num);

        let mut fetched = Vec::with_capacity(results.len());
        let mut missing = 0;
        for (block_num, result) in results {
            match result {
                Ok(record) => fetched.push(record),
                Err(err) => {
                    tracing::warn!(block_num, %err, "canonical block download failed");
                    missing += 1;
                }
            }
        }
        if missing > 0 {
            anyhow::bail!("{missing} of {} canonical blocks unavailable", last - first + 1);
        }
        Ok(fetched)
    }

    async fn replay_block(&self, record: &BlockRecord) -> anyhow::Result<()> {
        let ctx = BlockContext {
            block: record.block_num,
            hash: record.block_hash.clone(),
            timestamp: record.timestamp,
            replay: true,
        };
        let batch = self.transformer.transform(&record.operations, &ctx);
        let op_count = record.operations.len();

        match self.graph.write_batch(batch, &ctx).await {
            Ok(()) => {
                self.events.emit(Event::BlockReplayed {
                    block_num: record.block_num,
                    op_count,
                });
                Ok(())
            }
            Err(err) => {
                self.events.emit(Event::BlockReplayFailed {
                    block_num: record.block_num,
                    error: err.to_string(),
                });
                // No partial commit past this block.
                Err(err).with_context(|| format!("replaying block {}", record.block_num))
            }
        }
    }
}
