use crate::events::{Event, EventBus};
use crate::registry::ForkRegistry;
use crate::replay::ReplayEngine;
use models::Checkpoint;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A confirmed block-terminal hash. Immutable once set, except through
/// recovery, which erases confirmations above the rollback point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Confirmed {
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
}

/// How the arbiter disposed of one checkpoint report.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointOutcome {
    Confirmed,
    /// The same hash was already confirmed for this block.
    AlreadyConfirmed,
    Invalid(crate::registry::BoundaryReason),
    /// A different hash is already confirmed for this block; refused.
    Conflict,
    RecoveryFailed,
}

impl CheckpointOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            CheckpointOutcome::Confirmed | CheckpointOutcome::AlreadyConfirmed
        )
    }
}

/// Consumes checkpoint reports, maintains the confirmed-checkpoint
/// history, detects divergence, and drives recovery.
///
/// Reports are processed strictly one at a time: confirmation of block
/// N+1 waits for any recovery triggered at block N to return.
pub struct CheckpointArbiter {
    confirmed: Mutex<BTreeMap<u64, Confirmed>>,
    sequencer: tokio::sync::Mutex<()>,
    registry: Arc<ForkRegistry>,
    replay: Arc<ReplayEngine>,
    events: EventBus,
}

impl CheckpointArbiter {
    pub fn new(registry: Arc<ForkRegistry>, replay: Arc<ReplayEngine>, events: EventBus) -> Self {
        Self {
            confirmed: Mutex::new(BTreeMap::new()),
            sequencer: tokio::sync::Mutex::new(()),
            registry,
            replay,
            events,
        }
    }

    /// Seed a confirmed checkpoint, bypassing validation. For bootstrap
    /// from a persisted head and for tests.
    pub fn preload(&self, block_num: u64, hash: &str, prev: Option<&str>) {
        self.confirmed.lock().unwrap().insert(
            block_num,
            Confirmed {
                hash: hash.to_string(),
                prev: prev.map(str::to_string),
            },
        );
    }

    pub fn confirmed(&self, block_num: u64) -> Option<Confirmed> {
        self.confirmed.lock().unwrap().get(&block_num).cloned()
    }

    pub fn last_confirmed(&self) -> Option<(u64, Confirmed)> {
        self.confirmed
            .lock()
            .unwrap()
            .iter()
            .next_back()
            .map(|(block_num, confirmed)| (*block_num, confirmed.clone()))
    }

    #[tracing::instrument(skip(self, cp), fields(block_num = cp.block_num, hash = %cp.hash, node_id = %cp.node_id))]
    pub async fn handle_checkpoint(&self, cp: &Checkpoint) -> CheckpointOutcome {
        let _seq = self.sequencer.lock().await;

        // Revalidate the boundary of the fork this checkpoint closes.
        // A checkpoint may legitimately reference a fork we never saw
        // operations for (a recovering peer); only known forks validate.
        if let Some(fork_hash) = &cp.prev_hash {
            if self.registry.fork(fork_hash).is_some() {
                if let Err(reason) = self.registry.validate_boundary(fork_hash, cp.block_num) {
                    tracing::warn!(%reason, fork_hash, "checkpoint failed boundary validation");
                    self.events.emit(Event::CheckpointInvalid {
                        reason,
                        fork_hash: fork_hash.clone(),
                        block_num: cp.block_num,
                        node_id: cp.node_id.clone(),
                    });
                    return CheckpointOutcome::Invalid(reason);
                }
            }
        }

        // Divergence: the reported predecessor disagrees with our
        // confirmed history.
        if let Some(divergence_base) = self.divergence_base(cp) {
            let fork_hash = cp.prev_hash.clone().unwrap_or_default();
            self.events.emit(Event::ForkDetected {
                block_num: cp.block_num,
                canonical_hash: cp.hash.clone(),
                fork_hash: fork_hash.clone(),
                node_id: cp.node_id.clone(),
            });
            metrics::counter!("apiary_forks_detected").increment(1);

            match self
                .replay
                .recover(divergence_base, cp.block_num, &fork_hash, &cp.hash)
                .await
            {
                Ok(outcome) => self.apply_recovery(&outcome),
                Err(err) => {
                    tracing::error!(%err, "recovery failed; confirmed state unchanged");
                    self.events.emit(Event::ForkRecoveryFailed {
                        block_num: cp.block_num,
                        error: format!("{err:#}"),
                    });
                    return CheckpointOutcome::RecoveryFailed;
                }
            }
        }

        // Confirm. A differing existing hash is a protocol violation and
        // is refused rather than overwritten.
        {
            let mut confirmed = self.confirmed.lock().unwrap();
            match confirmed.get(&cp.block_num) {
                Some(existing) if existing.hash == cp.hash => {
                    return CheckpointOutcome::AlreadyConfirmed;
                }
                Some(existing) => {
                    tracing::warn!(
                        existing = %existing.hash,
                        offered = %cp.hash,
                        "conflicting checkpoint refused"
                    );
                    self.events.emit(Event::CheckpointConflict {
                        block_num: cp.block_num,
                        existing: existing.hash.clone(),
                        offered: cp.hash.clone(),
                    });
                    return CheckpointOutcome::Conflict;
                }
                None => {
                    confirmed.insert(
                        cp.block_num,
                        Confirmed {
                            hash: cp.hash.clone(),
                            prev: cp.prev_hash.clone(),
                        },
                    );
                }
            }
        }

        // The fork race this checkpoint settles is over the preceding
        // block's operations: its prev-hash names the winner.
        if let (Some(winner), Some(prev_block)) =
            (&cp.prev_hash, cp.block_num.checked_sub(1))
        {
            self.registry.cleanup_for_block(prev_block, winner);
        }

        metrics::counter!("apiary_checkpoints_confirmed").increment(1);
        self.events.emit(Event::CheckpointConfirmed {
            block_num: cp.block_num,
            hash: cp.hash.clone(),
            token: cp.token.clone(),
            fork_hash: cp.prev_hash.clone().unwrap_or_default(),
        });
        CheckpointOutcome::Confirmed
    }

    /// If `cp` diverges from the confirmed history, the block to bound
    /// the rollback: our newest confirmation strictly below the report.
    fn divergence_base(&self, cp: &Checkpoint) -> Option<u64> {
        let prev_hash = cp.prev_hash.as_ref()?;
        let confirmed = self.confirmed.lock().unwrap();

        let prev_block = cp.block_num.checked_sub(1)?;
        let existing = confirmed.get(&prev_block)?;
        if existing.hash == *prev_hash {
            return None;
        }
        Some(prev_block)
    }

    /// Adopt a completed recovery: confirmations above the rollback point
    /// are erased, then replaced by the hashes of the replayed canonical
    /// blocks. The divergence block itself is confirmed by the caller.
    fn apply_recovery(&self, outcome: &crate::replay::RecoveryOutcome) {
        let mut confirmed = self.confirmed.lock().unwrap();
        confirmed.split_off(&(outcome.from + 1));

        for (block_num, hash) in &outcome.replayed {
            if *block_num == outcome.to {
                continue;
            }
            if let Some(hash) = hash {
                confirmed.insert(
                    *block_num,
                    Confirmed {
                        hash: hash.clone(),
                        prev: None,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventBus};
    use crate::registry::{BoundaryReason, ForkRegistry, RegistryConfig};
    use crate::replay::ReplayEngine;
    use axum::{extract::Path, routing::get, Json, Router};
    use chrono::Utc;
    use graph::memory::MemoryGraph;
    use graph::PathTransformer;
    use models::{Checkpoint, OpKind, Operation};
    use serde_json::json;
    use snapshots::memory::MemorySnapshots;
    use std::time::Duration;

    struct Fixture {
        arbiter: CheckpointArbiter,
        registry: Arc<ForkRegistry>,
        graph: Arc<MemoryGraph>,
        snaps: Arc<MemorySnapshots>,
        events: EventBus,
    }

    fn fixture(peer_urls: &[String], snaps: MemorySnapshots) -> Fixture {
        let registry = Arc::new(ForkRegistry::new(RegistryConfig::default()));
        let graph = Arc::new(MemoryGraph::new());
        let snaps = Arc::new(snaps);
        let events = EventBus::new(64);

        let peers = peers::Client::new(
            peer_urls,
            peers::Config {
                fetch_timeout: Duration::from_secs(2),
                retry_base: Duration::from_millis(5),
                ..peers::Config::default()
            },
        )
        .unwrap();
        let replay = Arc::new(ReplayEngine::new(
            peers,
            graph.clone(),
            Some(snaps.clone()),
            Arc::new(PathTransformer),
            events.clone(),
            5,
        ));
        let arbiter = CheckpointArbiter::new(registry.clone(), replay, events.clone());

        Fixture {
            arbiter,
            registry,
            graph,
            snaps,
            events,
        }
    }

    /// Stub peer serving block N with hash `C{N}` and two operations.
    async fn spawn_peer() -> String {
        async fn block(Path(num): Path<u64>) -> Json<serde_json::Value> {
            Json(json!({
                "blockNum": num,
                "blockHash": format!("C{num}"),
                "operations": [
                    {"type": "put", "index": 1, "blockNum": num,
                     "forkHash": format!("C{num}"), "path": format!("/blocks/{num}")},
                    "W",
                ],
            }))
        }
        let app = Router::new().route("/api/block/:num", get(block));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/")
    }

    fn op(fork: &str, block_num: u64, index: u64, kind: OpKind) -> Operation {
        Operation {
            kind,
            index,
            block_num,
            fork_hash: fork.to_string(),
            path: format!("/p/{index}"),
            data: None,
            prev_checkpoint_hash: None,
            timestamp: Utc::now(),
            node_id: "n1".to_string(),
            token: "SPK".to_string(),
        }
    }

    fn checkpoint(block_num: u64, hash: &str, prev: Option<&str>) -> Checkpoint {
        Checkpoint {
            block_num,
            hash: hash.to_string(),
            prev_hash: prev.map(str::to_string),
            timestamp: Utc::now(),
            node_id: "n1".to_string(),
            token: "SPK".to_string(),
        }
    }

    fn drain(events: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn confirmation_prunes_the_losing_fork() {
        let fx = fixture(&[], MemorySnapshots::new());
        let mut rx = fx.events.subscribe();

        for (node_id, fork) in [("n1", "A"), ("n2", "B")] {
            fx.registry.append(node_id, &op(fork, 20000, 1, OpKind::Put)).unwrap();
            fx.registry
                .append(node_id, &op(fork, 20000, 2, OpKind::WriteMarker))
                .unwrap();
        }

        let outcome = fx
            .arbiter
            .handle_checkpoint(&checkpoint(20001, "Hwin", Some("A")))
            .await;
        assert_eq!(outcome, CheckpointOutcome::Confirmed);

        assert_eq!(fx.arbiter.confirmed(20001).unwrap().hash, "Hwin");
        assert!(fx.registry.fork("B").is_none());
        assert_eq!(fx.registry.active_fork("n2"), None);
        assert!(fx.registry.fork("A").unwrap().confirmed);

        let seen = drain(&mut rx);
        assert!(seen.iter().any(|e| matches!(e,
            Event::CheckpointConfirmed { block_num: 20001, hash, .. } if hash == "Hwin")));
    }

    #[tokio::test]
    async fn conflicting_hash_is_refused_not_overwritten() {
        let fx = fixture(&[], MemorySnapshots::new());
        let mut rx = fx.events.subscribe();
        fx.arbiter.preload(10, "H1", None);

        let outcome = fx.arbiter.handle_checkpoint(&checkpoint(10, "H2", None)).await;
        assert_eq!(outcome, CheckpointOutcome::Conflict);
        assert_eq!(fx.arbiter.confirmed(10).unwrap().hash, "H1");

        let seen = drain(&mut rx);
        assert!(seen.iter().any(|e| matches!(e,
            Event::CheckpointConflict { block_num: 10, .. })));
    }

    #[tokio::test]
    async fn repeated_equal_checkpoint_is_a_noop() {
        let fx = fixture(&[], MemorySnapshots::new());
        fx.arbiter.preload(10, "H1", None);

        let outcome = fx.arbiter.handle_checkpoint(&checkpoint(10, "H1", None)).await;
        assert_eq!(outcome, CheckpointOutcome::AlreadyConfirmed);
    }

    #[tokio::test]
    async fn invalid_boundary_stops_before_confirmation() {
        let fx = fixture(&[], MemorySnapshots::new());
        let mut rx = fx.events.subscribe();

        fx.registry.append("n1", &op("F", 15000, 1, OpKind::Put)).unwrap();
        fx.registry
            .append("n1", &op("F", 15000, 2, OpKind::WriteMarker))
            .unwrap();
        fx.registry.append("n1", &op("F", 15000, 3, OpKind::Put)).unwrap();

        let outcome = fx
            .arbiter
            .handle_checkpoint(&checkpoint(15001, "H", Some("F")))
            .await;
        assert_eq!(
            outcome,
            CheckpointOutcome::Invalid(BoundaryReason::OpsAfterMarker)
        );
        assert_eq!(fx.arbiter.confirmed(15001), None);

        let seen = drain(&mut rx);
        assert!(seen.iter().any(|e| matches!(e,
            Event::CheckpointInvalid { reason: BoundaryReason::OpsAfterMarker, .. })));
    }

    #[tokio::test]
    async fn divergence_rolls_back_and_replays_canonical_blocks() {
        let peer = spawn_peer().await;
        let fx = fixture(
            &[peer],
            MemorySnapshots::new().with_snapshot(14997, "C14997"),
        );
        let mut rx = fx.events.subscribe();

        fx.arbiter.preload(14999, "X", None);
        fx.arbiter.preload(15005, "Z", None); // Stale future confirmation.

        let outcome = fx
            .arbiter
            .handle_checkpoint(&checkpoint(15000, "Hcanon", Some("C14999")))
            .await;
        assert_eq!(outcome, CheckpointOutcome::Confirmed);

        // Rolled back to the snapshot, replayed 14998..=15000.
        assert_eq!(fx.snaps.rollbacks(), vec![14997]);
        let batches = fx.graph.batches();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|(_, ctx)| ctx.replay));
        assert_eq!(batches[0].1.block, 14998);
        assert_eq!(batches[2].1.block, 15000);

        // History: replayed hashes adopted, divergence block confirmed as
        // reported, stale future confirmations erased.
        assert_eq!(fx.arbiter.confirmed(14999).unwrap().hash, "C14999");
        assert_eq!(fx.arbiter.confirmed(15000).unwrap().hash, "Hcanon");
        assert_eq!(fx.arbiter.confirmed(15005), None);

        // A snapshot of the recovered state exists.
        assert!(fx.snaps.snapshot_blocks().contains(&15000));

        let seen = drain(&mut rx);
        assert!(seen.iter().any(|e| matches!(e,
            Event::ForkDetected { block_num: 15000, canonical_hash, .. } if canonical_hash == "Hcanon")));
        assert!(seen.iter().any(|e| matches!(e,
            Event::RecoveryComplete { from: 14997, to: 15000, count: 3, .. })));
    }

    #[tokio::test]
    async fn rerunning_a_completed_recovery_is_a_noop() {
        let peer = spawn_peer().await;
        let fx = fixture(
            &[peer],
            MemorySnapshots::new().with_snapshot(14997, "C14997"),
        );
        fx.arbiter.preload(14999, "X", None);

        let cp = checkpoint(15000, "Hcanon", Some("C14999"));
        assert_eq!(
            fx.arbiter.handle_checkpoint(&cp).await,
            CheckpointOutcome::Confirmed
        );
        assert_eq!(
            fx.arbiter.handle_checkpoint(&cp).await,
            CheckpointOutcome::AlreadyConfirmed
        );

        // No second rollback, no extra snapshot.
        assert_eq!(fx.snaps.rollbacks(), vec![14997]);
        assert_eq!(
            fx.snaps
                .snapshot_blocks()
                .iter()
                .filter(|b| **b == 15000)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn failed_rollback_aborts_and_preserves_history() {
        let fx = fixture(&[], MemorySnapshots::new().with_snapshot(14997, "C14997"));
        let mut rx = fx.events.subscribe();
        fx.snaps.fail_rollback(true);
        fx.arbiter.preload(14999, "X", None);

        let outcome = fx
            .arbiter
            .handle_checkpoint(&checkpoint(15000, "Hcanon", Some("C14999")))
            .await;
        assert_eq!(outcome, CheckpointOutcome::RecoveryFailed);

        assert_eq!(fx.arbiter.confirmed(14999).unwrap().hash, "X");
        assert_eq!(fx.arbiter.confirmed(15000), None);

        let seen = drain(&mut rx);
        assert!(seen.iter().any(|e| matches!(e, Event::RecoveryFailed { .. })));
        assert!(seen.iter().any(|e| matches!(e,
            Event::ForkRecoveryFailed { block_num: 15000, .. })));
    }
}
