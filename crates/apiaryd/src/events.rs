use crate::registry::BoundaryReason;
use tokio::sync::broadcast;

/// Events published between components. Every current subscriber receives
/// events in emission order per emitter; no cross-subscriber ordering is
/// implied.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    NetworkIdentified {
        node_id: String,
        token: String,
        prefix: String,
    },
    CheckpointInvalid {
        reason: BoundaryReason,
        fork_hash: String,
        block_num: u64,
        node_id: String,
    },
    CheckpointConflict {
        block_num: u64,
        existing: String,
        offered: String,
    },
    CheckpointConfirmed {
        block_num: u64,
        hash: String,
        token: String,
        fork_hash: String,
    },
    ForkDetected {
        block_num: u64,
        canonical_hash: String,
        fork_hash: String,
        node_id: String,
    },
    ForkRecoveryFailed {
        block_num: u64,
        error: String,
    },
    BlockReplayed {
        block_num: u64,
        op_count: usize,
    },
    BlockReplayFailed {
        block_num: u64,
        error: String,
    },
    RecoveryComplete {
        from: u64,
        to: u64,
        count: usize,
        canonical_hash: String,
    },
    RecoveryFailed {
        block_num: u64,
        error: String,
    },
    ReplicationFailed {
        token: String,
        fork_hash: String,
        index: Option<u64>,
        error: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        tracing::debug!(?event, "emitting");
        // Delivery is best-effort; an empty subscriber set is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_emission_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        for block_num in 1..=3 {
            bus.emit(Event::BlockReplayed {
                block_num,
                op_count: 0,
            });
        }
        for block_num in 1..=3u64 {
            assert_eq!(
                rx.recv().await.unwrap(),
                Event::BlockReplayed {
                    block_num,
                    op_count: 0
                }
            );
        }
    }
}
