mod frame;
mod ops;
mod prefix;

pub use frame::{
    classify, normalize_block_op, CheckpointFrame, ForkStartFrame, Frame, IdentifyFrame, Outbound,
    SyncStatusFrame,
};
pub use ops::{BlockRecord, Checkpoint, OpKind, Operation};
pub use prefix::PrefixTable;

/// Default capacity of a fork's operation buffer.
pub const DEFAULT_FORK_BUFFER: usize = 10_000;
/// Default cap on distinct forks tracked for a single block.
pub const DEFAULT_MAX_FORKS_PER_BLOCK: usize = 10;
/// Default cap on cached downloaded blocks.
pub const DEFAULT_BLOCK_CACHE: usize = 1_000;
