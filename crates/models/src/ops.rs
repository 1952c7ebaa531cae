use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a single reported state mutation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Put,
    Del,
    WriteMarker,
}

impl OpKind {
    pub fn is_write_marker(&self) -> bool {
        matches!(self, OpKind::WriteMarker)
    }
}

/// A single state mutation reported by a publisher, identified by
/// `(fork_hash, index)`. Within a fork, indices are monotonically
/// non-decreasing, and a write-marker must be the final operation
/// of its block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub kind: OpKind,
    pub index: u64,
    pub block_num: u64,
    pub fork_hash: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_checkpoint_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Stable id of the connection which reported this operation.
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub token: String,
}

impl Operation {
    /// A write-marker terminating `block_num` on `fork_hash`.
    pub fn write_marker(
        fork_hash: impl Into<String>,
        block_num: u64,
        index: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: OpKind::WriteMarker,
            index,
            block_num,
            fork_hash: fork_hash.into(),
            path: String::new(),
            data: None,
            prev_checkpoint_hash: None,
            timestamp,
            node_id: String::new(),
            token: String::new(),
        }
    }
}

/// A publisher's declaration of a block's terminal state hash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub block_num: u64,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub token: String,
}

/// A canonical block downloaded from a peer during recovery.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    pub block_num: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub operations: Vec<Operation>,
    /// Base URL of the peer which served this block.
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}
