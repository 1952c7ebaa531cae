use crate::ops::{Checkpoint, OpKind, Operation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bare sentinel accepted in place of a structured write-marker frame.
const WRITE_MARKER_SENTINEL: &str = "W";

/// A classified inbound frame. Every frame on the wire is a self-contained
/// JSON value; classification never fails, it degrades to `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Identify(IdentifyFrame),
    SyncStatus(SyncStatusFrame),
    ForkStart(ForkStartFrame),
    Op(Operation),
    Batch(Vec<Frame>),
    Checkpoint(CheckpointFrame),
    Unknown(String),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyFrame {
    pub source: String,
    pub version: String,
    pub token: String,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatusFrame {
    pub last_index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForkStartFrame {
    pub fork_hash: String,
    pub block_num: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointFrame {
    pub block_num: u64,
    pub hash: String,
    pub prev_hash: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl CheckpointFrame {
    /// Bind this frame to the reporting connection.
    pub fn into_checkpoint(self, node_id: &str, token: &str, now: DateTime<Utc>) -> Checkpoint {
        Checkpoint {
            block_num: self.block_num,
            hash: self.hash,
            prev_hash: self.prev_hash,
            timestamp: self.timestamp.unwrap_or(now),
            node_id: node_id.to_string(),
            token: token.to_string(),
        }
    }
}

/// Classify a raw frame into its normalized internal form.
///
/// Control kinds are matched by their declared `type`. Anything else runs
/// through the operation detection rule: a numeric index or block number,
/// plus either a path or a kind, makes an operation. Missing operation
/// fields take defaults: kind `put`, index 0, block 0, fork-hash `pending`,
/// timestamp `now`.
pub fn classify(raw: &Value, now: DateTime<Utc>) -> Frame {
    // The wire admits a bare "W" string as a write-marker.
    if raw.as_str() == Some(WRITE_MARKER_SENTINEL) {
        return Frame::Op(normalize_op(&Value::Null, OpKind::WriteMarker, now));
    }
    let Some(obj) = raw.as_object() else {
        return Frame::Unknown(raw.to_string());
    };

    let kind = obj
        .get("type")
        .or_else(|| obj.get("kind"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    match kind {
        "identify" => match serde_json::from_value(raw.clone()) {
            Ok(frame) => Frame::Identify(frame),
            Err(_) => Frame::Unknown("identify".to_string()),
        },
        "sync_status" => Frame::SyncStatus(SyncStatusFrame {
            last_index: field_u64(raw, &["lastIndex", "last_index"]).unwrap_or(0),
        }),
        "fork_start" => Frame::ForkStart(ForkStartFrame {
            fork_hash: field_str(raw, &["forkHash", "fork_hash", "fork"])
                .unwrap_or_else(|| "pending".to_string()),
            block_num: field_u64(raw, &["blockNum", "block_num", "block"]).unwrap_or(0),
        }),
        "batch" => {
            let items = obj
                .get("operations")
                .or_else(|| obj.get("ops"))
                .and_then(Value::as_array)
                .map(|ops| ops.iter().map(|op| classify(op, now)).collect())
                .unwrap_or_default();
            Frame::Batch(items)
        }
        "checkpoint" => match field_str(raw, &["hash"]) {
            Some(hash) => Frame::Checkpoint(CheckpointFrame {
                block_num: field_u64(raw, &["blockNum", "block_num", "block"]).unwrap_or(0),
                hash,
                prev_hash: field_str(raw, &["prevHash", "prev_hash"]),
                timestamp: obj
                    .get("timestamp")
                    .and_then(|ts| serde_json::from_value(ts.clone()).ok()),
            }),
            None => Frame::Unknown("checkpoint".to_string()),
        },
        "write_marker" | "w" => Frame::Op(normalize_op(raw, OpKind::WriteMarker, now)),
        "put" | "op" => Frame::Op(normalize_op(raw, OpKind::Put, now)),
        "del" | "delete" => Frame::Op(normalize_op(raw, OpKind::Del, now)),
        other => {
            // Operation detection rule: a numeric index or block number, plus
            // either a path or a (non-control) kind, makes an operation.
            let has_position = field_u64(raw, &["index"]).is_some()
                || field_u64(raw, &["blockNum", "block_num", "block"]).is_some();
            let has_shape = field_str(raw, &["path"]).is_some() || !other.is_empty();
            if has_position && has_shape {
                Frame::Op(normalize_op(raw, OpKind::Put, now))
            } else {
                Frame::Unknown(other.to_string())
            }
        }
    }
}

fn normalize_op(raw: &Value, kind: OpKind, now: DateTime<Utc>) -> Operation {
    Operation {
        kind,
        index: field_u64(raw, &["index"]).unwrap_or(0),
        block_num: field_u64(raw, &["blockNum", "block_num", "block"]).unwrap_or(0),
        fork_hash: field_str(raw, &["forkHash", "fork_hash", "fork"])
            .unwrap_or_else(|| "pending".to_string()),
        path: field_str(raw, &["path"]).unwrap_or_default(),
        data: match kind {
            OpKind::Put => raw.get("data").cloned().filter(|d| !d.is_null()),
            OpKind::Del | OpKind::WriteMarker => None,
        },
        prev_checkpoint_hash: field_str(raw, &["prevCheckpointHash", "prev_checkpoint_hash"]),
        timestamp: raw
            .get("timestamp")
            .and_then(|ts| serde_json::from_value(ts.clone()).ok())
            .unwrap_or(now),
        node_id: String::new(),
        token: String::new(),
    }
}

/// Normalize a loosely-spelled operation from a downloaded block.
pub fn normalize_block_op(raw: &Value, now: DateTime<Utc>) -> Option<Operation> {
    match classify(raw, now) {
        Frame::Op(op) => Some(op),
        _ => None,
    }
}

fn field_u64(raw: &Value, names: &[&str]) -> Option<u64> {
    names.iter().find_map(|name| raw.get(name)?.as_u64())
}

fn field_str(raw: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| raw.get(name)?.as_str().map(str::to_string))
}

/// Frames sent back to a publisher. Serialized as single-line JSON.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    #[serde(rename_all = "camelCase")]
    Connected {
        node_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    IdentifyAck {
        node_id: String,
        token: String,
        prefix: String,
    },
    #[serde(rename_all = "camelCase")]
    SyncStatus { last_index: u64, status: String },
    RequestMissing { from: u64, to: u64 },
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<u64>,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        processed: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Ping { timestamp: DateTime<Utc> },
    Error { error: String },
}

impl Outbound {
    pub fn ack(index: u64) -> Self {
        Outbound::Ack {
            index: Some(index),
            success: true,
            processed: None,
            error: None,
        }
    }

    pub fn nack(index: Option<u64>, error: impl Into<String>) -> Self {
        Outbound::Ack {
            index,
            success: false,
            processed: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        "2024-05-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn bare_sentinel_is_a_write_marker() {
        let Frame::Op(op) = classify(&json!("W"), now()) else {
            panic!("expected an operation");
        };
        assert_eq!(op.kind, OpKind::WriteMarker);
        assert_eq!(op.fork_hash, "pending");
        assert_eq!(op.index, 0);
    }

    #[test]
    fn operation_defaults_are_applied() {
        let raw = json!({"type": "put", "path": "/users/alice"});
        let Frame::Op(op) = classify(&raw, now()) else {
            panic!("expected an operation");
        };
        assert_eq!(op.kind, OpKind::Put);
        assert_eq!(op.index, 0);
        assert_eq!(op.block_num, 0);
        assert_eq!(op.fork_hash, "pending");
        assert_eq!(op.timestamp, now());
    }

    #[test]
    fn untyped_frame_with_position_and_path_is_an_operation() {
        let raw = json!({"index": 7, "blockNum": 15000, "path": "/a", "data": {"x": 1}});
        let Frame::Op(op) = classify(&raw, now()) else {
            panic!("expected an operation");
        };
        assert_eq!(op.kind, OpKind::Put);
        assert_eq!(op.index, 7);
        assert_eq!(op.data, Some(json!({"x": 1})));
    }

    #[test]
    fn delete_drops_payload() {
        let raw = json!({"type": "del", "index": 3, "blockNum": 10, "forkHash": "A",
            "path": "/users/charlie", "data": {"stale": true}});
        let Frame::Op(op) = classify(&raw, now()) else {
            panic!("expected an operation");
        };
        assert_eq!(op.kind, OpKind::Del);
        assert_eq!(op.data, None);
    }

    #[test]
    fn publisher_specific_kind_with_position_normalizes_to_put() {
        let raw = json!({"type": "gossip", "index": 1, "path": "/x"});
        let Frame::Op(op) = classify(&raw, now()) else {
            panic!("expected an operation");
        };
        assert_eq!(op.kind, OpKind::Put);
    }

    #[test]
    fn unknown_kind_without_position_is_ignored() {
        let raw = json!({"type": "gossip", "payload": "zzz"});
        assert_eq!(classify(&raw, now()), Frame::Unknown("gossip".to_string()));
    }

    #[test]
    fn batch_unwraps_in_order() {
        let raw = json!({"type": "batch", "operations": [
            {"type": "put", "index": 1, "blockNum": 5, "forkHash": "A", "path": "/a"},
            "W",
            {"type": "checkpoint", "blockNum": 6, "hash": "H"},
        ]});
        let Frame::Batch(items) = classify(&raw, now()) else {
            panic!("expected a batch");
        };
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], Frame::Op(op) if op.index == 1));
        assert!(matches!(&items[1], Frame::Op(op) if op.kind == OpKind::WriteMarker));
        assert!(matches!(&items[2], Frame::Checkpoint(_)));
    }

    #[test]
    fn checkpoint_requires_a_hash() {
        let raw = json!({"type": "checkpoint", "blockNum": 6});
        assert_eq!(
            classify(&raw, now()),
            Frame::Unknown("checkpoint".to_string())
        );
    }

    #[test]
    fn sync_status_accepts_both_spellings() {
        for key in ["lastIndex", "last_index"] {
            let raw = json!({"type": "sync_status", key: 42});
            assert_eq!(
                classify(&raw, now()),
                Frame::SyncStatus(SyncStatusFrame { last_index: 42 })
            );
        }
    }

    #[test]
    fn outbound_frames_serialize_with_type_tags() {
        let ack = serde_json::to_value(&Outbound::ack(3)).unwrap();
        assert_eq!(ack, json!({"type": "ack", "index": 3, "success": true}));

        let err = serde_json::to_value(&Outbound::Error {
            error: "bad frame".to_string(),
        })
        .unwrap();
        assert_eq!(err, json!({"type": "error", "error": "bad frame"}));
    }
}
