mod http;
pub mod memory;

pub use http::HttpGraph;

use chrono::{DateTime, Utc};
use models::{OpKind, Operation};
use serde::Serialize;
use serde_json::{json, Value};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("graph endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request to graph endpoint failed")]
    Request(#[from] reqwest::Error),
    #[error("invalid graph endpoint: '{0}'")]
    InvalidEndpoint(String),
}

impl Error {
    /// Transient failures are retried by callers; the rest dead-letter.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Status { status, .. } => *status >= 500 || *status == 429,
            Error::Request(err) => err.is_timeout() || err.is_connect(),
            Error::InvalidEndpoint(_) => false,
        }
    }
}

/// Block context attached to every mutation batch.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockContext {
    pub block: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub replay: bool,
}

/// A batch of graph mutations produced by a `Transformer`.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct MutationBatch {
    pub sets: Vec<Value>,
    pub deletes: Vec<Value>,
}

impl MutationBatch {
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sets.len() + self.deletes.len()
    }
}

/// The downstream graph store, treated as a batch-mutation sink with a
/// query capability.
#[async_trait::async_trait]
pub trait GraphStore: Send + Sync {
    async fn query(&self, query: &str) -> Result<Value>;
    async fn write_batch(&self, batch: MutationBatch, ctx: &BlockContext) -> Result<()>;
    async fn alter(&self, schema: &str) -> Result<()>;
}

/// Pure function from operation batches to mutation batches.
pub trait Transformer: Send + Sync {
    fn transform(&self, ops: &[Operation], ctx: &BlockContext) -> MutationBatch;
}

/// Default transformer: one mutation per operation, keyed by
/// `(fork, index, path)` so redelivery is idempotent downstream.
#[derive(Debug, Clone, Default)]
pub struct PathTransformer;

impl Transformer for PathTransformer {
    fn transform(&self, ops: &[Operation], ctx: &BlockContext) -> MutationBatch {
        let mut batch = MutationBatch::default();
        for op in ops {
            let key = json!({
                "fork": op.fork_hash,
                "index": op.index,
                "path": op.path,
            });
            match op.kind {
                OpKind::Put => batch.sets.push(json!({
                    "key": key,
                    "token": op.token,
                    "block": op.block_num,
                    "data": op.data.clone().unwrap_or(Value::Null),
                    "replay": ctx.replay,
                })),
                OpKind::Del => batch.deletes.push(json!({"key": key})),
                // Markers delimit blocks and carry no state of their own.
                OpKind::WriteMarker => (),
            }
        }
        batch
    }
}
