use crate::events::Event;
use crate::App;
use chrono::Utc;
use models::{
    classify, CheckpointFrame, ForkStartFrame, Frame, IdentifyFrame, Operation, Outbound,
    SyncStatusFrame,
};
use serde_json::Value;
use std::sync::Arc;

/// Per-connection protocol state. One session per accepted stream;
/// frames are handled strictly in arrival order.
pub struct Session {
    app: Arc<App>,
    node_id: String,
    addr: String,
    source: Option<String>,
    version: Option<String>,
    token: String,
    prefix: String,
    identified: bool,
    last_seen_index: u64,
    errors: u32,
}

impl Session {
    pub fn new(app: Arc<App>, addr: String) -> Self {
        let accepted_at = Utc::now();
        let node_id = format!("{addr}#{:x}", accepted_at.timestamp_millis());

        app.register_connection(&node_id, &addr, accepted_at);
        metrics::gauge!("apiary_connections").increment(1);

        Self {
            app,
            node_id,
            addr,
            source: None,
            version: None,
            token: String::new(),
            prefix: String::new(),
            identified: false,
            last_seen_index: 0,
            errors: 0,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn greeting(&self) -> Outbound {
        Outbound::Connected {
            node_id: self.node_id.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Handle one decoded frame, returning the responses to write.
    pub async fn handle_frame(&mut self, raw: &Value) -> Vec<Outbound> {
        match classify(raw, Utc::now()) {
            Frame::Identify(frame) => self.on_identify(frame),
            Frame::SyncStatus(frame) => self.on_sync_status(frame),
            Frame::ForkStart(frame) => self.on_fork_start(frame),
            Frame::Op(op) => vec![self.on_op(op).await],
            Frame::Batch(items) => vec![self.on_batch(items).await],
            Frame::Checkpoint(frame) => vec![self.on_checkpoint(frame).await],
            Frame::Unknown(kind) => {
                tracing::debug!(node_id = %self.node_id, kind, "ignoring unknown frame");
                Vec::new()
            }
        }
    }

    fn on_identify(&mut self, frame: IdentifyFrame) -> Vec<Outbound> {
        self.prefix = frame
            .prefix
            .clone()
            .unwrap_or_else(|| self.app.cfg.prefixes.derive(&frame.token));
        self.source = Some(frame.source);
        self.version = Some(frame.version);
        self.token = frame.token;
        self.identified = true;

        self.app
            .mark_identified(&self.node_id, &self.token);
        tracing::info!(
            node_id = %self.node_id,
            token = %self.token,
            prefix = %self.prefix,
            source = self.source.as_deref(),
            version = self.version.as_deref(),
            "publisher identified"
        );
        self.app.events.emit(Event::NetworkIdentified {
            node_id: self.node_id.clone(),
            token: self.token.clone(),
            prefix: self.prefix.clone(),
        });

        vec![Outbound::IdentifyAck {
            node_id: self.node_id.clone(),
            token: self.token.clone(),
            prefix: self.prefix.clone(),
        }]
    }

    fn on_sync_status(&mut self, frame: SyncStatusFrame) -> Vec<Outbound> {
        let ours = self.app.queue.last_delivered(&self.token);
        let mut responses = vec![Outbound::SyncStatus {
            last_index: ours,
            status: "ok".to_string(),
        }];

        // The publisher is behind our committed state: tell it the range
        // it is missing, bounded by the batch cap.
        if ours > frame.last_index {
            let from = frame.last_index + 1;
            let to = ours.min(frame.last_index + self.app.cfg.max_batch);
            responses.push(Outbound::RequestMissing { from, to });
        }
        responses
    }

    fn on_fork_start(&mut self, frame: ForkStartFrame) -> Vec<Outbound> {
        if let Some(denied) = self.check_auth() {
            return vec![denied];
        }
        match self
            .app
            .registry
            .start_fork(&frame.fork_hash, frame.block_num, &self.node_id)
        {
            Ok(()) => {
                tracing::debug!(node_id = %self.node_id, fork_hash = %frame.fork_hash, "fork started");
                vec![Outbound::Ack {
                    index: None,
                    success: true,
                    processed: None,
                    error: None,
                }]
            }
            Err(err) => vec![Outbound::nack(None, err.to_string())],
        }
    }

    async fn on_op(&mut self, mut op: Operation) -> Outbound {
        if let Some(denied) = self.check_auth() {
            return denied;
        }
        op.node_id = self.node_id.clone();
        op.token = self.token.clone();
        let index = op.index;

        if let Err(err) = self.app.registry.append(&self.node_id, &op) {
            tracing::warn!(node_id = %self.node_id, %err, "append rejected");
            return Outbound::nack(Some(index), err.to_string());
        }
        self.last_seen_index = self.last_seen_index.max(index);
        self.app.touch_connection(&self.node_id, index);

        if let Err(err) = self.app.queue.enqueue_op(op).await {
            // Buffered in the fork registry, but replication is down.
            tracing::error!(node_id = %self.node_id, %err, "replication enqueue failed");
            return Outbound::nack(Some(index), err.to_string());
        }
        Outbound::ack(index)
    }

    async fn on_batch(&mut self, items: Vec<Frame>) -> Outbound {
        if let Some(denied) = self.check_auth() {
            return denied;
        }
        let mut processed = 0u64;
        let mut first_error = None;

        for item in items {
            match item {
                Frame::Op(op) => match self.on_op(op).await {
                    Outbound::Ack { success: true, .. } => processed += 1,
                    Outbound::Ack { error, .. } => {
                        first_error.get_or_insert(error.unwrap_or_default());
                    }
                    _ => (),
                },
                other => {
                    tracing::debug!(node_id = %self.node_id, ?other, "ignoring non-operation batch item");
                }
            }
        }

        Outbound::Ack {
            index: None,
            success: first_error.is_none(),
            processed: Some(processed),
            error: first_error,
        }
    }

    async fn on_checkpoint(&mut self, frame: CheckpointFrame) -> Outbound {
        if let Some(denied) = self.check_auth() {
            return denied;
        }
        let cp = frame.into_checkpoint(&self.node_id, &self.token, Utc::now());
        let block_num = cp.block_num;

        let outcome = self.app.arbiter.handle_checkpoint(&cp).await;
        if outcome.is_success() {
            Outbound::Ack {
                index: None,
                success: true,
                processed: None,
                error: None,
            }
        } else {
            Outbound::nack(None, format!("checkpoint rejected for block {block_num}: {outcome:?}"))
        }
    }

    fn check_auth(&self) -> Option<Outbound> {
        if self.app.cfg.require_auth && !self.identified {
            return Some(Outbound::nack(None, "identify before publishing"));
        }
        None
    }

    /// A frame failed to decode. The connection survives, but repeated
    /// garbage exhausts its error budget and closes it.
    pub fn on_decode_error(&mut self, err: &serde_json::Error) -> (Outbound, bool) {
        self.errors += 1;
        metrics::counter!("apiary_bad_frames").increment(1);
        tracing::warn!(node_id = %self.node_id, %err, errors = self.errors, "bad frame");

        let close = self.errors >= self.app.cfg.error_budget;
        (
            Outbound::Error {
                error: format!("bad frame: {err}"),
            },
            close,
        )
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.app.unregister_connection(&self.node_id);
        metrics::gauge!("apiary_connections").decrement(1);
        tracing::debug!(node_id = %self.node_id, addr = %self.addr, "session closed");
    }
}
