use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::SinkExt;
use models::{Outbound, PrefixTable};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

pub mod arbiter;
pub mod events;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod replay;
pub mod session;
pub mod status;

pub use session::Session;

/// Frames are single JSON lines; anything larger than this is hostile.
const MAX_FRAME_LENGTH: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct Config {
    /// Reject operations from unidentified connections.
    pub require_auth: bool,
    /// Bound on a `request_missing` range.
    pub max_batch: u64,
    /// Bad frames tolerated per connection before it is closed.
    pub error_budget: u32,
    pub prefixes: PrefixTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            require_auth: false,
            max_batch: 1000,
            error_budget: 10,
            prefixes: PrefixTable::default(),
        }
    }
}

/// A connected publisher, as seen by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnInfo {
    pub addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub identified: bool,
    pub connected_at: DateTime<Utc>,
    pub last_seen_index: u64,
}

/// Shared daemon state handed to every session.
pub struct App {
    pub cfg: Config,
    pub registry: Arc<registry::ForkRegistry>,
    pub arbiter: Arc<arbiter::CheckpointArbiter>,
    pub queue: queue::ReplicationQueue,
    pub events: events::EventBus,
    pub peers: peers::Client,
    connections: Mutex<HashMap<String, ConnInfo>>,
    pub started_at: DateTime<Utc>,
}

impl App {
    pub fn new(
        cfg: Config,
        registry: Arc<registry::ForkRegistry>,
        arbiter: Arc<arbiter::CheckpointArbiter>,
        queue: queue::ReplicationQueue,
        events: events::EventBus,
        peers: peers::Client,
    ) -> Self {
        Self {
            cfg,
            registry,
            arbiter,
            queue,
            events,
            peers,
            connections: Mutex::new(HashMap::new()),
            started_at: Utc::now(),
        }
    }

    pub fn connections(&self) -> Vec<(String, ConnInfo)> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .map(|(node_id, info)| (node_id.clone(), info.clone()))
            .collect()
    }

    pub(crate) fn register_connection(&self, node_id: &str, addr: &str, at: DateTime<Utc>) {
        self.connections.lock().unwrap().insert(
            node_id.to_string(),
            ConnInfo {
                addr: addr.to_string(),
                token: None,
                identified: false,
                connected_at: at,
                last_seen_index: 0,
            },
        );
    }

    pub(crate) fn unregister_connection(&self, node_id: &str) {
        self.connections.lock().unwrap().remove(node_id);
    }

    pub(crate) fn mark_identified(&self, node_id: &str, token: &str) {
        if let Some(info) = self.connections.lock().unwrap().get_mut(node_id) {
            info.identified = true;
            info.token = Some(token.to_string());
        }
    }

    pub(crate) fn touch_connection(&self, node_id: &str, index: u64) {
        if let Some(info) = self.connections.lock().unwrap().get_mut(node_id) {
            info.last_seen_index = info.last_seen_index.max(index);
        }
    }
}

/// Serve one publisher stream until EOF, transport error, idle timeout,
/// or shutdown. A ping probe goes out after `ping_interval` of silence;
/// the connection closes after `idle_timeout` of it.
#[tracing::instrument(level = "info", err(Debug, level = "warn"), skip(session, socket, stop, connection_limit), fields(node_id = %session.node_id()))]
pub async fn serve<S>(
    mut session: Session,
    socket: S,
    idle_timeout: std::time::Duration,
    ping_interval: std::time::Duration,
    stop: tokio_util::sync::CancellationToken,
    connection_limit: Arc<tokio::sync::Semaphore>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _permit = match connection_limit.try_acquire() {
        Ok(permit) => permit,
        Err(_) => {
            metrics::counter!("apiary_rejected_connections", "reason" => "over_limit")
                .increment(1);
            anyhow::bail!("connection limit reached, rejecting connection");
        }
    };
    tracing::info!("accepted publisher connection");

    let (r, w) = tokio::io::split(socket);
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    let mut writer = FramedWrite::new(w, LinesCodec::new());

    send(&mut writer, &session.greeting()).await?;

    let mut last_activity = tokio::time::Instant::now();
    let mut pinged = false;

    loop {
        tokio::select! {
            frame = reader.next() => {
                let Some(frame) = frame else {
                    return Ok(()); // Peer closed cleanly.
                };
                let line = frame.context("failed to read next frame")?;
                last_activity = tokio::time::Instant::now();
                pinged = false;

                match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(raw) => {
                        for response in session.handle_frame(&raw).await {
                            send(&mut writer, &response).await?;
                        }
                    }
                    Err(err) => {
                        let (response, close) = session.on_decode_error(&err);
                        send(&mut writer, &response).await?;
                        if close {
                            anyhow::bail!("per-connection error budget exhausted");
                        }
                    }
                }
            }
            _ = tokio::time::sleep_until(last_activity + ping_interval), if !pinged => {
                send(&mut writer, &Outbound::Ping { timestamp: Utc::now() }).await?;
                pinged = true;
            }
            _ = tokio::time::sleep_until(last_activity + idle_timeout) => {
                anyhow::bail!("closing idle connection");
            }
            _ = stop.cancelled() => {
                let _ = send(&mut writer, &Outbound::Error {
                    error: "server shutting down".to_string(),
                }).await;
                return Ok(());
            }
        }
    }
}

async fn send<W>(writer: &mut FramedWrite<W, LinesCodec>, frame: &Outbound) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = serde_json::to_string(frame).context("encoding outbound frame")?;
    writer.send(line).await.context("writing outbound frame")?;
    Ok(())
}
