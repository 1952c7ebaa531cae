use anyhow::Context;
use apiaryd::{arbiter::CheckpointArbiter, events::EventBus, logging, queue, registry, replay,
    session::Session, status};
use clap::Parser;
use graph::{GraphStore, PathTransformer, Transformer};
use models::PrefixTable;
use snapshots::{CommandConfig, CommandSnapshots, Snapshots};
use std::{sync::Arc, time::Duration};
use url::Url;

/// Ingests state-mutation streams from blockchain-node publishers,
/// arbitrates forks, and replicates one canonical state into the
/// downstream graph store.
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Cli {
    /// Port to listen on for publisher streams.
    #[arg(long, default_value = "8123", env = "LISTEN_PORT")]
    listen_port: u16,
    /// Port for the operator status and metrics endpoint.
    #[arg(long, default_value = "8124", env = "STATUS_PORT")]
    status_port: u16,

    /// Peer base URLs used for canonical block downloads during recovery.
    #[arg(long, env = "PEERS", value_delimiter = ',')]
    peers: Vec<String>,
    /// Graph-store mutation endpoint. When omitted, an in-memory store is
    /// used; suitable only for local runs.
    #[arg(long, env = "GRAPH_ENDPOINT")]
    graph_endpoint: Option<Url>,

    /// Maximum concurrent block downloads during recovery.
    #[arg(long, default_value = "5", env = "MAX_CONCURRENT_DOWNLOADS")]
    max_concurrent_downloads: usize,
    /// Operations buffered per fork before the oldest are dropped.
    #[arg(long, default_value = "10000", env = "FORK_BUFFER_SIZE")]
    fork_buffer_size: usize,
    /// Distinct forks tracked per block.
    #[arg(long, default_value = "10", env = "MAX_FORKS_PER_BLOCK")]
    max_forks_per_block: usize,
    /// Downloaded blocks kept in the recovery cache.
    #[arg(long, default_value = "1000", env = "BLOCK_CACHE_SIZE")]
    block_cache_size: usize,

    /// How long an idle fork is retained before the sweep deletes it.
    #[arg(long, env = "FORK_RETENTION", value_parser = humantime::parse_duration, default_value = "1h")]
    fork_retention: Duration,
    /// Interval between fork sweeps and peer health probes.
    #[arg(long, env = "SWEEP_INTERVAL", value_parser = humantime::parse_duration, default_value = "5m")]
    sweep_interval: Duration,
    /// How long to wait for a frame before closing the connection.
    #[arg(long, env = "IDLE_TIMEOUT", value_parser = humantime::parse_duration, default_value = "60s")]
    idle_timeout: Duration,
    /// Silence before a ping probe goes out.
    #[arg(long, env = "PING_INTERVAL", value_parser = humantime::parse_duration, default_value = "30s")]
    ping_interval: Duration,
    /// Per-attempt timeout for a peer block fetch.
    #[arg(long, env = "FETCH_TIMEOUT", value_parser = humantime::parse_duration, default_value = "30s")]
    fetch_timeout: Duration,
    /// Fetch attempts per peer before falling back to the next one.
    #[arg(long, default_value = "3", env = "FETCH_RETRIES")]
    fetch_retries: u32,
    /// Graph write attempts before an item dead-letters.
    #[arg(long, default_value = "5", env = "WRITE_RETRIES")]
    write_retries: u32,
    /// How long shutdown waits for the replication queue to drain.
    #[arg(long, env = "DRAIN_GRACE", value_parser = humantime::parse_duration, default_value = "10s")]
    drain_grace: Duration,

    /// Maximum concurrent publisher connections.
    #[arg(long, default_value = "300", env = "MAX_CONNECTIONS")]
    max_connections: usize,
    /// Bound on a request_missing range.
    #[arg(long, default_value = "1000", env = "MAX_BATCH")]
    max_batch: u64,
    /// Bad frames tolerated per connection before it is closed.
    #[arg(long, default_value = "10", env = "ERROR_BUDGET")]
    error_budget: u32,
    /// Reject operations from connections that have not identified.
    #[arg(long, action(clap::ArgAction::SetTrue), env = "REQUIRE_AUTH")]
    require_auth: bool,
    /// Extra TOKEN=prefix_ pairs layered over the built-in prefix table.
    #[arg(long, env = "TOKEN_PREFIXES", value_delimiter = ',')]
    token_prefixes: Vec<String>,

    /// Snapshot-create command template; `{block}` and `{hash}` are
    /// substituted. All of create/rollback/list must be set to enable
    /// the snapshot capability.
    #[arg(long, env = "SNAPSHOT_CREATE_CMD")]
    snapshot_create_cmd: Option<String>,
    /// Snapshot-rollback command template.
    #[arg(long, env = "SNAPSHOT_ROLLBACK_CMD")]
    snapshot_rollback_cmd: Option<String>,
    /// Snapshot-list command; prints one `block hash [created-at]` line
    /// per snapshot.
    #[arg(long, env = "SNAPSHOT_LIST_CMD")]
    snapshot_list_cmd: Option<String>,
    /// Snapshot-clone command template; `{name}` is substituted.
    #[arg(long, env = "SNAPSHOT_CLONE_CMD")]
    snapshot_clone_cmd: Option<String>,
    /// Run before a rollback to quiesce dependent services.
    #[arg(long, env = "SERVICE_STOP_CMD")]
    service_stop_cmd: Option<String>,
    /// Run after a rollback to restart them.
    #[arg(long, env = "SERVICE_START_CMD")]
    service_start_cmd: Option<String>,
}

impl Cli {
    fn snapshots(&self) -> Option<Arc<dyn Snapshots>> {
        match (
            &self.snapshot_create_cmd,
            &self.snapshot_rollback_cmd,
            &self.snapshot_list_cmd,
        ) {
            (Some(create), Some(rollback), Some(list)) => {
                Some(Arc::new(CommandSnapshots::new(CommandConfig {
                    create: create.clone(),
                    rollback: rollback.clone(),
                    list: list.clone(),
                    clone: self.snapshot_clone_cmd.clone(),
                    stop_services: self.service_stop_cmd.clone(),
                    start_services: self.service_start_cmd.clone(),
                })))
            }
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::install();
    let cli = Cli::parse();
    tracing::info!("starting apiaryd");

    let prefixes = PrefixTable::with_overrides(&cli.token_prefixes)
        .map_err(|err| anyhow::anyhow!(err))
        .context("parsing --token-prefixes")?;

    let peers = peers::Client::new(
        &cli.peers,
        peers::Config {
            fetch_timeout: cli.fetch_timeout,
            fetch_retries: cli.fetch_retries,
            cache_max: cli.block_cache_size,
            ..peers::Config::default()
        },
    )
    .context("configuring peer client")?;

    let graph: Arc<dyn GraphStore> = match &cli.graph_endpoint {
        Some(endpoint) => Arc::new(graph::HttpGraph::new(endpoint.clone())),
        None => {
            tracing::warn!("no --graph-endpoint configured, using an in-memory graph store");
            Arc::new(graph::memory::MemoryGraph::new())
        }
    };
    let snapshots = cli.snapshots();
    if snapshots.is_none() {
        tracing::info!("snapshot capability not configured; recovery will replay without rollback");
    }
    let transformer: Arc<dyn Transformer> = Arc::new(PathTransformer);

    let events = EventBus::default();
    let registry = Arc::new(registry::ForkRegistry::new(registry::RegistryConfig {
        buffer_cap: cli.fork_buffer_size,
        max_forks_per_block: cli.max_forks_per_block,
        retention: cli.fork_retention,
    }));
    let replay = Arc::new(replay::ReplayEngine::new(
        peers.clone(),
        graph.clone(),
        snapshots.clone(),
        transformer.clone(),
        events.clone(),
        cli.max_concurrent_downloads,
    ));
    let arbiter = Arc::new(CheckpointArbiter::new(
        registry.clone(),
        replay,
        events.clone(),
    ));
    let queue = queue::ReplicationQueue::new(
        graph,
        transformer,
        snapshots,
        events.clone(),
        queue::QueueConfig {
            write_retries: cli.write_retries,
            ..queue::QueueConfig::default()
        },
    );
    queue.subscribe_boundaries(&events);

    let app = Arc::new(apiaryd::App::new(
        apiaryd::Config {
            require_auth: cli.require_auth,
            max_batch: cli.max_batch,
            error_budget: cli.error_budget,
            prefixes,
        },
        registry.clone(),
        arbiter,
        queue.clone(),
        events,
        peers.clone(),
    ));

    let cancel_token = tokio_util::sync::CancellationToken::new();
    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received ctrl-c, initiating shutdown");
        ctrl_c_token.cancel();
    });

    // Operator status endpoint.
    let status_listener = tokio::net::TcpListener::bind(format!("[::]:{}", cli.status_port))
        .await
        .context("failed to bind status port")?;
    let status_router = status::build_router(app.clone());
    tokio::spawn(async move {
        axum::serve(status_listener, status_router).await.unwrap();
    });

    // Periodic fork sweep and peer health probe.
    let sweep_registry = registry.clone();
    let sweep_peers = peers.clone();
    let sweep_token = cancel_token.clone();
    let sweep_interval = cli.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_registry.sweep(chrono::Utc::now());
                    sweep_peers.probe_health().await;
                }
                _ = sweep_token.cancelled() => return,
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(format!("[::]:{}", cli.listen_port))
        .await
        .context("failed to bind publisher port")?;
    tracing::info!(port = cli.listen_port, "listening for publishers");

    let connection_limit = Arc::new(tokio::sync::Semaphore::new(cli.max_connections));

    // Accept and serve publisher streams until we're signaled to stop.
    loop {
        tokio::select! {
            accept = listener.accept() => {
                let Ok((socket, addr)) = accept else {
                    continue;
                };
                socket.set_nodelay(true)?;

                let session = Session::new(app.clone(), addr.to_string());
                tokio::spawn(apiaryd::serve(
                    session,
                    socket,
                    cli.idle_timeout,
                    cli.ping_interval,
                    cancel_token.child_token(),
                    connection_limit.clone(),
                ));
            }
            _ = cancel_token.cancelled() => break,
        }
    }

    tracing::info!("draining replication queue");
    queue.drain(cli.drain_grace).await;

    Ok(())
}
