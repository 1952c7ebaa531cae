use apiaryd::{
    arbiter::CheckpointArbiter,
    events::{Event, EventBus},
    queue::{QueueConfig, ReplicationQueue},
    registry::{ForkRegistry, RegistryConfig},
    replay::ReplayEngine,
    App, Config, Session,
};
use axum::{extract::Path, routing::get, Json, Router};
use futures::SinkExt;
use graph::{memory::MemoryGraph, PathTransformer};
use serde_json::{json, Value};
use snapshots::{memory::MemorySnapshots, Snapshots};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LinesCodec};

/// Stub peer serving canonical block N with hash `C{N}`.
async fn spawn_peer() -> String {
    async fn block(Path(num): Path<u64>) -> Json<Value> {
        Json(json!({
            "blockNum": num,
            "blockHash": format!("C{num}"),
            "operations": [
                {"type": "put", "index": 1, "blockNum": num,
                 "forkHash": format!("C{num}"), "path": format!("/blocks/{num}"),
                 "data": {"height": num}},
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

struct TestServer {
    app: Arc<App>,
    graph: Arc<MemoryGraph>,
    snaps: Arc<MemorySnapshots>,
    events: EventBus,
    addr: std::net::SocketAddr,
}

async fn spawn_server(peer_urls: Vec<String>, snaps: MemorySnapshots) -> TestServer {
    let graph = Arc::new(MemoryGraph::new());
    let snaps = Arc::new(snaps);
    let transformer = Arc::new(PathTransformer);
    let events = EventBus::new(64);
    let registry = Arc::new(ForkRegistry::new(RegistryConfig::default()));

    let peers = peers::Client::new(
        &peer_urls,
        peers::Config {
            fetch_timeout: Duration::from_secs(2),
            retry_base: Duration::from_millis(5),
            ..peers::Config::default()
        },
    )
    .unwrap();

    let replay = Arc::new(ReplayEngine::new(
        peers.clone(),
        graph.clone(),
        Some(snaps.clone() as Arc<dyn Snapshots>),
        transformer.clone(),
        events.clone(),
        5,
    ));
    let arbiter = Arc::new(CheckpointArbiter::new(
        registry.clone(),
        replay,
        events.clone(),
    ));
    let queue = ReplicationQueue::new(
        graph.clone(),
        transformer,
        Some(snaps.clone() as Arc<dyn Snapshots>),
        events.clone(),
        QueueConfig {
            retry_base: Duration::from_millis(1),
            ..QueueConfig::default()
        },
    );
    queue.subscribe_boundaries(&events);

    let app = Arc::new(App::new(
        Config::default(),
        registry,
        arbiter,
        queue,
        events.clone(),
        peers,
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let limit = Arc::new(tokio::sync::Semaphore::new(16));
    let stop = tokio_util::sync::CancellationToken::new();

    let accept_app = app.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, peer_addr)) = listener.accept().await else {
                return;
            };
            let session = Session::new(accept_app.clone(), peer_addr.to_string());
            tokio::spawn(apiaryd::serve(
                session,
                socket,
                Duration::from_secs(60),
                Duration::from_secs(30),
                stop.child_token(),
                limit.clone(),
            ));
        }
    });

    TestServer {
        app,
        graph,
        snaps,
        events,
        addr,
    }
}

async fn connect(addr: std::net::SocketAddr) -> Framed<TcpStream, LinesCodec> {
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(socket, LinesCodec::new());
    let greeting: Value = recv(&mut framed).await;
    assert_eq!(greeting["type"], "connected");
    framed
}

async fn recv(framed: &mut Framed<TcpStream, LinesCodec>) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
        .expect("transport error");
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn divergent_checkpoint_recovers_from_peers_end_to_end() {
    let peer = spawn_peer().await;
    let server = spawn_server(
        vec![peer],
        MemorySnapshots::new().with_snapshot(14997, "C14997"),
    )
    .await;
    let mut rx = server.events.subscribe();

    // The history this publisher is about to contradict.
    server.app.arbiter.preload(14999, "X", None);

    let mut client = connect(server.addr).await;
    client
        .send(
            json!({"type": "identify", "source": "honeycomb", "version": "1.5.0", "token": "SPK"})
                .to_string(),
        )
        .await
        .unwrap();
    recv(&mut client).await;

    client
        .send(
            json!({"type": "checkpoint", "blockNum": 15000, "hash": "C15000",
                   "prevHash": "C14999"})
                .to_string(),
        )
        .await
        .unwrap();
    let ack = recv(&mut client).await;
    assert_eq!(ack["success"], true);

    // Rolled back to the snapshot below the divergence, then replayed
    // the canonical blocks 14998..=15000 into the graph store.
    assert_eq!(server.snaps.rollbacks(), vec![14997]);
    for num in 14998..=15000u64 {
        assert_eq!(
            server.graph.document(&format!("/blocks/{num}")),
            Some(json!({"height": num}))
        );
    }

    // The confirmed history follows the canonical chain again.
    assert_eq!(server.app.arbiter.confirmed(14999).unwrap().hash, "C14999");
    assert_eq!(server.app.arbiter.confirmed(15000).unwrap().hash, "C15000");
    assert!(server.snaps.snapshot_blocks().contains(&15000));

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(e,
        Event::ForkDetected { block_num: 15000, .. })));
    assert!(seen.iter().any(|e| matches!(e,
        Event::RecoveryComplete { from: 14997, to: 15000, count: 3, .. })));
    assert!(seen.iter().any(|e| matches!(e,
        Event::CheckpointConfirmed { block_num: 15000, .. })));
}

#[tokio::test]
async fn unavailable_peers_fail_recovery_and_preserve_history() {
    // No peers configured at all: every download fails.
    let server = spawn_server(
        Vec::new(),
        MemorySnapshots::new().with_snapshot(14997, "C14997"),
    )
    .await;
    server.app.arbiter.preload(14999, "X", None);

    let mut client = connect(server.addr).await;
    client
        .send(
            json!({"type": "checkpoint", "blockNum": 15000, "hash": "C15000",
                   "prevHash": "C14999"})
                .to_string(),
        )
        .await
        .unwrap();
    let ack = recv(&mut client).await;
    assert_eq!(ack["success"], false);

    // The divergence was never confirmed; the old history stands.
    assert_eq!(server.app.arbiter.confirmed(15000), None);
    assert_eq!(server.app.arbiter.confirmed(14999).unwrap().hash, "X");
}
