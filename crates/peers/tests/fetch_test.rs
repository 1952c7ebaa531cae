use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use peers::{Client, Config, Error};
use serde_json::json;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

#[derive(Clone, Default)]
struct StubPeer {
    hits: Arc<AtomicUsize>,
    /// Return 500 for this many requests before succeeding.
    fail_first: Arc<AtomicUsize>,
    /// Delay every response by this long.
    delay: Duration,
}

impl StubPeer {
    fn failing(fail_first: usize) -> Self {
        let stub = Self::default();
        stub.fail_first.store(fail_first, Ordering::SeqCst);
        stub
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

async fn block(Path(num): Path<u64>, State(stub): State<StubPeer>) -> impl IntoResponse {
    stub.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(stub.delay).await;

    let remaining = stub.fail_first.load(Ordering::SeqCst);
    if remaining > 0 {
        stub.fail_first.store(remaining - 1, Ordering::SeqCst);
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({})));
    }

    let body = json!({
        "blockNum": num,
        "blockHash": format!("H{num}"),
        "operations": [
            {"type": "put", "index": 1, "blockNum": num, "forkHash": format!("H{num}"), "path": "/x"},
            "W",
        ],
    });
    (StatusCode::OK, Json(body))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn spawn_peer(stub: StubPeer) -> String {
    let app = Router::new()
        .route("/api/block/:num", get(block))
        .route("/api/health", get(health))
        .with_state(stub);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    format!("http://{addr}/")
}

fn test_config() -> Config {
    Config {
        fetch_timeout: Duration::from_secs(2),
        health_timeout: Duration::from_secs(1),
        fetch_retries: 3,
        retry_base: Duration::from_millis(10),
        cache_max: 16,
    }
}

#[tokio::test]
async fn falls_back_to_the_next_peer() {
    let broken = StubPeer::failing(usize::MAX);
    let healthy = StubPeer::default();
    let urls = vec![
        spawn_peer(broken.clone()).await,
        spawn_peer(healthy.clone()).await,
    ];
    let client = Client::new(&urls, test_config()).unwrap();

    let record = client.fetch_block(500).await.unwrap();
    assert_eq!(record.block_num, 500);
    assert_eq!(record.source, urls[1]);
    assert!(client.cache().contains(500));
    assert_eq!(healthy.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retries_one_peer_before_falling_back() {
    let flaky = StubPeer::failing(2);
    let urls = vec![spawn_peer(flaky.clone()).await];
    let client = Client::new(&urls, test_config()).unwrap();

    let record = client.fetch_block(7).await.unwrap();
    assert_eq!(record.block_num, 7);
    assert_eq!(flaky.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausting_all_peers_fails_with_block_unavailable() {
    let broken = StubPeer::failing(usize::MAX);
    let urls = vec![spawn_peer(broken).await];
    let client = Client::new(&urls, test_config()).unwrap();

    assert!(matches!(
        client.fetch_block(9).await,
        Err(Error::BlockUnavailable(9))
    ));
    assert!(!client.cache().contains(9));
}

#[tokio::test]
async fn concurrent_fetches_share_one_download() {
    let slow = StubPeer::slow(Duration::from_millis(200));
    let urls = vec![spawn_peer(slow.clone()).await];
    let client = Client::new(&urls, test_config()).unwrap();

    let (a, b) = tokio::join!(client.fetch_block(42), client.fetch_block(42));
    assert_eq!(a.unwrap().block_num, 42);
    assert_eq!(b.unwrap().block_num, 42);
    assert_eq!(slow.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cache_serves_repeat_fetches() {
    let stub = StubPeer::default();
    let urls = vec![spawn_peer(stub.clone()).await];
    let client = Client::new(&urls, test_config()).unwrap();

    client.fetch_block(3).await.unwrap();
    client.fetch_block(3).await.unwrap();
    assert_eq!(stub.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn health_probe_reports_peer_status() {
    let urls = vec![
        spawn_peer(StubPeer::default()).await,
        "http://127.0.0.1:1/".to_string(),
    ];
    let client = Client::new(&urls, test_config()).unwrap();

    let status = client.probe_health().await;
    assert!(status[0].healthy);
    assert!(!status[1].healthy);
}
