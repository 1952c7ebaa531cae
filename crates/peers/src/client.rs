use crate::{backoff, BlockCache, Error, Result};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use models::BlockRecord;
use serde_json::Value;
use std::collections::{hash_map::Entry, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    /// Hard timeout for a single block-fetch attempt.
    pub fetch_timeout: Duration,
    /// Timeout for a peer health probe.
    pub health_timeout: Duration,
    /// Attempts per peer before falling back to the next one.
    pub fetch_retries: u32,
    /// Base delay between attempts.
    pub retry_base: Duration,
    /// Cap on cached downloaded blocks.
    pub cache_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            fetch_retries: 3,
            retry_base: Duration::from_secs(1),
            cache_max: models::DEFAULT_BLOCK_CACHE,
        }
    }
}

/// Health snapshot of one configured peer.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub base: String,
    pub healthy: bool,
    pub last_success: Option<DateTime<Utc>>,
}

struct Peer {
    base: Url,
    health: Mutex<(bool, Option<DateTime<Utc>>)>,
}

impl Peer {
    fn mark(&self, healthy: bool) {
        let mut health = self.health.lock().unwrap();
        health.0 = healthy;
        if healthy {
            health.1 = Some(Utc::now());
        }
    }

    fn status(&self) -> PeerStatus {
        let health = self.health.lock().unwrap();
        PeerStatus {
            base: self.base.to_string(),
            healthy: health.0,
            last_success: health.1,
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, std::result::Result<BlockRecord, Arc<Error>>>>;

/// Client for downloading canonical block data from peer publishers.
///
/// Fetches are cached, and concurrent requests for the same block share a
/// single in-flight download. Each peer is tried in configuration order
/// with per-attempt timeouts and linear backoff between attempts.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    peers: Vec<Peer>,
    cache: BlockCache,
    in_flight: Mutex<HashMap<u64, SharedFetch>>,
    cfg: Config,
}

impl Client {
    pub fn new(peer_urls: &[String], cfg: Config) -> Result<Self> {
        let peers = peer_urls
            .iter()
            .map(|raw| {
                let base =
                    Url::parse(raw).map_err(|_| Error::InvalidEndpoint(raw.to_string()))?;
                Ok(Peer {
                    base,
                    health: Mutex::new((true, None)),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            inner: Arc::new(Inner {
                http: reqwest::Client::new(),
                peers,
                cache: BlockCache::new(cfg.cache_max),
                in_flight: Mutex::new(HashMap::new()),
                cfg,
            }),
        })
    }

    pub fn cache(&self) -> &BlockCache {
        &self.inner.cache
    }

    pub fn peer_status(&self) -> Vec<PeerStatus> {
        self.inner.peers.iter().map(Peer::status).collect()
    }

    /// Fetch one canonical block, from cache if possible, coalescing with
    /// any download already underway for the same block number.
    pub async fn fetch_block(&self, block_num: u64) -> Result<BlockRecord> {
        if let Some(hit) = self.inner.cache.get(block_num) {
            metrics::counter!("apiary_block_cache_hits").increment(1);
            return Ok(hit);
        }
        metrics::counter!("apiary_block_cache_misses").increment(1);

        let (fetch, leader) = {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            match in_flight.entry(block_num) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    let this = self.clone();
                    let fetch = async move { this.download(block_num).await.map_err(Arc::new) }
                        .boxed()
                        .shared();
                    entry.insert(fetch.clone());
                    (fetch, true)
                }
            }
        };

        let result = fetch.await;

        if leader {
            self.inner.in_flight.lock().unwrap().remove(&block_num);
            if let Ok(record) = &result {
                self.inner.cache.insert(record.clone());
                metrics::gauge!("apiary_block_cache_size").set(self.inner.cache.len() as f64);
            }
        }
        result.map_err(Error::Coalesced)
    }

    async fn download(&self, block_num: u64) -> Result<BlockRecord> {
        for peer in &self.inner.peers {
            match self.download_from(peer, block_num).await {
                Ok(record) => {
                    peer.mark(true);
                    return Ok(record);
                }
                Err(err) => {
                    tracing::warn!(block_num, peer = %peer.base, %err, "peer fetch failed");
                    peer.mark(false);
                }
            }
        }
        Err(Error::BlockUnavailable(block_num))
    }

    async fn download_from(&self, peer: &Peer, block_num: u64) -> Result<BlockRecord> {
        let url = peer
            .base
            .join(&format!("api/block/{block_num}"))
            .map_err(|_| Error::InvalidEndpoint(peer.base.to_string()))?;

        let mut last_err = Error::BlockUnavailable(block_num);
        for attempt in 1..=self.inner.cfg.fetch_retries {
            match self.attempt(&url, block_num, &peer.base).await {
                Ok(record) => return Ok(record),
                Err(err) => {
                    tracing::debug!(block_num, attempt, %err, "fetch attempt failed");
                    last_err = err;
                }
            }
            if attempt < self.inner.cfg.fetch_retries {
                tokio::time::sleep(backoff(self.inner.cfg.retry_base, attempt)).await;
            }
        }
        Err(last_err)
    }

    async fn attempt(&self, url: &Url, block_num: u64, source: &Url) -> Result<BlockRecord> {
        let request = self
            .inner
            .http
            .get(url.clone())
            .header("Accept", "application/json")
            .send();

        let response = tokio::time::timeout(self.inner.cfg.fetch_timeout, request)
            .await
            .map_err(|_| Error::Timeout(self.inner.cfg.fetch_timeout))?
            .and_then(reqwest::Response::error_for_status)?;

        let raw: Value = tokio::time::timeout(self.inner.cfg.fetch_timeout, response.json())
            .await
            .map_err(|_| Error::Timeout(self.inner.cfg.fetch_timeout))??;

        validate_block(block_num, &raw, source.as_str(), Utc::now())
    }

    /// Probe `GET /api/health` on every configured peer.
    pub async fn probe_health(&self) -> Vec<PeerStatus> {
        for peer in &self.inner.peers {
            let healthy = match peer.base.join("api/health") {
                Ok(url) => {
                    let probe = self.inner.http.get(url).send();
                    match tokio::time::timeout(self.inner.cfg.health_timeout, probe).await {
                        Ok(Ok(resp)) => resp.status().is_success(),
                        _ => false,
                    }
                }
                Err(_) => false,
            };
            peer.health.lock().unwrap().0 = healthy;
        }
        self.peer_status()
    }
}

/// Validate a peer's block response and normalize it into a `BlockRecord`.
///
/// Peers disagree on field spellings; the declared block number is accepted
/// as `blockNum`, `block_num`, or `num`, and the operation list as
/// `operations` or `ops`.
fn validate_block(
    requested: u64,
    raw: &Value,
    source: &str,
    now: DateTime<Utc>,
) -> Result<BlockRecord> {
    let obj = raw
        .as_object()
        .filter(|obj| !obj.is_empty())
        .ok_or(Error::InvalidBlock("response is not a non-empty object"))?;

    let declared = ["blockNum", "block_num", "num"]
        .iter()
        .find_map(|name| obj.get(*name)?.as_u64())
        .ok_or(Error::InvalidBlock("missing block number"))?;
    if declared != requested {
        return Err(Error::InvalidBlock("block number mismatch"));
    }

    let raw_ops = obj
        .get("operations")
        .or_else(|| obj.get("ops"))
        .and_then(Value::as_array)
        .ok_or(Error::InvalidBlock("missing operations list"))?;

    let operations = raw_ops
        .iter()
        .filter_map(|op| models::normalize_block_op(op, now))
        .collect();

    Ok(BlockRecord {
        block_num: declared,
        block_hash: ["blockHash", "block_hash", "hash"]
            .iter()
            .find_map(|name| obj.get(*name)?.as_str().map(str::to_string)),
        timestamp: obj
            .get("timestamp")
            .and_then(|ts| serde_json::from_value(ts.clone()).ok()),
        operations,
        source: source.to_string(),
        fetched_at: now,
    })
}
