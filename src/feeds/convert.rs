//! OKX contract-size conversion.
//!
//! OKX reports liquidation sizes in exchange-defined contracts. The USDT
//! notional needs the per-contract coin face value, which is constant for
//! the lifetime of a contract — so one successful REST resolution per
//! contract id is enough forever. The learned ratios are cached in memory
//! and persisted as a JSON object so restarts never re-ask.

use dashmap::DashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

/// Concurrent REST lookups allowed during bootstrap bursts.
const MAX_CONCURRENT_LOOKUPS: usize = 2;
const MAX_ATTEMPTS: u64 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rate limited")]
    RateLimited,
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("exchange API error code {code}: {msg}")]
    Api { code: String, msg: String },
    #[error("empty conversion response")]
    EmptyResponse,
    #[error("unusable size field: {0}")]
    BadSize(String),
    #[error("non-positive conversion ratio: {0}")]
    BadRatio(f64),
    #[error("conversion gave up after {0} attempts")]
    Exhausted(u64),
}

/// Persistent map from contract id to coin-per-contract ratio.
pub struct ConversionCache {
    path: PathBuf,
    ratios: DashMap<String, f64>,
    persist_lock: Mutex<()>,
}

impl ConversionCache {
    /// Load the cache file if present; a missing or unreadable file starts
    /// an empty cache.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let ratios = DashMap::new();
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<BTreeMap<String, f64>>(&contents) {
                Ok(map) => {
                    for (contract, ratio) in map {
                        ratios.insert(contract, ratio);
                    }
                    info!("Loaded {} contract ratios from {}", ratios.len(), path.display());
                }
                Err(e) => {
                    warn!("Unreadable ratio cache {}: {e}; starting empty", path.display());
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Could not open ratio cache {}: {e}; starting empty", path.display());
            }
        }
        Self {
            path,
            ratios,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn lookup(&self, contract_id: &str) -> Option<f64> {
        self.ratios.get(contract_id).map(|r| *r)
    }

    pub fn len(&self) -> usize {
        self.ratios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratios.is_empty()
    }

    /// Insert a ratio and rewrite the cache file. The whole-file rewrite is
    /// serialized against concurrent puts.
    pub async fn put(&self, contract_id: &str, ratio: f64) -> std::io::Result<()> {
        self.ratios.insert(contract_id.to_string(), ratio);
        let _guard = self.persist_lock.lock().await;
        let snapshot: BTreeMap<String, f64> = self
            .ratios
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, json)
    }
}

#[derive(Debug, Default)]
pub struct ConvertStats {
    rest_calls: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
}

impl ConvertStats {
    pub fn rest_calls(&self) -> u64 {
        self.rest_calls.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> String {
        format!(
            "rest_calls={} cache_hits={} failures={}",
            self.rest_calls(),
            self.cache_hits(),
            self.failures(),
        )
    }
}

/// Resolves contract sizes to base-coin quantities, caching ratios forever.
pub struct ContractConverter {
    http: reqwest::Client,
    rest_url: String,
    cache: ConversionCache,
    limiter: Semaphore,
    stats: ConvertStats,
}

#[derive(Debug, Deserialize)]
struct ConvertResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<ConvertData>,
}

#[derive(Debug, Deserialize)]
struct ConvertData {
    sz: String,
}

impl ContractConverter {
    pub fn new(rest_url: impl Into<String>, cache: ConversionCache) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");
        Self {
            http,
            rest_url: rest_url.into(),
            cache,
            limiter: Semaphore::new(MAX_CONCURRENT_LOOKUPS),
            stats: ConvertStats::default(),
        }
    }

    pub fn stats(&self) -> &ConvertStats {
        &self.stats
    }

    /// Convert a raw contract size to base-coin quantity.
    ///
    /// `sz` and `px` are passed through to the REST endpoint exactly as they
    /// arrived on the wire. A cached contract never touches the network; a
    /// miss takes a semaphore permit, retries up to three times, then gives
    /// up on that event.
    pub async fn to_coin(&self, contract_id: &str, sz: &str, px: &str) -> Result<f64, ConvertError> {
        let size: f64 = sz
            .trim()
            .parse()
            .map_err(|_| ConvertError::BadSize(sz.to_string()))?;
        if !(size > 0.0) {
            return Err(ConvertError::BadSize(sz.to_string()));
        }

        if let Some(ratio) = self.cache.lookup(contract_id) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(size * ratio);
        }

        let _permit = self
            .limiter
            .acquire()
            .await
            .expect("converter semaphore closed");

        // Another event for the same contract may have resolved it while we
        // waited for a permit.
        if let Some(ratio) = self.cache.lookup(contract_id) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(size * ratio);
        }

        self.stats.rest_calls.fetch_add(1, Ordering::Relaxed);
        for attempt in 1..=MAX_ATTEMPTS {
            match self.request_ratio(contract_id, sz, px, size).await {
                Ok(ratio) => {
                    if let Err(e) = self.cache.put(contract_id, ratio).await {
                        warn!("Failed to persist ratio cache: {e}");
                    }
                    info!(
                        "Learned contract ratio: {contract_id} = {ratio:.8} coin/contract ({} cached)",
                        self.cache.len()
                    );
                    return Ok(size * ratio);
                }
                Err(ConvertError::RateLimited) => {
                    warn!("Convert endpoint rate limited (attempt {attempt}/{MAX_ATTEMPTS})");
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
                    }
                }
                Err(e) => {
                    warn!("Convert attempt {attempt}/{MAX_ATTEMPTS} failed for {contract_id}: {e}");
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(500 * attempt)).await;
                    }
                }
            }
        }

        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        Err(ConvertError::Exhausted(MAX_ATTEMPTS))
    }

    async fn request_ratio(
        &self,
        contract_id: &str,
        sz: &str,
        px: &str,
        size: f64,
    ) -> Result<f64, ConvertError> {
        let url = format!("{}/api/v5/public/convert-contract-coin", self.rest_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("type", "2"), ("instId", contract_id), ("sz", sz), ("px", px)])
            .send()
            .await?;

        if resp.status().as_u16() == 429 {
            return Err(ConvertError::RateLimited);
        }
        if !resp.status().is_success() {
            return Err(ConvertError::Status(resp.status().as_u16()));
        }

        let body: ConvertResponse = resp.json().await?;
        if body.code != "0" {
            return Err(ConvertError::Api {
                code: body.code,
                msg: body.msg,
            });
        }
        let data = body.data.first().ok_or(ConvertError::EmptyResponse)?;
        let converted: f64 = data
            .sz
            .parse()
            .map_err(|_| ConvertError::BadSize(data.sz.clone()))?;

        let ratio = converted / size;
        if !(ratio > 0.0 && ratio.is_finite()) {
            return Err(ConvertError::BadRatio(ratio));
        }
        Ok(ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConversionCache::load(dir.path().join("ratios.json"));
        assert!(cache.is_empty());
        assert_eq!(cache.lookup("BTC-USDT-SWAP"), None);
    }

    #[tokio::test]
    async fn test_cache_put_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratios.json");

        let cache = ConversionCache::load(&path);
        cache.put("BTC-USDT-SWAP", 0.01).await.unwrap();
        cache.put("ETH-USDT-SWAP", 0.1).await.unwrap();

        let reloaded = ConversionCache::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.lookup("BTC-USDT-SWAP"), Some(0.01));
        assert_eq!(reloaded.lookup("ETH-USDT-SWAP"), Some(0.1));
    }

    #[tokio::test]
    async fn test_cache_tolerates_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratios.json");
        std::fs::write(&path, "not json at all").unwrap();
        let cache = ConversionCache::load(&path);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cached_contract_converts_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConversionCache::load(dir.path().join("ratios.json"));
        cache.put("ETH-USDT-SWAP", 0.01).await.unwrap();

        // The REST URL is unroutable: a cache hit must never touch it
        let converter = ContractConverter::new("http://127.0.0.1:1", cache);
        let coins = converter.to_coin("ETH-USDT-SWAP", "50", "2100").await.unwrap();
        assert!((coins - 0.5).abs() < 1e-12);
        assert_eq!(converter.stats().cache_hits(), 1);
        assert_eq!(converter.stats().rest_calls(), 0);
    }

    #[tokio::test]
    async fn test_rest_miss_learns_and_caches_ratio() {
        // Local stand-in for the convert endpoint: 10 contracts → 0.1 coin
        let app = axum::Router::new().route(
            "/api/v5/public/convert-contract-coin",
            axum::routing::get(|| async {
                axum::Json(serde_json::json!({
                    "code": "0",
                    "msg": "",
                    "data": [{"type": "2", "instId": "ETH-USDT-SWAP", "px": "2000", "sz": "0.1", "unit": "coin"}]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratios.json");
        let converter =
            ContractConverter::new(format!("http://{addr}"), ConversionCache::load(&path));

        let coins = converter.to_coin("ETH-USDT-SWAP", "10", "2000").await.unwrap();
        assert!((coins - 0.1).abs() < 1e-12);
        assert_eq!(converter.stats().rest_calls(), 1);

        server.abort();

        // Same contract again: served from cache, no further REST traffic
        let coins = converter.to_coin("ETH-USDT-SWAP", "50", "2100").await.unwrap();
        assert!((coins - 0.5).abs() < 1e-12);
        assert_eq!(converter.stats().rest_calls(), 1);
        assert_eq!(converter.stats().cache_hits(), 1);

        // And the learned ratio survives a restart
        let reloaded = ConversionCache::load(&path);
        assert!((reloaded.lookup("ETH-USDT-SWAP").unwrap() - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_unparseable_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConversionCache::load(dir.path().join("ratios.json"));
        let converter = ContractConverter::new("http://127.0.0.1:1", cache);
        assert!(matches!(
            converter.to_coin("ETH-USDT-SWAP", "lots", "2100").await,
            Err(ConvertError::BadSize(_))
        ));
        assert!(matches!(
            converter.to_coin("ETH-USDT-SWAP", "0", "2100").await,
            Err(ConvertError::BadSize(_))
        ));
    }
}
