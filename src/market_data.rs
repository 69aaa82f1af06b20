//! Market Data Cache & Risk Scorer
//!
//! Wraps a ticker provider behind a TTL cache, derives one normalized
//! `MarketSnapshot` per market and tracks per-source freshness (age of the
//! last WS message vs the last REST fetch). Staleness is a soft signal for
//! the strategy/risk layer; provider failures propagate to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::models::{CacheMetadata, MarketSnapshot, RiskLevel};
use crate::providers::{extract, MarketDataProvider};

const EPSILON: f64 = 1e-9;

fn epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Default)]
struct FreshnessInner {
    last_ws_epoch: Option<f64>,
    last_rest_epoch: Option<f64>,
}

/// Shared per-source freshness ledger. The order streamer records WS message
/// arrivals; the market data service records REST fetches and reads both.
#[derive(Clone, Default)]
pub struct FreshnessTracker {
    inner: Arc<RwLock<FreshnessInner>>,
}

impl FreshnessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ws_message(&self) {
        self.inner.write().last_ws_epoch = Some(epoch_secs());
    }

    pub fn record_rest_fetch(&self) {
        self.inner.write().last_rest_epoch = Some(epoch_secs());
    }

    pub fn last_ws_epoch(&self) -> Option<f64> {
        self.inner.read().last_ws_epoch
    }

    pub fn last_rest_epoch(&self) -> Option<f64> {
        self.inner.read().last_rest_epoch
    }

    pub fn ws_age_secs(&self) -> Option<f64> {
        self.last_ws_epoch().map(|ts| (epoch_secs() - ts).max(0.0))
    }

    #[cfg(test)]
    pub(crate) fn set_ws_epoch(&self, epoch: f64) {
        self.inner.write().last_ws_epoch = Some(epoch);
    }
}

struct CacheEntry {
    snapshots: Vec<MarketSnapshot>,
    fetched_at: Instant,
}

/// Risk-band thresholds: HIGH at `score >= high`, MEDIUM at `score >= mid`.
#[derive(Debug, Clone, Copy)]
pub struct RiskThresholds {
    pub mid: f64,
    pub high: f64,
}

impl RiskThresholds {
    pub fn new(mid: f64, high: f64) -> Self {
        let mid = mid.clamp(0.0, 1.0);
        Self {
            mid,
            high: high.clamp(0.0, 1.0).max(mid),
        }
    }

    fn classify(&self, score: f64) -> RiskLevel {
        if score >= self.high {
            RiskLevel::High
        } else if score >= self.mid {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

pub struct MarketDataService {
    provider: Arc<dyn MarketDataProvider>,
    freshness: FreshnessTracker,
    thresholds: RiskThresholds,
    fetch_limit: usize,
    cache_ttl: Duration,
    ws_stale_secs: f64,
    offline_mode: bool,
    cache: RwLock<Option<CacheEntry>>,
    metadata: RwLock<CacheMetadata>,
    // Serializes concurrent refreshes so a burst of callers costs one fetch.
    fetch_lock: tokio::sync::Mutex<()>,
}

impl MarketDataService {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        freshness: FreshnessTracker,
        thresholds: RiskThresholds,
        fetch_limit: usize,
        cache_ttl: Duration,
        ws_stale_secs: f64,
        offline_mode: bool,
    ) -> Self {
        Self {
            provider,
            freshness,
            thresholds,
            fetch_limit,
            cache_ttl,
            ws_stale_secs,
            offline_mode,
            cache: RwLock::new(None),
            metadata: RwLock::new(CacheMetadata::default()),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn freshness(&self) -> FreshnessTracker {
        self.freshness.clone()
    }

    /// Latest normalized snapshots, served from cache within the TTL.
    /// `force_refresh` bypasses the cache unconditionally. Provider failures
    /// propagate; the cache never masks a hard fetch error.
    pub async fn get_snapshots(&self, force_refresh: bool) -> Result<Vec<MarketSnapshot>> {
        if !force_refresh {
            if let Some(snapshots) = self.cached() {
                return Ok(snapshots);
            }
        }

        let _guard = self.fetch_lock.lock().await;
        if !force_refresh {
            if let Some(snapshots) = self.cached() {
                return Ok(snapshots);
            }
        }
        self.fetch_and_build().await
    }

    /// Synchronous variant with identical behaviour, for non-async callers.
    pub fn get_snapshots_blocking(&self, force_refresh: bool) -> Result<Vec<MarketSnapshot>> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build blocking runtime")?;
        rt.block_on(self.get_snapshots(force_refresh))
    }

    /// Freshness and fallback state of the most recent fetch attempt.
    pub fn cache_metadata(&self) -> CacheMetadata {
        let mut meta = self.metadata.read().clone();
        if let Some(entry) = self.cache.read().as_ref() {
            meta.age_s = entry.fetched_at.elapsed().as_secs_f64();
            meta.count = entry.snapshots.len();
        }
        meta
    }

    fn cached(&self) -> Option<Vec<MarketSnapshot>> {
        let cache = self.cache.read();
        let entry = cache.as_ref()?;
        (entry.fetched_at.elapsed() <= self.cache_ttl).then(|| entry.snapshots.clone())
    }

    async fn fetch_and_build(&self) -> Result<Vec<MarketSnapshot>> {
        let started = Instant::now();
        let rows = self.provider.fetch_markets(self.fetch_limit).await?;
        self.freshness.record_rest_fetch();

        let snapshots: Vec<MarketSnapshot> = rows
            .into_iter()
            .map(|row| self.build_snapshot(row))
            .collect();

        let mut meta = CacheMetadata {
            count: snapshots.len(),
            age_s: 0.0,
            ttl: self.cache_ttl.as_secs_f64(),
            last_rest_fetch_epoch: self.freshness.last_rest_epoch(),
            last_ws_message_epoch: self.freshness.last_ws_epoch(),
            fallback: false,
            reason: None,
        };

        if !self.offline_mode {
            if let Some(ws_age) = self.freshness.ws_age_secs() {
                if ws_age > self.ws_stale_secs {
                    warn!(
                        ws_age_s = format!("{ws_age:.0}").as_str(),
                        "WS channel stale; marking fetch as fallback"
                    );
                    meta.fallback = true;
                    meta.reason = Some("stale_ws".to_string());
                }
            }
        }

        *self.metadata.write() = meta;
        *self.cache.write() = Some(CacheEntry {
            snapshots: snapshots.clone(),
            fetched_at: Instant::now(),
        });

        info!(
            markets = snapshots.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Market fetch completed"
        );
        Ok(snapshots)
    }

    /// Normalize one raw provider row into an immutable snapshot, enriching
    /// the passthrough map with every derived field.
    fn build_snapshot(&self, mut raw: Map<String, Value>) -> MarketSnapshot {
        let row = Value::Object(raw.clone());

        let market_id = extract::first_str(&row, extract::MARKET_ID_KEYS)
            .unwrap_or_else(|| "unknown".to_string());

        let yes_price = extract::first_f64(&row, extract::YES_PRICE_KEYS)
            .or_else(|| token_price(&row))
            .unwrap_or(0.5);

        let bid = extract::first_f64(&row, extract::BID_KEYS)
            .unwrap_or(yes_price)
            .max(0.0);
        let ask = extract::first_f64(&row, extract::ASK_KEYS)
            .unwrap_or(yes_price)
            .max(bid);
        let spread = ask - bid;

        let volatility = extract::first_f64(&row, extract::VOLATILITY_KEYS)
            .map(|v| v.max(0.0))
            .or(Some(yes_price * (1.0 - yes_price)));

        let risk_score = score_market(spread, ask, volatility);
        let risk_level = self.thresholds.classify(risk_score);

        let no_price = 1.0 - yes_price;
        let mid_price = (bid + ask) / 2.0;
        raw.insert("market_id".into(), Value::String(market_id.clone()));
        raw.insert("bid".into(), json_f64(bid));
        raw.insert("ask".into(), json_f64(ask));
        raw.insert("spread".into(), json_f64(spread));
        raw.insert("mid_price".into(), json_f64(mid_price));
        raw.insert("yes_price".into(), json_f64(yes_price));
        raw.insert("no_price".into(), json_f64(no_price));
        if let Some(vol) = volatility {
            raw.insert("volatility".into(), json_f64(vol));
        }
        raw.insert("risk_score".into(), json_f64(risk_score));
        raw.insert(
            "risk_level".into(),
            Value::String(risk_level.as_str().to_string()),
        );

        debug!(
            market_id = market_id.as_str(),
            risk_score,
            risk_level = risk_level.as_str(),
            "built snapshot"
        );

        MarketSnapshot {
            market_id,
            bid,
            ask,
            spread,
            volatility,
            risk_score,
            risk_level,
            raw,
        }
    }
}

/// `min(1, 0.6·min(1, spread/ask) + 0.4·min(1, volatility))`, 4 decimals.
fn score_market(spread: f64, ask: f64, volatility: Option<f64>) -> f64 {
    let spread_component = (spread / ask.max(EPSILON)).clamp(0.0, 1.0);
    let vol_component = volatility.unwrap_or(0.0).clamp(0.0, 1.0);
    round4((0.6 * spread_component + 0.4 * vol_component).min(1.0))
}

fn json_f64(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn token_price(row: &Value) -> Option<f64> {
    row.get("tokens")?
        .as_array()?
        .first()
        .and_then(|token| token.get("price"))
        .and_then(extract::as_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        rows: Vec<Value>,
    }

    impl CountingProvider {
        fn new(rows: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                rows,
            })
        }
    }

    #[async_trait]
    impl MarketDataProvider for CountingProvider {
        async fn fetch_markets(&self, _limit: usize) -> Result<Vec<Map<String, Value>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .rows
                .iter()
                .filter_map(|r| r.as_object().cloned())
                .collect())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl MarketDataProvider for FailingProvider {
        async fn fetch_markets(&self, _limit: usize) -> Result<Vec<Map<String, Value>>> {
            Err(anyhow::anyhow!("venue unreachable"))
        }
    }

    fn service(provider: Arc<dyn MarketDataProvider>, mid: f64, high: f64) -> MarketDataService {
        MarketDataService::new(
            provider,
            FreshnessTracker::new(),
            RiskThresholds::new(mid, high),
            10,
            Duration::from_secs(30),
            120.0,
            true,
        )
    }

    fn sample_row() -> Value {
        json!({"market_id": "M1", "bid": 0.45, "ask": 0.55, "volatility": 0.2})
    }

    #[tokio::test]
    async fn snapshot_round_trip_derives_spread_and_mid() {
        let provider = CountingProvider::new(vec![sample_row()]);
        let svc = service(provider, 0.15, 0.7);
        let snaps = svc.get_snapshots(false).await.unwrap();
        assert_eq!(snaps.len(), 1);
        let snap = &snaps[0];
        assert!((snap.spread - 0.10).abs() < 1e-9);
        assert!((snap.mid_price() - 0.50).abs() < 1e-9);
        // 0.6 * (0.10/0.55) + 0.4 * 0.2 = 0.1891
        assert!((snap.risk_score - 0.1891).abs() < 1e-9);
        assert_eq!(snap.risk_level, RiskLevel::Medium);
        assert_eq!(snap.raw.get("mid_price").and_then(Value::as_f64), Some(0.5));
    }

    #[tokio::test]
    async fn cache_hit_within_ttl_skips_second_fetch() {
        let provider = CountingProvider::new(vec![sample_row()]);
        let svc = service(provider.clone(), 0.4, 0.7);

        let first = svc.get_snapshots(false).await.unwrap();
        let second = svc.get_snapshots(false).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first[0].risk_score, second[0].risk_score);
        assert_eq!(first[0].risk_level, second[0].risk_level);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_cache() {
        let provider = CountingProvider::new(vec![sample_row()]);
        let svc = service(provider.clone(), 0.4, 0.7);
        svc.get_snapshots(false).await.unwrap();
        svc.get_snapshots(true).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn provider_failure_propagates() {
        let svc = service(Arc::new(FailingProvider), 0.4, 0.7);
        let err = svc.get_snapshots(false).await.unwrap_err();
        assert!(err.to_string().contains("venue unreachable"));
    }

    #[tokio::test]
    async fn stale_ws_marks_fetch_as_fallback() {
        let provider = CountingProvider::new(vec![sample_row()]);
        let freshness = FreshnessTracker::new();
        freshness.set_ws_epoch(epoch_secs() - 600.0);
        let svc = MarketDataService::new(
            provider,
            freshness,
            RiskThresholds::new(0.4, 0.7),
            10,
            Duration::from_secs(30),
            120.0,
            false,
        );
        svc.get_snapshots(false).await.unwrap();
        let meta = svc.cache_metadata();
        assert!(meta.fallback);
        assert_eq!(meta.reason.as_deref(), Some("stale_ws"));
    }

    #[test]
    fn blocking_variant_matches_async() {
        let provider = CountingProvider::new(vec![sample_row()]);
        let svc = service(provider.clone(), 0.4, 0.7);
        let snaps = svc.get_snapshots_blocking(false).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        // Second call inside the TTL is a cache hit, same as the async path.
        let again = svc.get_snapshots_blocking(false).unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(snaps[0].risk_score, again[0].risk_score);
    }

    #[test]
    fn missing_quotes_fall_back_to_yes_price() {
        let provider = CountingProvider::new(vec![json!({
            "condition_id": "0xabc",
            "tokens": [{"token_id": "t1", "price": 0.62}],
        })]);
        let svc = service(provider, 0.4, 0.7);
        let snaps = svc.get_snapshots_blocking(false).unwrap();
        let snap = &snaps[0];
        assert_eq!(snap.market_id, "0xabc");
        assert!((snap.bid - 0.62).abs() < 1e-9);
        assert!((snap.ask - 0.62).abs() < 1e-9);
        // volatility defaults to p·(1-p)
        assert!((snap.volatility.unwrap() - 0.62 * 0.38).abs() < 1e-9);
    }
}
