//! Offline fixture markets for tests, simulation runs and air-gapped dev.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Map, Value};

use crate::providers::MarketDataProvider;

/// Deterministic base rows with optional per-fetch bid/ask jitter so repeated
/// simulation cycles see small price movement.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    jitter: f64,
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self { jitter: 0.0 }
    }

    pub fn with_jitter(jitter: f64) -> Self {
        Self {
            jitter: jitter.clamp(0.0, 0.05),
        }
    }

    fn base_rows() -> Vec<Value> {
        vec![
            json!({
                "market_id": "SIM-1",
                "bid": 0.45,
                "ask": 0.55,
                "high": 0.60,
                "low": 0.40,
                "volatility": 0.10,
                "volume_24h": 5000,
                "price_change_24h": 0.04,
            }),
            json!({
                "market_id": "SIM-2",
                "bid": 0.30,
                "ask": 0.35,
                "high": 0.36,
                "low": 0.29,
                "volatility": 0.05,
                "volume_24h": 8000,
                "price_change_24h": -0.03,
            }),
        ]
    }
}

impl Default for FixtureProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for FixtureProvider {
    async fn fetch_markets(&self, limit: usize) -> Result<Vec<Map<String, Value>>> {
        let mut rng = rand::thread_rng();
        let rows = Self::base_rows()
            .into_iter()
            .take(limit)
            .filter_map(|row| row.as_object().cloned())
            .map(|mut row| {
                if self.jitter > 0.0 {
                    let shift: f64 = rng.gen_range(-self.jitter..=self.jitter);
                    for key in ["bid", "ask"] {
                        if let Some(v) = row.get(key).and_then(Value::as_f64) {
                            row.insert(key.to_string(), json!((v + shift).clamp(0.01, 0.99)));
                        }
                    }
                }
                row
            })
            .collect();
        Ok(rows)
    }
}
