//! CLOB REST providers for market tickers and the open-orders fallback.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};

use crate::config::ApiCredentials;
use crate::providers::{extract, MarketDataProvider, OpenOrdersApi};

fn build_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .context("Failed to build REST client")
}

/// Public market ticker source.
#[derive(Clone)]
pub struct ClobRestProvider {
    client: Client,
    base_url: String,
}

impl ClobRestProvider {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MarketDataProvider for ClobRestProvider {
    async fn fetch_markets(&self, limit: usize) -> Result<Vec<Map<String, Value>>> {
        let url = format!("{}/markets", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("limit", limit.to_string())])
            .send()
            .await
            .context("GET /markets failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET /markets {}: {}", status, text));
        }

        let payload: Value = resp
            .json()
            .await
            .context("Failed to parse markets response")?;

        let rows = extract::extract_list(&payload, &["data", "markets"])
            .context("markets response carried no market list")?;

        Ok(rows
            .iter()
            .filter_map(|row| row.as_object().cloned())
            .take(limit)
            .collect())
    }
}

/// Authenticated open-orders endpoint for the REST fallback channel.
#[derive(Clone)]
pub struct ClobOrdersClient {
    client: Client,
    base_url: String,
    credentials: ApiCredentials,
}

impl ClobOrdersClient {
    pub fn new(base_url: &str, credentials: ApiCredentials) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }
}

#[async_trait]
impl OpenOrdersApi for ClobOrdersClient {
    async fn fetch_open_orders(&self, cursor: Option<&str>) -> Result<Value> {
        let url = format!("{}/data/orders", self.base_url);
        let mut req = self.client.get(&url);
        if let Some(key) = &self.credentials.api_key {
            req = req.header("POLY-API-KEY", key);
        }
        if let Some(passphrase) = &self.credentials.api_passphrase {
            req = req.header("POLY-PASSPHRASE", passphrase);
        }
        if let Some(cursor) = cursor {
            req = req.query(&[("next_cursor", cursor)]);
        }

        let resp = req.send().await.context("GET /data/orders failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET /data/orders {}: {}", status, text));
        }

        resp.json::<Value>()
            .await
            .context("Failed to parse orders response")
    }
}
