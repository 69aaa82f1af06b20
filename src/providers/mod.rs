//! Ingestion provider adapters.
//!
//! Every upstream data source is behind a small trait so the runtime can run
//! against the live venue, a fixture set, or a test double. All adapters are
//! treated as fallible and as potentially returning partial/missing fields.

pub mod extract;
pub mod fixtures;
pub mod rest;
pub mod stream;

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde_json::{Map, Value};

pub use fixtures::FixtureProvider;
pub use rest::{ClobOrdersClient, ClobRestProvider};
pub use stream::ClobUserStream;

/// Raw market rows from a ticker source.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_markets(&self, limit: usize) -> Result<Vec<Map<String, Value>>>;
}

/// Stream of raw order-event payloads from the private user channel.
pub type OrderEventStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

#[async_trait]
pub trait OrderStreamProvider: Send + Sync {
    /// Open a subscription for the given markets. The returned stream ends on
    /// a graceful close and yields `Err` on connection-level failures.
    async fn subscribe(&self, market_ids: &[String]) -> Result<OrderEventStream>;
}

/// Paged access to the open-orders list used by the REST fallback channel.
#[async_trait]
pub trait OpenOrdersApi: Send + Sync {
    /// Fetch one page of orders. The payload shape is venue-specific; callers
    /// locate the order list and pagination cursor via candidate-key lookup.
    async fn fetch_open_orders(&self, cursor: Option<&str>) -> Result<Value>;
}
