//! Order Lifecycle Streamer (WebSocket channel)
//!
//! Long-lived subscription to private order/fill events. Owns reconnect and
//! backoff, exposes a health state machine
//! (`disabled → starting → healthy ⇄ degraded → stopped`) and a private
//! fill-delta ledger so repeated snapshot pushes of the same fill state never
//! produce duplicate trade records.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::market_data::FreshnessTracker;
use crate::models::{EventSource, OrderEvent, TradeRecord};
use crate::orders::{classify_event, FillLedger, OrderStore};
use crate::providers::{extract, OrderStreamProvider};

fn epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disabled,
    Starting,
    Healthy,
    Degraded,
    Stopped,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Disabled => "disabled",
            ChannelState::Starting => "starting",
            ChannelState::Healthy => "healthy",
            ChannelState::Degraded => "degraded",
            ChannelState::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
struct StatusInner {
    state: ChannelState,
    reason: Option<String>,
    failures: u64,
    assets: usize,
    last_success_epoch: Option<f64>,
    last_error_epoch: Option<f64>,
    last_error: Option<String>,
}

impl StatusInner {
    fn new(state: ChannelState, reason: Option<String>) -> Self {
        Self {
            state,
            reason,
            failures: 0,
            assets: 0,
            last_success_epoch: None,
            last_error_epoch: None,
            last_error: None,
        }
    }
}

type SharedStatus = Arc<RwLock<StatusInner>>;

pub struct OrderLifecycleStreamer {
    provider: Arc<dyn OrderStreamProvider>,
    store: OrderStore,
    freshness: FreshnessTracker,
    enabled: bool,
    has_credentials: bool,
    cooldown: Duration,
    asset_limit: usize,
    status: SharedStatus,
    markets: RwLock<Vec<String>>,
    shutdown: RwLock<Option<watch::Sender<bool>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OrderLifecycleStreamer {
    pub fn new(
        provider: Arc<dyn OrderStreamProvider>,
        store: OrderStore,
        freshness: FreshnessTracker,
        enabled: bool,
        has_credentials: bool,
        cooldown: Duration,
        asset_limit: usize,
    ) -> Self {
        let initial = if enabled && has_credentials {
            StatusInner::new(ChannelState::Stopped, None)
        } else if !enabled {
            StatusInner::new(ChannelState::Disabled, Some("ws_disabled".to_string()))
        } else {
            StatusInner::new(
                ChannelState::Disabled,
                Some("missing_credentials".to_string()),
            )
        };
        Self {
            provider,
            store,
            freshness,
            enabled,
            has_credentials,
            cooldown,
            asset_limit,
            status: Arc::new(RwLock::new(initial)),
            markets: RwLock::new(Vec::new()),
            shutdown: RwLock::new(None),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Begin streaming for the given markets. Disabled configurations stay
    /// inert: that is a state with a reason, not an error.
    pub async fn start(&self, market_ids: &[String]) -> Result<()> {
        let markets = dedupe_capped(market_ids, self.asset_limit);
        if !self.enabled {
            info!("Order WS streamer disabled by flag");
            return Ok(());
        }
        if !self.has_credentials {
            info!("Order WS streamer disabled: API credentials not provided");
            return Ok(());
        }
        if markets.is_empty() {
            debug!("Order WS streamer not started: no markets");
            return Ok(());
        }

        self.halt_task().await;
        *self.markets.write() = markets.clone();
        {
            let mut status = self.status.write();
            status.state = ChannelState::Starting;
            status.reason = None;
            status.assets = markets.len();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.write() = Some(shutdown_tx);

        let provider = self.provider.clone();
        let store = self.store.clone();
        let freshness = self.freshness.clone();
        let status = self.status.clone();
        let cooldown = self.cooldown;
        let handle = tokio::spawn(async move {
            run_stream_loop(provider, store, freshness, status, markets, cooldown, shutdown_rx)
                .await;
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Cancel the background task and close the socket, suppressing errors
    /// encountered purely during teardown.
    pub async fn stop(&self) {
        self.halt_task().await;
        let mut status = self.status.write();
        if status.state != ChannelState::Disabled {
            status.state = ChannelState::Stopped;
        }
    }

    /// Changing the tracked set tears down and restarts the streaming task;
    /// patching a live subscription risks partial-subscription states.
    pub async fn update_markets(&self, market_ids: &[String]) -> Result<()> {
        let next = dedupe_capped(market_ids, self.asset_limit);
        if *self.markets.read() == next {
            return Ok(());
        }
        info!(assets = next.len(), "Order WS subscription set changed; restarting");
        self.start(&next).await
    }

    pub fn get_status(&self) -> Value {
        let status = self.status.read();
        serde_json::json!({
            "status": status.state.as_str(),
            "reason": status.reason,
            "failures": status.failures,
            "assets": status.assets,
            "last_success_epoch": status.last_success_epoch,
            "last_error_epoch": status.last_error_epoch,
            "last_error": status.last_error,
        })
    }

    async fn halt_task(&self) {
        if let Some(tx) = self.shutdown.write().take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn run_stream_loop(
    provider: Arc<dyn OrderStreamProvider>,
    store: OrderStore,
    freshness: FreshnessTracker,
    status: SharedStatus,
    markets: Vec<String>,
    cooldown: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ledger = FillLedger::new();
    loop {
        {
            let mut st = status.write();
            st.state = ChannelState::Starting;
        }

        let subscribed = tokio::select! {
            _ = shutdown.changed() => return,
            result = provider.subscribe(&markets) => result,
        };

        match subscribed {
            Ok(mut stream) => loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    item = stream.next() => match item {
                        Some(Ok(payload)) => {
                            handle_payload(&payload, &store, &freshness, &status, &mut ledger);
                        }
                        Some(Err(e)) => {
                            record_failure(&status, &format!("{e:#}"));
                            break;
                        }
                        None => {
                            record_failure(&status, "stream_ended");
                            break;
                        }
                    }
                }
            },
            Err(e) => record_failure(&status, &format!("{e:#}")),
        }

        // Unbounded retry: sleep the cooldown, then reconnect, unless stopped.
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(cooldown) => {}
        }
    }
}

fn record_failure(status: &SharedStatus, error: &str) {
    let mut st = status.write();
    st.state = ChannelState::Degraded;
    st.failures += 1;
    st.last_error = Some(error.to_string());
    st.last_error_epoch = Some(epoch_secs());
    warn!(error, failures = st.failures, "Order WS degraded; will retry");
}

fn handle_payload(
    payload: &Value,
    store: &OrderStore,
    freshness: &FreshnessTracker,
    status: &SharedStatus,
    ledger: &mut FillLedger,
) {
    freshness.record_ws_message();
    {
        let mut st = status.write();
        st.state = ChannelState::Healthy;
        st.reason = None;
        st.last_success_epoch = Some(epoch_secs());
    }

    // The user channel pushes both single events and event batches.
    match payload {
        Value::Array(rows) => {
            for row in rows {
                normalize_and_record(row, store, ledger);
            }
        }
        row => normalize_and_record(row, store, ledger),
    }
}

/// Best-effort normalization of one raw payload into the canonical model.
/// Malformed rows are dropped rather than corrupting the log.
fn normalize_and_record(row: &Value, store: &OrderStore, ledger: &mut FillLedger) {
    let Some(order_id) = extract::first_str(row, extract::ORDER_ID_KEYS) else {
        debug!("dropping order payload without an order id");
        return;
    };

    let market_id = extract::first_str(row, extract::ORDER_MARKET_KEYS);
    let action = extract::first_str(row, extract::SIDE_KEYS).map(|s| s.to_ascii_lowercase());
    let size = extract::first_f64(row, extract::SIZE_KEYS);
    let filled = extract::first_f64(row, extract::FILLED_KEYS);
    let price = extract::first_f64(row, extract::PRICE_KEYS);
    let timestamp = extract::first_f64(row, extract::TIMESTAMP_KEYS).unwrap_or_else(epoch_secs);

    let kind = classify_event(row, filled, size);
    let status_label = extract::first_str(row, extract::STATUS_KEYS)
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| kind.as_str().to_string());

    let event = OrderEvent {
        timestamp,
        event: kind,
        order_id: order_id.clone(),
        market_id: market_id.clone(),
        action: action.clone(),
        size,
        filled_size: filled,
        price,
        status: status_label.clone(),
        source: EventSource::Ws,
    };
    if let Err(e) = store.append_order(&event) {
        warn!(error = %e, "failed to append ws order event");
        return;
    }

    if kind.is_fill() {
        if let Some(delta) = ledger.advance(&order_id, &status_label, filled, size) {
            let Some(price) = price else {
                debug!(order_id = order_id.as_str(), "fill delta without a price; skipping trade");
                return;
            };
            let trade = TradeRecord {
                timestamp,
                order_id,
                market_id,
                action,
                filled_shares: delta,
                average_price: price,
                notional: delta * price,
                status: kind.as_str().to_string(),
                execution_mode: "order_ws".to_string(),
            };
            if let Err(e) = store.append_trade(&trade) {
                warn!(error = %e, "failed to append ws trade record");
            }
        }
    }
}

fn dedupe_capped(market_ids: &[String], limit: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for id in market_ids {
        if !id.is_empty() && !out.iter().any(|existing| existing == id) {
            out.push(id.clone());
        }
    }
    if limit > 0 {
        out.truncate(limit);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::OrderEventStream;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Yields each queued batch as one connection, then pends forever.
    struct ScriptedStream {
        batches: Mutex<Vec<Vec<Value>>>,
        fail_first: Mutex<bool>,
    }

    impl ScriptedStream {
        fn new(batches: Vec<Vec<Value>>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches),
                fail_first: Mutex::new(false),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail_first: Mutex::new(true),
            })
        }
    }

    #[async_trait]
    impl OrderStreamProvider for ScriptedStream {
        async fn subscribe(&self, _market_ids: &[String]) -> Result<OrderEventStream> {
            if *self.fail_first.lock() {
                return Err(anyhow::anyhow!("connection refused"));
            }
            let mut batches = self.batches.lock();
            if batches.is_empty() {
                return Ok(Box::pin(futures_util::stream::pending::<Result<Value>>()));
            }
            let batch = batches.remove(0);
            Ok(Box::pin(futures_util::stream::iter(
                batch
                    .into_iter()
                    .map(Ok::<Value, anyhow::Error>)
                    .collect::<Vec<_>>(),
            )))
        }
    }

    fn streamer(provider: Arc<dyn OrderStreamProvider>, store: OrderStore) -> OrderLifecycleStreamer {
        OrderLifecycleStreamer::new(
            provider,
            store,
            FreshnessTracker::new(),
            true,
            true,
            Duration::from_millis(10),
            20,
        )
    }

    fn fill_msg(filled: f64, status: &str) -> Value {
        json!({
            "id": "o1",
            "market": "m1",
            "side": "BUY",
            "size": 10.0,
            "size_matched": filled,
            "price": 0.5,
            "status": status,
            "timestamp": 1_700_000_000.0,
        })
    }

    #[tokio::test]
    async fn duplicate_fill_snapshots_produce_one_trade() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path()).unwrap();
        let provider = ScriptedStream::new(vec![vec![
            fill_msg(3.0, "partial"),
            fill_msg(3.0, "partial"),
            fill_msg(10.0, "filled"),
        ]]);
        let s = streamer(provider, store.clone());
        s.start(&["m1".to_string()]).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        s.stop().await;

        let events = store.read_order_events().unwrap();
        assert_eq!(events.len(), 3);
        let trades = store.read_trades().unwrap();
        assert_eq!(trades.len(), 2);
        let deltas: Vec<f64> = trades
            .iter()
            .map(|t| t["filled_shares"].as_f64().unwrap())
            .collect();
        assert_eq!(deltas, vec![3.0, 7.0]);
        // Sum of deltas equals the final filled size.
        assert!((deltas.iter().sum::<f64>() - 10.0).abs() < 1e-9);
        assert_eq!(s.get_status()["status"], "stopped");
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path()).unwrap();
        let provider =
            ScriptedStream::new(vec![vec![json!({"noise": true}), fill_msg(1.0, "partial")]]);
        let s = streamer(provider, store.clone());
        s.start(&["m1".to_string()]).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        s.stop().await;

        assert_eq!(store.read_order_events().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn connect_failures_degrade_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path()).unwrap();
        let s = streamer(ScriptedStream::failing(), store);
        s.start(&["m1".to_string()]).await.unwrap();
        sleep(Duration::from_millis(60)).await;

        let status = s.get_status();
        // The retry loop flips briefly through "starting" between attempts.
        let state = status["status"].as_str().unwrap();
        assert!(state == "degraded" || state == "starting", "state was {state}");
        assert!(status["failures"].as_u64().unwrap() >= 1);
        assert!(status["last_error"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
        s.stop().await;
        assert_eq!(s.get_status()["status"], "stopped");
    }

    #[tokio::test]
    async fn disabled_without_credentials_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path()).unwrap();
        let provider = ScriptedStream::new(vec![]);
        let s = OrderLifecycleStreamer::new(
            provider,
            store,
            FreshnessTracker::new(),
            true,
            false,
            Duration::from_millis(10),
            20,
        );
        s.start(&["m1".to_string()]).await.unwrap();
        let status = s.get_status();
        assert_eq!(status["status"], "disabled");
        assert_eq!(status["reason"], "missing_credentials");
    }

    #[test]
    fn market_set_is_deduped_and_capped() {
        let ids: Vec<String> = ["a", "b", "a", "c", "d"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(dedupe_capped(&ids, 3), vec!["a", "b", "c"]);
    }
}
