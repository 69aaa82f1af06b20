//! Order REST Poller (fallback channel)
//!
//! Polls the open-orders API on a fixed interval when the WS channel is
//! disabled, unhealthy or unavailable. Keeps its own dedup ledger against the
//! previous cycle, so it can run concurrently with the streamer without
//! emitting duplicate trades. Transient poll errors never terminate the loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::models::{EventSource, OrderEvent, TradeRecord};
use crate::orders::{classify_event, FillLedger, OrderStore};
use crate::providers::{extract, OpenOrdersApi};

fn epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Default)]
struct PollerStatus {
    running: bool,
    disabled_reason: Option<String>,
    success: u64,
    errors: u64,
    last_success_epoch: Option<f64>,
    last_error_epoch: Option<f64>,
    last_error: Option<String>,
    assets: usize,
}

pub struct OrderRestPoller {
    api: Arc<dyn OpenOrdersApi>,
    store: OrderStore,
    enabled: bool,
    has_credentials: bool,
    interval: Duration,
    row_limit: usize,
    markets: Arc<RwLock<Vec<String>>>,
    status: Arc<RwLock<PollerStatus>>,
    shutdown: RwLock<Option<watch::Sender<bool>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OrderRestPoller {
    pub fn new(
        api: Arc<dyn OpenOrdersApi>,
        store: OrderStore,
        enabled: bool,
        has_credentials: bool,
        interval: Duration,
        row_limit: usize,
    ) -> Self {
        let mut status = PollerStatus::default();
        if !enabled {
            status.disabled_reason = Some("rest_fallback_disabled".to_string());
        } else if !has_credentials {
            status.disabled_reason = Some("missing_credentials".to_string());
        }
        Self {
            api,
            store,
            enabled,
            has_credentials,
            interval,
            row_limit,
            markets: Arc::new(RwLock::new(Vec::new())),
            status: Arc::new(RwLock::new(status)),
            shutdown: RwLock::new(None),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Activate polling. A disabled or credential-less configuration is a
    /// logged no-op, not an error.
    pub async fn start(&self, market_ids: &[String]) -> Result<()> {
        if !self.enabled {
            info!("Order REST poller disabled by flag");
            return Ok(());
        }
        if !self.has_credentials {
            info!("Order REST poller disabled: API credentials not provided");
            return Ok(());
        }

        self.halt_task().await;
        *self.markets.write() = dedupe(market_ids);
        {
            let mut status = self.status.write();
            status.running = true;
            status.assets = self.markets.read().len();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.write() = Some(shutdown_tx);

        let api = self.api.clone();
        let store = self.store.clone();
        let status = self.status.clone();
        let markets = self.markets.clone();
        let interval = self.interval;
        let row_limit = self.row_limit;
        let handle = tokio::spawn(async move {
            run_poll_loop(api, store, status, markets, interval, row_limit, shutdown_rx).await;
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        self.halt_task().await;
        self.status.write().running = false;
    }

    pub async fn update_markets(&self, market_ids: &[String]) -> Result<()> {
        let next = dedupe(market_ids);
        let mut markets = self.markets.write();
        if *markets != next {
            self.status.write().assets = next.len();
            *markets = next;
        }
        Ok(())
    }

    pub fn get_status(&self) -> Value {
        let status = self.status.read();
        let state = if status.disabled_reason.is_some() {
            "disabled"
        } else if !status.running {
            "stopped"
        } else if status.last_error_epoch.unwrap_or(0.0) > status.last_success_epoch.unwrap_or(0.0)
        {
            "degraded"
        } else {
            "healthy"
        };
        serde_json::json!({
            "status": state,
            "reason": status.disabled_reason,
            "failures": status.errors,
            "assets": status.assets,
            "interval_seconds": self.interval.as_secs(),
            "limit": self.row_limit,
            "success": status.success,
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

async fn run_poll_loop(
    api: Arc<dyn OpenOrdersApi>,
    store: OrderStore,
    status: Arc<RwLock<PollerStatus>>,
    markets: Arc<RwLock<Vec<String>>>,
    interval: Duration,
    row_limit: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ledger = FillLedger::new();
    loop {
        let wanted = markets.read().clone();
        let cycle = tokio::select! {
            _ = shutdown.changed() => return,
            result = poll_once(api.as_ref(), &store, &mut ledger, &wanted, row_limit) => result,
        };
        match cycle {
            Ok(count) => {
                let mut st = status.write();
                st.success += 1;
                st.last_success_epoch = Some(epoch_secs());
                debug!(orders = count, "order poll cycle completed");
            }
            Err(e) => {
                let mut st = status.write();
                st.errors += 1;
                st.last_error = Some(format!("{e:#}"));
                st.last_error_epoch = Some(epoch_secs());
                warn!(error = %e, "order poll failed; continuing");
            }
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(interval) => {}
        }
    }
}

async fn poll_once(
    api: &dyn OpenOrdersApi,
    store: &OrderStore,
    ledger: &mut FillLedger,
    markets: &[String],
    row_limit: usize,
) -> Result<usize> {
    let rows = fetch_order_pages(api, row_limit).await?;
    let mut recorded = 0usize;
    for row in &rows {
        if record_if_changed(row, store, ledger, markets)? {
            recorded += 1;
        }
    }
    Ok(recorded)
}

/// Page through the open-orders API while a cursor is present, up to the
/// configured row limit.
async fn fetch_order_pages(api: &dyn OpenOrdersApi, row_limit: usize) -> Result<Vec<Value>> {
    let mut collected: Vec<Value> = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let payload = api.fetch_open_orders(cursor.as_deref()).await?;
        let page = extract::extract_list(&payload, extract::ORDER_LIST_KEYS)
            .map(|rows| rows.to_vec())
            .unwrap_or_default();
        let page_len = page.len();
        collected.extend(page);
        if collected.len() >= row_limit || page_len == 0 {
            break;
        }
        cursor = extract::first_str(&payload, extract::CURSOR_KEYS);
        if cursor.is_none() {
            break;
        }
    }
    collected.truncate(row_limit);
    Ok(collected)
}

/// Dedup rule: append an event only if the status changed or the filled
/// quantity strictly increased; append a trade only for the positive delta.
fn record_if_changed(
    row: &Value,
    store: &OrderStore,
    ledger: &mut FillLedger,
    markets: &[String],
) -> Result<bool> {
    let Some(order_id) = extract::first_str(row, extract::ORDER_ID_KEYS) else {
        debug!("dropping polled order without an order id");
        return Ok(false);
    };
    let market_id = extract::first_str(row, extract::ORDER_MARKET_KEYS);
    if !markets.is_empty() {
        if let Some(mid) = &market_id {
            if !markets.iter().any(|m| m == mid) {
                return Ok(false);
            }
        }
    }

    let action = extract::first_str(row, extract::SIDE_KEYS).map(|s| s.to_ascii_lowercase());
    let size = extract::first_f64(row, extract::SIZE_KEYS);
    let filled = extract::first_f64(row, extract::FILLED_KEYS);
    let price = extract::first_f64(row, extract::PRICE_KEYS);
    let timestamp = extract::first_f64(row, extract::TIMESTAMP_KEYS).unwrap_or_else(epoch_secs);

    let kind = classify_event(row, filled, size);
    let status_label = extract::first_str(row, extract::STATUS_KEYS)
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| kind.as_str().to_string());

    let prev_status = ledger
        .previous(&order_id)
        .map(|seen| seen.status.clone())
        .unwrap_or_default();
    let delta = ledger.advance(&order_id, &status_label, filled, size);
    let status_changed = !status_label.is_empty() && status_label != prev_status;

    let should_write = if kind.is_fill() {
        delta.is_some() || status_changed
    } else {
        status_changed
    };
    if !should_write {
        return Ok(false);
    }

    store.append_order(&OrderEvent {
        timestamp,
        event: kind,
        order_id: order_id.clone(),
        market_id: market_id.clone(),
        action: action.clone(),
        size,
        filled_size: filled,
        price,
        status: status_label,
        source: EventSource::RestPoll,
    })?;

    if kind.is_fill() {
        if let (Some(delta), Some(price)) = (delta, price) {
            store.append_trade(&TradeRecord {
                timestamp,
                order_id,
                market_id,
                action,
                filled_shares: delta,
                average_price: price,
                notional: delta * price,
                status: kind.as_str().to_string(),
                execution_mode: "order_rest".to_string(),
            })?;
        }
    }
    Ok(true)
}

fn dedupe(market_ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for id in market_ids {
        if !id.is_empty() && !out.iter().any(|existing| existing == id) {
            out.push(id.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Serves queued responses, repeating the final one once drained.
    struct ScriptedApi {
        responses: Mutex<Vec<Value>>,
        last: Mutex<Value>,
        calls: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Value>) -> Arc<Self> {
            let last = responses.last().cloned().unwrap_or(json!({"data": []}));
            Arc::new(Self {
                responses: Mutex::new(responses),
                last: Mutex::new(last),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl OpenOrdersApi for ScriptedApi {
        async fn fetch_open_orders(&self, cursor: Option<&str>) -> Result<Value> {
            self.calls.lock().push(cursor.map(str::to_string));
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Ok(self.last.lock().clone())
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn order_row(id: &str, status: &str, filled: f64) -> Value {
        json!({
            "id": id,
            "market": "m1",
            "side": "BUY",
            "size": 10.0,
            "filled_size": filled,
            "price": 0.4,
            "status": status,
        })
    }

    fn poller(api: Arc<dyn OpenOrdersApi>, store: OrderStore) -> OrderRestPoller {
        OrderRestPoller::new(api, store, true, true, Duration::from_millis(10), 100)
    }

    #[tokio::test]
    async fn repeated_cycles_do_not_duplicate_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path()).unwrap();
        // Every cycle sees the same open order; only the first should write.
        let api = ScriptedApi::new(vec![json!({"data": [order_row("o1", "open", 0.0)]})]);
        let p = poller(api, store.clone());
        p.start(&["m1".to_string()]).await.unwrap();
        sleep(Duration::from_millis(60)).await;
        p.stop().await;

        assert_eq!(store.read_order_events().unwrap().len(), 1);
        assert!(store.read_trades().unwrap().is_empty());
        let status = p.get_status();
        assert_eq!(status["status"], "stopped");
        assert!(status["success"].as_u64().unwrap() >= 2);
    }

    #[tokio::test]
    async fn fill_growth_emits_event_and_delta_trade() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path()).unwrap();
        let api = ScriptedApi::new(vec![
            json!({"data": [order_row("o1", "partially_filled", 4.0)]}),
            json!({"data": [order_row("o1", "filled", 10.0)]}),
        ]);
        let p = poller(api, store.clone());
        p.start(&[]).await.unwrap();
        sleep(Duration::from_millis(60)).await;
        p.stop().await;

        let events = store.read_order_events().unwrap();
        assert_eq!(events.len(), 2);
        // Recorded filled_size values are non-decreasing.
        let fills: Vec<f64> = events
            .iter()
            .map(|e| e["filled_size"].as_f64().unwrap())
            .collect();
        assert!(fills.windows(2).all(|w| w[1] >= w[0]));

        let trades = store.read_trades().unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0]["filled_shares"].as_f64(), Some(4.0));
        assert_eq!(trades[1]["filled_shares"].as_f64(), Some(6.0));
        assert_eq!(trades[1]["execution_mode"], "order_rest");
    }

    #[tokio::test]
    async fn pagination_follows_cursor_within_row_limit() {
        let api = ScriptedApi::new(vec![
            json!({"data": [order_row("o1", "open", 0.0)], "next_cursor": "page2"}),
            json!({"data": [order_row("o2", "open", 0.0)]}),
        ]);
        let rows = fetch_order_pages(api.as_ref(), 100).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(api.calls.lock().as_slice(), &[None, Some("page2".to_string())]);
    }

    #[tokio::test]
    async fn poll_errors_are_counted_and_loop_continues() {
        struct FlakyApi {
            calls: Mutex<u64>,
        }
        #[async_trait]
        impl OpenOrdersApi for FlakyApi {
            async fn fetch_open_orders(&self, _cursor: Option<&str>) -> Result<Value> {
                let mut calls = self.calls.lock();
                *calls += 1;
                if *calls == 1 {
                    Err(anyhow::anyhow!("gateway timeout"))
                } else {
                    Ok(json!({"data": []}))
                }
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path()).unwrap();
        let api = Arc::new(FlakyApi {
            calls: Mutex::new(0),
        });
        let p = poller(api, store);
        p.start(&[]).await.unwrap();
        sleep(Duration::from_millis(60)).await;

        let status = p.get_status();
        assert_eq!(status["failures"].as_u64(), Some(1));
        assert!(status["success"].as_u64().unwrap() >= 1);
        assert_eq!(status["status"], "healthy");
        assert!(status["last_error"].as_str().unwrap().contains("gateway timeout"));
        p.stop().await;
    }

    #[tokio::test]
    async fn disabled_poller_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path()).unwrap();
        let api = ScriptedApi::new(vec![]);
        let p = OrderRestPoller::new(api, store, false, true, Duration::from_millis(10), 100);
        p.start(&[]).await.unwrap();
        let status = p.get_status();
        assert_eq!(status["status"], "disabled");
        assert_eq!(status["reason"], "rest_fallback_disabled");
    }
}
