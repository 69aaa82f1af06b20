//! Append-only line-delimited JSON logs for order events, trades and
//! realized exits.
//!
//! Both lifecycle channels append concurrently; each line is written with a
//! single `write_all` on a file opened in append mode, so O_APPEND semantics
//! keep concurrent readers safe from partial lines.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::models::{OrderEvent, RealizedExit, TradeRecord};

#[derive(Clone)]
pub struct OrderStore {
    orders_path: PathBuf,
    trades_path: PathBuf,
    realized_path: PathBuf,
}

impl OrderStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;
        Ok(Self {
            orders_path: data_dir.join("orders.jsonl"),
            trades_path: data_dir.join("trades.jsonl"),
            realized_path: data_dir.join("realized_exits.jsonl"),
        })
    }

    pub fn realized_path(&self) -> &Path {
        &self.realized_path
    }

    pub fn append_order(&self, event: &OrderEvent) -> Result<()> {
        debug!(
            order_id = event.order_id.as_str(),
            event = event.event.as_str(),
            source = event.source.as_str(),
            "append order event"
        );
        append_jsonl(&self.orders_path, event)
    }

    pub fn append_trade(&self, trade: &TradeRecord) -> Result<()> {
        debug!(
            order_id = trade.order_id.as_str(),
            filled_shares = trade.filled_shares,
            "append trade record"
        );
        append_jsonl(&self.trades_path, trade)
    }

    pub fn append_realized_exit(&self, exit: &RealizedExit) -> Result<()> {
        append_jsonl(&self.realized_path, exit)
    }

    /// All realized-exit rows as raw JSON values; callers decide how strictly
    /// to interpret them (the kill switch fails open on parse errors).
    pub fn read_realized_exits(&self) -> Result<Vec<Value>> {
        read_jsonl(&self.realized_path)
    }

    pub fn read_order_events(&self) -> Result<Vec<Value>> {
        read_jsonl(&self.orders_path)
    }

    pub fn read_trades(&self) -> Result<Vec<Value>> {
        read_jsonl(&self.trades_path)
    }
}

fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut line = serde_json::to_string(record).context("Failed to serialize log record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    // One write call per line: atomic under O_APPEND.
    file.write_all(line.as_bytes())
        .with_context(|| format!("Failed to append to {}", path.display()))?;
    Ok(())
}

fn read_jsonl(path: &Path) -> Result<Vec<Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut rows = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(line).context("Malformed log line")?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventSource, OrderEventKind};

    fn sample_event(filled: f64) -> OrderEvent {
        OrderEvent {
            timestamp: 1_700_000_000.0,
            event: OrderEventKind::Partial,
            order_id: "o1".to_string(),
            market_id: Some("m1".to_string()),
            action: Some("buy".to_string()),
            size: Some(10.0),
            filled_size: Some(filled),
            price: Some(0.5),
            status: "partial".to_string(),
            source: EventSource::Ws,
        }
    }

    #[test]
    fn appends_are_line_delimited_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path()).unwrap();
        store.append_order(&sample_event(1.0)).unwrap();
        store.append_order(&sample_event(2.0)).unwrap();

        let rows = store.read_order_events().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["filled_size"], 2.0);
        assert_eq!(rows[0]["source"], "ws");
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path()).unwrap();
        assert!(store.read_realized_exits().unwrap().is_empty());
    }
}
