//! Simulation exits, P&L and the aggregate performance report.
//!
//! Offline mode synthesizes a fill and an exit for each approved order: the
//! combined strategy score (bounded to [-1, 1]) biases price movement by a
//! volatility-derived edge scale, and the report is derived purely from the
//! simulated trade list plus a fixed starting balance.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statrs::statistics::Statistics;
use tracing::info;
use uuid::Uuid;

use crate::market_data::MarketDataService;
use crate::models::{MarketSnapshot, RealizedExit};
use crate::orders::OrderStore;
use crate::providers::extract;
use crate::risk::{Portfolio, RiskEngine};
use crate::strategy::StrategyEngine;

const PRICE_FLOOR: f64 = 0.01;
const PRICE_CEIL: f64 = 0.99;
const EDGE_MIN: f64 = 0.01;
const EDGE_MAX: f64 = 0.15;

fn epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Entry yes-price preference: ask, then bid, then mid, then yes_price.
pub fn entry_yes_price(snapshot: &MarketSnapshot) -> f64 {
    let row = Value::Object(snapshot.raw.clone());
    extract::first_f64(&row, &["ask"])
        .or_else(|| extract::first_f64(&row, &["bid"]))
        .or_else(|| extract::first_f64(&row, &["mid_price"]))
        .or_else(|| extract::first_f64(&row, &["yes_price"]))
        .unwrap_or(0.5)
        .clamp(PRICE_FLOOR, PRICE_CEIL)
}

/// Volatility-derived edge scale, clamped to [0.01, 0.15].
pub fn edge_scale(volatility: Option<f64>) -> f64 {
    volatility.unwrap_or(0.08).clamp(EDGE_MIN, EDGE_MAX)
}

/// Bounded synthetic exit: entry moved by score × edge, kept inside the
/// tradable [0.01, 0.99] band.
pub fn simulate_exit_yes(entry_yes: f64, combined_score: f64, volatility: Option<f64>) -> f64 {
    let score = combined_score.clamp(-1.0, 1.0);
    (entry_yes * (1.0 + score * edge_scale(volatility))).clamp(PRICE_FLOOR, PRICE_CEIL)
}

/// P&L for a yes position is `(exit - entry) · shares` with
/// `shares = size / entry`; a no position mirrors on `(1 - price)`.
pub fn position_pnl(action: &str, size: f64, entry_yes: f64, exit_yes: f64) -> (f64, f64) {
    match action {
        "yes" => {
            let shares = size / entry_yes.max(PRICE_FLOOR);
            (shares, (exit_yes - entry_yes) * shares)
        }
        "no" => {
            let entry_no = (1.0 - entry_yes).max(PRICE_FLOOR);
            let exit_no = 1.0 - exit_yes;
            let shares = size / entry_no;
            (shares, (exit_no - entry_no) * shares)
        }
        _ => (0.0, 0.0),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedTrade {
    pub order_id: String,
    pub market_id: String,
    pub action: String,
    pub size: f64,
    pub approved: bool,
    pub rejections: Vec<String>,
    pub strategies: Vec<String>,
    pub combined_score: f64,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub shares: f64,
    pub pnl: f64,
}

/// Run one full decision cycle over the current snapshots and synthesize
/// exits for every approved order. Realized exits are appended to the store
/// so the kill switch consumes simulated P&L exactly like live P&L.
pub async fn run_simulation(
    service: &MarketDataService,
    engine: &StrategyEngine,
    risk: &RiskEngine,
    portfolio: &Portfolio,
    store: Option<&OrderStore>,
) -> Result<Vec<SimulatedTrade>> {
    let snapshots = service.get_snapshots(false).await?;
    let mut trades = Vec::new();

    for snapshot in &snapshots {
        let mut order = engine.generate_order(snapshot);
        if order.is_hold() {
            continue;
        }
        let approved = risk.validate_order(&mut order, portfolio);
        let rejections = order
            .metadata
            .risk
            .as_ref()
            .map(|r| r.rejections.clone())
            .unwrap_or_default();
        let strategies: Vec<String> = order
            .metadata
            .strategies
            .iter()
            .map(|c| c.name.clone())
            .collect();

        let mut trade = SimulatedTrade {
            order_id: Uuid::new_v4().simple().to_string(),
            market_id: order.market_id.clone(),
            action: order.action.clone(),
            size: order.size,
            approved,
            rejections,
            strategies,
            combined_score: order.metadata.combined_score,
            entry_price: None,
            exit_price: None,
            shares: 0.0,
            pnl: 0.0,
        };

        if approved {
            let entry = entry_yes_price(snapshot);
            let exit = simulate_exit_yes(entry, order.metadata.combined_score, snapshot.volatility);
            let (shares, pnl) = position_pnl(&order.action, order.size, entry, exit);
            trade.entry_price = Some(entry);
            trade.exit_price = Some(exit);
            trade.shares = shares;
            trade.pnl = pnl;

            if let Some(store) = store {
                store.append_realized_exit(&RealizedExit {
                    timestamp: epoch_secs(),
                    market_id: trade.market_id.clone(),
                    pnl,
                    pnl_after_fees: Some(pnl),
                    execution_mode: Some("simulation".to_string()),
                })?;
            }
        }
        trades.push(trade);
    }

    info!(trades = trades.len(), "simulation cycle complete");
    Ok(trades)
}

/// Aggregate report: counts, win rate, P&L totals, dispersion and equal-
/// weighted per-strategy attribution, all derived from the trade list.
pub fn build_report(trades: &[SimulatedTrade], starting_balance: f64) -> Value {
    let approved: Vec<&SimulatedTrade> = trades.iter().filter(|t| t.approved).collect();
    let total_pnl: f64 = approved.iter().map(|t| t.pnl).sum();
    let wins = approved.iter().filter(|t| t.pnl > 0.0).count();
    let pnls: Vec<f64> = approved.iter().map(|t| t.pnl).collect();
    let pnl_std_dev = if pnls.len() >= 2 {
        pnls.iter().std_dev()
    } else {
        0.0
    };

    let mut strategy_performance = serde_json::Map::new();
    for trade in &approved {
        if trade.strategies.is_empty() {
            continue;
        }
        let share = trade.pnl / trade.strategies.len() as f64;
        for name in &trade.strategies {
            let entry = strategy_performance
                .entry(name.clone())
                .or_insert_with(|| serde_json::json!({"trades": 0, "pnl": 0.0}));
            entry["trades"] = Value::from(entry["trades"].as_u64().unwrap_or(0) + 1);
            entry["pnl"] = Value::from(entry["pnl"].as_f64().unwrap_or(0.0) + share);
        }
    }

    serde_json::json!({
        "trades": trades,
        "simulation_summary": {
            "initial_balance": starting_balance,
            "performance_metrics": {
                "total_trades": trades.len(),
                "approved_trades": approved.len(),
                "win_rate": if approved.is_empty() { 0.0 } else { wins as f64 / approved.len() as f64 },
                "total_pnl": total_pnl,
                "avg_pnl": if approved.is_empty() { 0.0 } else { total_pnl / approved.len() as f64 },
                "pnl_std_dev": pnl_std_dev,
                "current_balance": starting_balance + total_pnl,
                "total_return": total_pnl / starting_balance.max(1e-9),
            },
            "strategy_performance": strategy_performance,
        },
    })
}

/// Write the report JSON document to a caller-specified path.
pub fn write_report(report: &Value, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create report dir")?;
    }
    let text = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "simulation report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskLevel;
    use serde_json::json;

    fn snapshot_with_raw(raw: Value) -> MarketSnapshot {
        let raw = raw.as_object().cloned().unwrap();
        MarketSnapshot {
            market_id: "m1".to_string(),
            bid: 0.45,
            ask: 0.55,
            spread: 0.10,
            volatility: Some(0.1),
            risk_score: 0.2,
            risk_level: RiskLevel::Low,
            raw,
        }
    }

    #[test]
    fn exit_stays_inside_tradable_band_for_extreme_inputs() {
        for entry in [0.01, 0.05, 0.5, 0.9, 0.99] {
            for score in [-5.0, -1.0, -0.3, 0.0, 0.3, 1.0, 5.0] {
                for vol in [None, Some(0.0), Some(0.08), Some(2.0)] {
                    let exit = simulate_exit_yes(entry, score, vol);
                    assert!((PRICE_FLOOR..=PRICE_CEIL).contains(&exit));
                    // Relative move bounded by the edge clamp (modulo band clipping).
                    let rel = (exit - entry).abs() / entry;
                    assert!(rel <= EDGE_MAX + 1e-9);
                }
            }
        }
    }

    #[test]
    fn yes_and_no_positions_mirror() {
        let (shares_yes, pnl_yes) = position_pnl("yes", 100.0, 0.6, 0.55);
        assert!((shares_yes - 100.0 / 0.6).abs() < 1e-9);
        assert!(pnl_yes < 0.0);

        let (shares_no, pnl_no) = position_pnl("no", 100.0, 0.6, 0.55);
        assert!((shares_no - 250.0).abs() < 1e-9);
        assert!((pnl_no - 12.5).abs() < 1e-9);
    }

    #[test]
    fn entry_price_prefers_ask_then_falls_back() {
        let with_ask = snapshot_with_raw(json!({"ask": 0.55, "bid": 0.45, "yes_price": 0.5}));
        assert!((entry_yes_price(&with_ask) - 0.55).abs() < 1e-9);

        let only_yes = snapshot_with_raw(json!({"yes_price": 0.62}));
        assert!((entry_yes_price(&only_yes) - 0.62).abs() < 1e-9);

        let empty = snapshot_with_raw(json!({}));
        assert!((entry_yes_price(&empty) - 0.5).abs() < 1e-9);
    }

    fn trade(pnl: f64, approved: bool, strategies: &[&str]) -> SimulatedTrade {
        SimulatedTrade {
            order_id: "t".to_string(),
            market_id: "m1".to_string(),
            action: "yes".to_string(),
            size: 100.0,
            approved,
            rejections: Vec::new(),
            strategies: strategies.iter().map(|s| s.to_string()).collect(),
            combined_score: 0.5,
            entry_price: Some(0.5),
            exit_price: Some(0.55),
            shares: 200.0,
            pnl,
        }
    }

    #[test]
    fn report_aggregates_and_attributes_equally() {
        let trades = vec![
            trade(10.0, true, &["mean_reversion", "momentum"]),
            trade(-5.0, true, &["mean_reversion"]),
            trade(0.0, false, &["momentum"]),
        ];
        let report = build_report(&trades, 10_000.0);
        let metrics = &report["simulation_summary"]["performance_metrics"];
        assert_eq!(metrics["total_trades"], 3);
        assert_eq!(metrics["approved_trades"], 2);
        assert!((metrics["win_rate"].as_f64().unwrap() - 0.5).abs() < 1e-9);
        assert!((metrics["total_pnl"].as_f64().unwrap() - 5.0).abs() < 1e-9);
        assert!(metrics["pnl_std_dev"].as_f64().unwrap() > 0.0);

        let per_strategy = &report["simulation_summary"]["strategy_performance"];
        // 10 split across two strategies, -5 attributed wholly.
        assert!((per_strategy["mean_reversion"]["pnl"].as_f64().unwrap() - 0.0).abs() < 1e-9);
        assert!((per_strategy["momentum"]["pnl"].as_f64().unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(per_strategy["mean_reversion"]["trades"], 2);
    }

    #[test]
    fn report_round_trips_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/sim.json");
        let report = build_report(&[trade(10.0, true, &["momentum"])], 10_000.0);
        write_report(&report, &path).unwrap();
        let loaded: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded["trades"].as_array().unwrap().len(), 1);
    }
}
