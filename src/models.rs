//! Shared data model for snapshots, order lifecycle events and risk outcomes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Derived risk band for a market snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }
}

/// Point-in-time normalized view of one market.
///
/// Built once per ingestion cycle and never mutated; the next cycle's snapshot
/// supersedes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub market_id: String,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub volatility: Option<f64>,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    /// Provider row enriched with derived fields for downstream consumers.
    pub raw: Map<String, Value>,
}

impl MarketSnapshot {
    pub fn mid_price(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Freshness and fallback state of the most recent ingestion attempt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheMetadata {
    pub count: usize,
    pub age_s: f64,
    pub ttl: f64,
    pub last_rest_fetch_epoch: Option<f64>,
    pub last_ws_message_epoch: Option<f64>,
    pub fallback: bool,
    pub reason: Option<String>,
}

/// Which channel observed an order event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Ws,
    RestPoll,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Ws => "ws",
            EventSource::RestPoll => "rest_poll",
        }
    }
}

/// Lifecycle classification of an order event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEventKind {
    Submit,
    Partial,
    Filled,
    Cancel,
    Reject,
    Update,
}

impl OrderEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventKind::Submit => "submit",
            OrderEventKind::Partial => "partial",
            OrderEventKind::Filled => "filled",
            OrderEventKind::Cancel => "cancel",
            OrderEventKind::Reject => "reject",
            OrderEventKind::Update => "update",
        }
    }

    pub fn is_fill(&self) -> bool {
        matches!(self, OrderEventKind::Partial | OrderEventKind::Filled)
    }
}

/// Append-only order lifecycle log entry. The "current" state of an order is
/// the latest event for its `order_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub timestamp: f64,
    pub event: OrderEventKind,
    pub order_id: String,
    pub market_id: Option<String>,
    pub action: Option<String>,
    pub size: Option<f64>,
    pub filled_size: Option<f64>,
    pub price: Option<f64>,
    pub status: String,
    pub source: EventSource,
}

/// One strictly-incremental fill delta derived from an order event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: f64,
    pub order_id: String,
    pub market_id: Option<String>,
    pub action: Option<String>,
    /// Incremental quantity since the last observed fill, never cumulative.
    pub filled_shares: f64,
    pub average_price: f64,
    pub notional: f64,
    pub status: String,
    pub execution_mode: String,
}

/// Outcome of a daily kill-switch evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchResult {
    pub active: bool,
    pub reason: Option<String>,
    pub day_pnl: f64,
    pub limit_pct: f64,
    pub limit_usd: f64,
    pub threshold: f64,
    pub triggered_at: Option<DateTime<Utc>>,
    pub cooldown_minutes: f64,
    pub cooldown_remaining_minutes: f64,
    pub recovery_mode: bool,
}

impl KillSwitchResult {
    pub fn inactive(limit_pct: f64, limit_usd: f64, threshold: f64, day_pnl: f64) -> Self {
        Self {
            active: false,
            reason: None,
            day_pnl,
            limit_pct,
            limit_usd,
            threshold,
            triggered_at: None,
            cooldown_minutes: 0.0,
            cooldown_remaining_minutes: 0.0,
            recovery_mode: false,
        }
    }
}

/// A single strategy's contribution to an order decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyContribution {
    pub name: String,
    pub bias: f64,
    pub confidence: f64,
    pub size_hint: f64,
}

/// Portfolio-level risk verdict attached to an order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskMetadata {
    pub approved: bool,
    pub rejections: Vec<String>,
    pub factors: BTreeMap<String, f64>,
}

/// Attribution and risk metadata accumulated on an in-flight order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderMetadata {
    pub decision: String,
    pub reason: Option<String>,
    pub combined_score: f64,
    pub confidence: f64,
    pub size_hint: f64,
    pub strategies: Vec<StrategyContribution>,
    pub risk: Option<RiskMetadata>,
}

/// An order proposed by the strategy engine (`action` is yes/no/hold).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub market_id: String,
    pub action: String,
    pub size: f64,
    pub metadata: OrderMetadata,
}

impl Order {
    pub fn is_hold(&self) -> bool {
        self.action == "hold" || self.size <= 0.0
    }
}

/// Realized-exit ledger entry consumed by the kill switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealizedExit {
    pub timestamp: f64,
    pub market_id: String,
    pub pnl: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_after_fees: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
}
