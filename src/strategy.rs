//! Strategy Engine
//!
//! Multiplexes weighted strategy signals into a single order decision.
//! `action = "hold"` or `size <= 0` means no trade; the metadata records each
//! contributing strategy for later attribution and a `combined_score` used to
//! bias simulated price movement downstream.

use serde_json::Value;
use tracing::debug;

use crate::models::{MarketSnapshot, Order, OrderMetadata, StrategyContribution};
use crate::providers::extract;

/// One strategy's view of a market.
#[derive(Debug, Clone, Copy)]
pub struct StrategySignal {
    /// Direction and strength in [-1, 1]; positive favours "yes".
    pub bias: f64,
    /// Conviction in [0, 1].
    pub confidence: f64,
    /// Relative sizing appetite in [0, 1].
    pub size_hint: f64,
}

impl StrategySignal {
    pub fn clamped(self) -> Self {
        Self {
            bias: self.bias.clamp(-1.0, 1.0),
            confidence: self.confidence.clamp(0.0, 1.0),
            size_hint: self.size_hint.clamp(0.0, 1.0),
        }
    }
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, snapshot: &MarketSnapshot) -> Option<StrategySignal>;
}

/// Fade deviations of the mid from a target probability.
pub struct MeanReversionStrategy {
    pub target: f64,
    pub sensitivity: f64,
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self {
            target: 0.5,
            sensitivity: 0.2,
        }
    }
}

impl Strategy for MeanReversionStrategy {
    fn name(&self) -> &str {
        "mean_reversion"
    }

    fn evaluate(&self, snapshot: &MarketSnapshot) -> Option<StrategySignal> {
        if snapshot.bid <= 0.0 || snapshot.ask <= 0.0 {
            return None;
        }
        let mid = snapshot.mid_price();
        let deviation = self.target - mid;
        let sensitivity = self.sensitivity.max(1e-6);
        let bias = deviation / sensitivity;
        let confidence = deviation.abs() / (sensitivity * 0.75);
        Some(
            StrategySignal {
                bias,
                confidence,
                size_hint: (confidence + bias.abs() / 2.0).min(1.0),
            }
            .clamped(),
        )
    }
}

/// Follow 24h price momentum, normalized by volatility.
pub struct MomentumStrategy {
    pub threshold: f64,
}

impl Default for MomentumStrategy {
    fn default() -> Self {
        Self { threshold: 0.02 }
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        "momentum"
    }

    fn evaluate(&self, snapshot: &MarketSnapshot) -> Option<StrategySignal> {
        let row = Value::Object(snapshot.raw.clone());
        let change = extract::first_f64(&row, &["price_change_24h", "momentum"])?;
        if change.abs() < self.threshold {
            return None;
        }
        let denom = self
            .threshold
            .max(snapshot.volatility.unwrap_or(0.0))
            .max(1e-6);
        let normalized = change / denom;
        Some(
            StrategySignal {
                bias: normalized,
                confidence: normalized.abs(),
                size_hint: (normalized.abs() * 1.5).min(1.0),
            }
            .clamped(),
        )
    }
}

pub struct StrategySpec {
    pub name: String,
    pub weight: f64,
    pub min_confidence: f64,
    pub strategy: Box<dyn Strategy>,
}

pub struct StrategyEngine {
    specs: Vec<StrategySpec>,
    signal_floor: f64,
    balance: f64,
    max_single_ratio: f64,
    min_position: f64,
}

impl StrategyEngine {
    pub fn new(
        specs: Vec<StrategySpec>,
        signal_floor: f64,
        balance: f64,
        max_single_ratio: f64,
        min_position: f64,
    ) -> Self {
        Self {
            specs: specs.into_iter().filter(|s| s.weight > 0.0).collect(),
            signal_floor,
            balance,
            max_single_ratio,
            min_position,
        }
    }

    /// Default weighted pair: mean reversion and momentum.
    pub fn with_default_strategies(
        signal_floor: f64,
        balance: f64,
        max_single_ratio: f64,
        min_position: f64,
    ) -> Self {
        Self::new(
            vec![
                StrategySpec {
                    name: "mean_reversion".to_string(),
                    weight: 1.0,
                    min_confidence: 0.1,
                    strategy: Box::new(MeanReversionStrategy::default()),
                },
                StrategySpec {
                    name: "momentum".to_string(),
                    weight: 0.8,
                    min_confidence: 0.1,
                    strategy: Box::new(MomentumStrategy::default()),
                },
            ],
            signal_floor,
            balance,
            max_single_ratio,
            min_position,
        )
    }

    pub fn generate_order(&self, snapshot: &MarketSnapshot) -> Order {
        if self.specs.is_empty() {
            return hold(snapshot, "no_strategies_enabled", Vec::new());
        }

        let mut contributions: Vec<StrategyContribution> = Vec::new();
        let mut weighted: Vec<(f64, StrategySignal)> = Vec::new();
        for spec in &self.specs {
            let Some(signal) = spec.strategy.evaluate(snapshot) else {
                continue;
            };
            if signal.confidence < spec.min_confidence {
                continue;
            }
            contributions.push(StrategyContribution {
                name: spec.name.clone(),
                bias: signal.bias,
                confidence: signal.confidence,
                size_hint: signal.size_hint,
            });
            weighted.push((spec.weight, signal));
        }

        if weighted.is_empty() {
            return hold(snapshot, "no_signal", contributions);
        }

        let total_weight: f64 = weighted.iter().map(|(w, _)| w).sum();
        let combined_score = weighted
            .iter()
            .map(|(w, s)| w * s.bias * s.confidence)
            .sum::<f64>()
            / total_weight;
        let confidence = weighted
            .iter()
            .map(|(w, s)| w * s.confidence)
            .sum::<f64>()
            / total_weight;
        let size_hint = weighted
            .iter()
            .map(|(w, s)| w * s.size_hint)
            .sum::<f64>()
            / total_weight;

        if combined_score.abs() < self.signal_floor || confidence < self.signal_floor {
            debug!(
                market_id = snapshot.market_id.as_str(),
                combined_score, confidence, "weak signal; holding"
            );
            return hold(snapshot, "weak_signal", contributions);
        }

        let action = if combined_score > 0.0 { "yes" } else { "no" };

        let base_size = self.balance * self.max_single_ratio;
        let vol_factor = match snapshot.volatility.unwrap_or(0.0) {
            v if v > 0.2 => 0.5,
            v if v > 0.1 => 0.75,
            _ => 1.0,
        };
        let scale = (size_hint * confidence).max(0.1).min(0.12);
        let size = (base_size * scale * vol_factor).max(self.min_position);

        debug!(
            market_id = snapshot.market_id.as_str(),
            action,
            size,
            combined_score,
            confidence,
            "strategy engine execute"
        );
        Order {
            market_id: snapshot.market_id.clone(),
            action: action.to_string(),
            size: (size * 10_000.0).round() / 10_000.0,
            metadata: OrderMetadata {
                decision: "execute".to_string(),
                reason: None,
                combined_score,
                confidence,
                size_hint,
                strategies: contributions,
                risk: None,
            },
        }
    }
}

fn hold(snapshot: &MarketSnapshot, reason: &str, contributions: Vec<StrategyContribution>) -> Order {
    Order {
        market_id: snapshot.market_id.clone(),
        action: "hold".to_string(),
        size: 0.0,
        metadata: OrderMetadata {
            decision: "hold".to_string(),
            reason: Some(reason.to_string()),
            strategies: contributions,
            ..OrderMetadata::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskLevel;
    use serde_json::json;

    fn snapshot(bid: f64, ask: f64, extra: Value) -> MarketSnapshot {
        let mut raw = json!({"market_id": "m1", "bid": bid, "ask": ask})
            .as_object()
            .cloned()
            .unwrap();
        if let Some(obj) = extra.as_object() {
            for (k, v) in obj {
                raw.insert(k.clone(), v.clone());
            }
        }
        MarketSnapshot {
            market_id: "m1".to_string(),
            bid,
            ask,
            spread: ask - bid,
            volatility: raw.get("volatility").and_then(Value::as_f64),
            risk_score: 0.1,
            risk_level: RiskLevel::Low,
            raw,
        }
    }

    fn engine() -> StrategyEngine {
        StrategyEngine::with_default_strategies(0.12, 10_000.0, 0.05, 100.0)
    }

    #[test]
    fn cheap_market_generates_yes_order_with_attribution() {
        // Mid 0.30 is well below the 0.5 target: strong yes signal.
        let snap = snapshot(0.28, 0.32, json!({"price_change_24h": 0.05, "volatility": 0.05}));
        let order = engine().generate_order(&snap);
        assert_eq!(order.action, "yes");
        assert!(order.size >= 100.0);
        assert!(order.metadata.combined_score > 0.0);
        let names: Vec<&str> = order
            .metadata
            .strategies
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert!(names.contains(&"mean_reversion"));
        assert!(names.contains(&"momentum"));
    }

    #[test]
    fn balanced_market_holds_on_weak_signal() {
        // Mid 0.48: a real but sub-floor deviation from the 0.5 target.
        let snap = snapshot(0.46, 0.50, json!({"volatility": 0.05}));
        let order = engine().generate_order(&snap);
        assert!(order.is_hold());
        assert_eq!(order.metadata.reason.as_deref(), Some("weak_signal"));
    }

    #[test]
    fn dead_quiet_market_holds_on_no_signal() {
        let snap = snapshot(0.50, 0.50, json!({"volatility": 0.05}));
        let order = engine().generate_order(&snap);
        assert!(order.is_hold());
        assert_eq!(order.metadata.reason.as_deref(), Some("no_signal"));
    }

    #[test]
    fn rich_market_generates_no_order() {
        let snap = snapshot(0.78, 0.82, json!({"volatility": 0.05}));
        let order = engine().generate_order(&snap);
        assert_eq!(order.action, "no");
        assert!(order.metadata.combined_score < 0.0);
    }

    #[test]
    fn high_volatility_halves_position_size() {
        let calm = engine().generate_order(&snapshot(0.28, 0.32, json!({"volatility": 0.05})));
        let wild = engine().generate_order(&snapshot(0.28, 0.32, json!({"volatility": 0.30})));
        assert!(wild.size <= calm.size);
    }

    #[test]
    fn no_enabled_strategies_is_a_hold() {
        let engine = StrategyEngine::new(Vec::new(), 0.12, 10_000.0, 0.05, 100.0);
        let order = engine.generate_order(&snapshot(0.3, 0.35, json!({})));
        assert!(order.is_hold());
        assert_eq!(order.metadata.reason.as_deref(), Some("no_strategies_enabled"));
    }
}
