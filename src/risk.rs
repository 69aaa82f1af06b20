//! Risk Engine
//!
//! Portfolio-level approval gate for proposed orders. A rejection is a
//! first-class outcome, not an error: every failed check is recorded into the
//! order's risk metadata for observability.

use statrs::statistics::{Data, OrderStatistics};
use tracing::debug;

use crate::models::{Order, RiskMetadata};

const EPSILON: f64 = 1e-9;

/// Portfolio state consulted during validation.
#[derive(Debug, Clone, Default)]
pub struct Portfolio {
    pub balance: f64,
    /// Historical per-trade returns (fractions, losses negative).
    pub returns: Vec<f64>,
}

pub struct RiskEngine {
    /// Order size as a fraction of balance above which liquidity fails.
    pub max_order_balance_ratio: f64,
    /// VaR-projected loss as a fraction of balance above which VaR fails.
    pub max_var_loss_ratio: f64,
    /// Below this many return samples the VaR check is skipped.
    pub min_return_samples: usize,
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self {
            max_order_balance_ratio: 0.10,
            max_var_loss_ratio: 0.05,
            min_return_samples: 10,
        }
    }
}

impl RiskEngine {
    pub fn new(max_order_balance_ratio: f64) -> Self {
        Self {
            max_order_balance_ratio,
            ..Self::default()
        }
    }

    /// Validate an order against the portfolio, recording which specific
    /// checks failed into `order.metadata.risk.rejections`.
    pub fn validate_order(&self, order: &mut Order, portfolio: &Portfolio) -> bool {
        let mut risk = RiskMetadata::default();
        let balance = portfolio.balance.max(EPSILON);

        let liquidity_ratio = order.size / balance;
        risk.factors
            .insert("liquidity_ratio".to_string(), liquidity_ratio);
        if liquidity_ratio > self.max_order_balance_ratio {
            risk.rejections.push("liquidity".to_string());
        }

        if portfolio.returns.len() >= self.min_return_samples {
            let loss_bound = historical_var_95(&portfolio.returns);
            let projected_loss = order.size * loss_bound;
            risk.factors.insert("var_95".to_string(), loss_bound);
            risk.factors
                .insert("projected_loss".to_string(), projected_loss);
            if projected_loss > balance * self.max_var_loss_ratio {
                risk.rejections.push("var".to_string());
            }
        }

        risk.approved = risk.rejections.is_empty();
        let approved = risk.approved;
        if !approved {
            debug!(
                market_id = order.market_id.as_str(),
                rejections = ?risk.rejections,
                "order rejected by risk engine"
            );
        }
        order.metadata.risk = Some(risk);
        approved
    }
}

/// Loss bound per unit of notional from the 5th percentile of historical
/// returns; non-negative (a profitable tail implies no VaR loss).
fn historical_var_95(returns: &[f64]) -> f64 {
    let mut data = Data::new(returns.to_vec());
    (-data.percentile(5)).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, OrderMetadata};

    fn order(size: f64) -> Order {
        Order {
            market_id: "m1".to_string(),
            action: "yes".to_string(),
            size,
            metadata: OrderMetadata::default(),
        }
    }

    fn low_vol_returns() -> Vec<f64> {
        (0..50)
            .map(|i| if i % 2 == 0 { 0.01 } else { -0.01 })
            .collect()
    }

    #[test]
    fn oversized_order_is_rejected_for_liquidity() {
        let engine = RiskEngine::default();
        let portfolio = Portfolio {
            balance: 10_000.0,
            returns: low_vol_returns(),
        };
        let mut order = order(2_000.0); // 20% of balance
        assert!(!engine.validate_order(&mut order, &portfolio));
        let risk = order.metadata.risk.as_ref().unwrap();
        assert!(risk.rejections.contains(&"liquidity".to_string()));
        assert!(!risk.approved);
    }

    #[test]
    fn modest_order_passes_with_low_volatility_history() {
        let engine = RiskEngine::default();
        let portfolio = Portfolio {
            balance: 10_000.0,
            returns: low_vol_returns(),
        };
        let mut order = order(500.0); // 5% of balance
        assert!(engine.validate_order(&mut order, &portfolio));
        let risk = order.metadata.risk.as_ref().unwrap();
        assert!(risk.approved);
        assert!(risk.rejections.is_empty());
        assert!(risk.factors.contains_key("var_95"));
    }

    #[test]
    fn heavy_tail_history_trips_var_check() {
        let engine = RiskEngine::default();
        let mut returns = low_vol_returns();
        for _ in 0..5 {
            returns.push(-0.9);
        }
        let portfolio = Portfolio {
            balance: 10_000.0,
            returns,
        };
        let mut order = order(900.0); // 9%: passes liquidity, fails VaR
        assert!(!engine.validate_order(&mut order, &portfolio));
        let risk = order.metadata.risk.as_ref().unwrap();
        assert!(risk.rejections.contains(&"var".to_string()));
        assert!(!risk.rejections.contains(&"liquidity".to_string()));
    }

    #[test]
    fn var_check_skipped_without_enough_history() {
        let engine = RiskEngine::default();
        let portfolio = Portfolio {
            balance: 10_000.0,
            returns: vec![-0.9, -0.9],
        };
        let mut order = order(500.0);
        assert!(engine.validate_order(&mut order, &portfolio));
        let risk = order.metadata.risk.as_ref().unwrap();
        assert!(!risk.factors.contains_key("var_95"));
    }
}
