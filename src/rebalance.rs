//! Trade lists that move a current allocation to a target allocation.

use crate::config::RebalanceSettings;
use crate::error::{PortfolioError, Result};
use crate::types::Allocation;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Exponent profile for inverse-volatility targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfile {
    Conservative,
    #[default]
    Balanced,
    Aggressive,
}

impl RiskProfile {
    /// Power applied to `1/σ`; larger values tilt harder toward low volatility.
    pub fn exponent(&self) -> f64 {
        match self {
            RiskProfile::Conservative => 1.5,
            RiskProfile::Balanced => 1.0,
            RiskProfile::Aggressive => 0.5,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Some(RiskProfile::Conservative),
            "balanced" => Some(RiskProfile::Balanced),
            "aggressive" => Some(RiskProfile::Aggressive),
            _ => None,
        }
    }
}

impl fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskProfile::Conservative => "conservative",
            RiskProfile::Balanced => "balanced",
            RiskProfile::Aggressive => "aggressive",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeAction::Buy => write!(f, "BUY"),
            TradeAction::Sell => write!(f, "SELL"),
        }
    }
}

/// One trade in a rebalancing plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeInstruction {
    pub symbol: String,
    pub action: TradeAction,
    /// Signed cash impact in the portfolio's valuation currency; positive buys.
    pub amount: f64,
    pub current_weight: f64,
    pub target_weight: f64,
    pub weight_delta: f64,
    /// Signed share count, when a price was supplied.
    pub quantity: Option<f64>,
}

/// Per-asset inputs for heuristic targets.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreInput {
    pub symbol: String,
    pub sharpe: Option<f64>,
    pub volatility: Option<f64>,
}

impl ScoreInput {
    pub fn new(symbol: impl Into<String>, sharpe: Option<f64>, volatility: Option<f64>) -> Self {
        Self {
            symbol: symbol.into(),
            sharpe,
            volatility,
        }
    }
}

pub struct RebalancingPlanner {
    settings: RebalanceSettings,
}

impl Default for RebalancingPlanner {
    fn default() -> Self {
        Self::new(RebalanceSettings::default())
    }
}

impl RebalancingPlanner {
    pub fn new(settings: RebalanceSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RebalanceSettings {
        &self.settings
    }

    /// Trades moving `current` to `target` on a portfolio worth `total_value`.
    ///
    /// Trades whose notional is below `min_trade_value` are left out. The plan is
    /// ordered by descending absolute amount, ties broken by symbol.
    pub fn plan(
        current: &Allocation,
        target: &Allocation,
        total_value: f64,
        min_trade_value: f64,
    ) -> Result<Vec<TradeInstruction>> {
        Self::plan_with_prices(current, target, total_value, min_trade_value, &BTreeMap::new())
    }

    /// Like [`plan`](Self::plan), adding share quantities where `prices` has a
    /// positive price for the symbol.
    pub fn plan_with_prices(
        current: &Allocation,
        target: &Allocation,
        total_value: f64,
        min_trade_value: f64,
        prices: &BTreeMap<String, f64>,
    ) -> Result<Vec<TradeInstruction>> {
        if !total_value.is_finite() || total_value < 0.0 {
            return Err(PortfolioError::InvalidInput(format!(
                "Total value must be non-negative, got {}",
                total_value
            )));
        }
        if !min_trade_value.is_finite() || min_trade_value < 0.0 {
            return Err(PortfolioError::InvalidInput(format!(
                "Minimum trade value must be non-negative, got {}",
                min_trade_value
            )));
        }

        let symbols: BTreeSet<&str> = current.symbols().chain(target.symbols()).collect();
        let mut trades = Vec::new();
        for symbol in symbols {
            let current_weight = current.weight(symbol);
            let target_weight = target.weight(symbol);
            let weight_delta = target_weight - current_weight;
            let amount = weight_delta * total_value;
            if amount == 0.0 || amount.abs() < min_trade_value {
                if amount != 0.0 {
                    debug!(
                        "Skipping {} trade of {:.2} below threshold {:.2}",
                        symbol, amount, min_trade_value
                    );
                }
                continue;
            }
            let quantity = prices
                .get(symbol)
                .filter(|p| **p > 0.0)
                .map(|p| amount / p);
            trades.push(TradeInstruction {
                symbol: symbol.to_string(),
                action: if amount > 0.0 {
                    TradeAction::Buy
                } else {
                    TradeAction::Sell
                },
                amount,
                current_weight,
                target_weight,
                weight_delta,
                quantity,
            });
        }

        trades.sort_by(|a, b| {
            b.amount
                .abs()
                .partial_cmp(&a.amount.abs())
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        Ok(trades)
    }

    /// Targets proportional to `sharpe^a / σ^b`.
    ///
    /// Assets with a non-positive or undefined Sharpe, or no volatility, score zero.
    /// When every score is zero the target is equal weight.
    pub fn sharpe_score_targets(&self, inputs: &[ScoreInput]) -> Result<Allocation> {
        let a = self.settings.sharpe_exponent;
        let b = self.settings.volatility_exponent;
        let scores: Vec<(String, f64)> = inputs
            .iter()
            .map(|input| {
                let score = match (input.sharpe, input.volatility) {
                    (Some(sharpe), Some(vol)) if sharpe > 0.0 && vol > 0.0 => {
                        sharpe.powf(a) / vol.powf(b)
                    }
                    _ => 0.0,
                };
                (input.symbol.clone(), if score.is_finite() { score } else { 0.0 })
            })
            .collect();

        if scores.iter().all(|(_, s)| *s <= 0.0) {
            debug!("No positive Sharpe scores; falling back to equal weight");
            let symbols: Vec<&str> = inputs.iter().map(|i| i.symbol.as_str()).collect();
            return Allocation::equal_weight(&symbols);
        }
        Allocation::from_values(scores)
    }

    /// Targets proportional to `(1/σ)^k` with `k` from the configured risk profile.
    /// A missing or non-positive σ is replaced by the median of the known ones.
    pub fn inverse_volatility_targets(&self, inputs: &[ScoreInput]) -> Result<Allocation> {
        self.inverse_volatility_targets_for(inputs, self.settings.risk_profile)
    }

    pub fn inverse_volatility_targets_for(
        &self,
        inputs: &[ScoreInput],
        profile: RiskProfile,
    ) -> Result<Allocation> {
        let mut known: Vec<f64> = inputs
            .iter()
            .filter_map(|i| i.volatility)
            .filter(|v| v.is_finite() && *v > 0.0)
            .collect();
        if known.is_empty() {
            let symbols: Vec<&str> = inputs.iter().map(|i| i.symbol.as_str()).collect();
            return Allocation::equal_weight(&symbols);
        }
        known.sort_by(|x, y| x.partial_cmp(y).unwrap_or(Ordering::Equal));
        let mid = known.len() / 2;
        let median = if known.len() % 2 == 0 {
            0.5 * (known[mid - 1] + known[mid])
        } else {
            known[mid]
        };

        let k = profile.exponent();
        Allocation::from_values(inputs.iter().map(|input| {
            let vol = input
                .volatility
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(median);
            (input.symbol.clone(), (1.0 / vol).powf(k))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(pairs: &[(&str, f64)]) -> Allocation {
        Allocation::new(pairs.iter().map(|(s, w)| (s.to_string(), *w)).collect()).unwrap()
    }

    #[test]
    fn test_buy_and_threshold() {
        let current = alloc(&[("A", 0.30), ("B", 0.498), ("C", 0.202)]);
        let target = alloc(&[("A", 0.50), ("B", 0.30), ("C", 0.20)]);
        let trades = RebalancingPlanner::plan(&current, &target, 100_000.0, 500.0).unwrap();

        assert_eq!(trades.len(), 2);
        let buy = trades.iter().find(|t| t.symbol == "A").unwrap();
        assert_eq!(buy.action, TradeAction::Buy);
        assert!((buy.amount - 20_000.0).abs() < 1e-6);
        // C moves by $200, under the threshold
        assert!(trades.iter().all(|t| t.symbol != "C"));
    }

    #[test]
    fn test_ordering_and_ties() {
        let current = alloc(&[("B", 0.5), ("A", 0.5)]);
        let target = alloc(&[("A", 0.3), ("B", 0.3), ("C", 0.4)]);
        let trades = RebalancingPlanner::plan(&current, &target, 10_000.0, 0.0).unwrap();
        let order: Vec<&str> = trades.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(order, vec!["C", "A", "B"]);
        assert_eq!(trades[1].action, TradeAction::Sell);
        assert!((trades[1].amount + 2_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_full_exit_and_quantities() {
        let current = alloc(&[("OLD", 1.0)]);
        let target = alloc(&[("NEW", 1.0)]);
        let mut prices = BTreeMap::new();
        prices.insert("NEW".to_string(), 50.0);
        let trades =
            RebalancingPlanner::plan_with_prices(&current, &target, 1_000.0, 10.0, &prices)
                .unwrap();
        assert_eq!(trades.len(), 2);
        let new = trades.iter().find(|t| t.symbol == "NEW").unwrap();
        assert_eq!(new.quantity, Some(20.0));
        let old = trades.iter().find(|t| t.symbol == "OLD").unwrap();
        assert_eq!(old.amount, -1_000.0);
        assert_eq!(old.quantity, None);
    }

    #[test]
    fn test_rejects_negative_total() {
        let a = alloc(&[("A", 1.0)]);
        assert!(RebalancingPlanner::plan(&a, &a, -1.0, 0.0).is_err());
    }

    #[test]
    fn test_sharpe_score_targets() {
        let planner = RebalancingPlanner::default();
        let targets = planner
            .sharpe_score_targets(&[
                ScoreInput::new("A", Some(1.0), Some(0.2)),
                ScoreInput::new("B", Some(0.5), Some(0.2)),
                ScoreInput::new("C", Some(-0.3), Some(0.1)),
                ScoreInput::new("D", None, Some(0.1)),
            ])
            .unwrap();
        assert!((targets.weight("A") - 2.0 / 3.0).abs() < 1e-12);
        assert!((targets.weight("B") - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(targets.weight("C"), 0.0);

        let fallback = planner
            .sharpe_score_targets(&[
                ScoreInput::new("A", Some(-1.0), Some(0.2)),
                ScoreInput::new("B", None, None),
            ])
            .unwrap();
        assert_eq!(fallback.weight("A"), 0.5);
    }

    #[test]
    fn test_inverse_volatility_profiles() {
        let planner = RebalancingPlanner::default();
        let inputs = [
            ScoreInput::new("LOW", None, Some(0.1)),
            ScoreInput::new("HIGH", None, Some(0.4)),
            ScoreInput::new("UNKNOWN", None, None),
        ];
        let balanced = planner.inverse_volatility_targets(&inputs).unwrap();
        // UNKNOWN takes the median, 0.25
        let total = 10.0 + 2.5 + 4.0;
        assert!((balanced.weight("LOW") - 10.0 / total).abs() < 1e-12);
        assert!((balanced.weight("UNKNOWN") - 4.0 / total).abs() < 1e-12);

        let conservative = planner
            .inverse_volatility_targets_for(&inputs, RiskProfile::Conservative)
            .unwrap();
        let aggressive = planner
            .inverse_volatility_targets_for(&inputs, RiskProfile::Aggressive)
            .unwrap();
        assert!(conservative.weight("LOW") > balanced.weight("LOW"));
        assert!(aggressive.weight("LOW") < balanced.weight("LOW"));
    }
}
