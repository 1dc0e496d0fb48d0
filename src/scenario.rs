//! Beta-driven market crash scenarios and FX stress.
//!
//! Single-factor linear model: an asset moves by `beta × shock`, and the
//! portfolio by `Σ weight × beta × shock`. Shocks are percentages (`-20.0` is a
//! 20% market drop).

use crate::config::ScenarioSettings;
use crate::error::{PortfolioError, Result};
use crate::types::{Allocation, Currency};
use crate::valuation::Valuation;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

const DEFENSIVE_SUGGESTIONS: [&str; 4] = [
    "Keep 10-20% in cash to buy during a drawdown",
    "Add low-beta holdings (beta < 0.8) or bond funds",
    "Add gold or defensive sectors such as consumer staples and utilities",
    "Take profits gradually on high-beta, high-weight positions",
];

/// One asset's share of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetImpact {
    pub symbol: String,
    pub weight: f64,
    pub beta: f64,
    /// Beta was missing and the default was used.
    pub beta_assumed: bool,
    /// `beta × shock`, in percent.
    pub expected_move_pct: f64,
    /// Expected move less half a daily standard deviation, in percent.
    pub pessimistic_move_pct: f64,
    /// `weight × beta × shock`, in percent of the portfolio.
    pub contribution_pct: f64,
    /// Change in value, when a total value was given.
    pub value_delta: Option<f64>,
}

/// Risk-reduction hint attached to a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mitigation {
    HighBeta { symbol: String, beta: f64, weight: f64 },
    Concentrated { symbol: String, weight: f64 },
    Defensive { suggestion: String },
}

impl fmt::Display for Mitigation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mitigation::HighBeta { symbol, beta, weight } => write!(
                f,
                "{} has beta {:.2} at {:.1}% of the portfolio; consider trimming it",
                symbol,
                beta,
                weight * 100.0
            ),
            Mitigation::Concentrated { symbol, weight } => write!(
                f,
                "{} is {:.1}% of the portfolio; diversify to reduce concentration",
                symbol,
                weight * 100.0
            ),
            Mitigation::Defensive { suggestion } => write!(f, "{}", suggestion),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub shock_pct: f64,
    /// `Σ weight × beta × shock`, in percent.
    pub portfolio_impact_pct: f64,
    pub pessimistic_impact_pct: f64,
    /// Weighted average beta over the allocation, assumed betas included.
    pub portfolio_beta: f64,
    /// Ranked by `weight × beta`, largest first.
    pub assets: Vec<AssetImpact>,
    pub assumed_betas: Vec<String>,
    pub total_value: Option<f64>,
    pub value_delta: Option<f64>,
    pub pessimistic_value_delta: Option<f64>,
    pub mitigations: Vec<Mitigation>,
}

impl ScenarioResult {
    pub fn new_value(&self) -> Option<f64> {
        Some(self.total_value? + self.value_delta?)
    }

    /// Assets whose `weight × beta` is largest.
    pub fn top_drivers(&self, count: usize) -> &[AssetImpact] {
        &self.assets[..count.min(self.assets.len())]
    }
}

/// Optional inputs that enrich a scenario.
#[derive(Debug, Clone, Default)]
pub struct ScenarioContext {
    /// Portfolio value used for currency deltas.
    pub total_value: Option<f64>,
    /// Annualized volatilities (decimals) for the pessimistic estimate.
    pub volatilities: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FxStressAsset {
    pub symbol: String,
    pub currency: Currency,
    pub value_jpy: f64,
    pub stressed_value_jpy: f64,
}

/// JPY-denominated equity and FX stress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FxStressResult {
    pub equity_shock_pct: f64,
    pub fx_shock_pct: f64,
    pub usd_jpy: f64,
    pub stressed_usd_jpy: f64,
    pub value_jpy: f64,
    pub stressed_value_jpy: f64,
    pub change_jpy: f64,
    pub change_pct: f64,
    pub assets: Vec<FxStressAsset>,
}

pub struct CrashSimulator {
    settings: ScenarioSettings,
    trading_days: f64,
}

impl Default for CrashSimulator {
    fn default() -> Self {
        Self::new(ScenarioSettings::default())
    }
}

impl CrashSimulator {
    pub fn new(settings: ScenarioSettings) -> Self {
        Self {
            settings,
            trading_days: 252.0,
        }
    }

    pub fn with_trading_days(mut self, trading_days: f64) -> Self {
        self.trading_days = trading_days;
        self
    }

    pub fn settings(&self) -> &ScenarioSettings {
        &self.settings
    }

    /// Apply a market shock (percent) to an allocation.
    pub fn simulate(
        &self,
        allocation: &Allocation,
        betas: &BTreeMap<String, f64>,
        shock_pct: f64,
    ) -> Result<ScenarioResult> {
        self.simulate_with(allocation, betas, shock_pct, &ScenarioContext::default())
    }

    pub fn simulate_with(
        &self,
        allocation: &Allocation,
        betas: &BTreeMap<String, f64>,
        shock_pct: f64,
        context: &ScenarioContext,
    ) -> Result<ScenarioResult> {
        if !shock_pct.is_finite() {
            return Err(PortfolioError::InvalidInput(format!(
                "Shock must be finite, got {}",
                shock_pct
            )));
        }
        if let Some(total) = context.total_value {
            if !total.is_finite() || total < 0.0 {
                return Err(PortfolioError::InvalidInput(format!(
                    "Total value must be non-negative, got {}",
                    total
                )));
            }
        }

        let daily_scale = 0.5 / self.trading_days.sqrt() * 100.0;
        let mut assumed_betas = Vec::new();
        let mut assets: Vec<AssetImpact> = allocation
            .iter()
            .map(|(symbol, weight)| {
                let (beta, beta_assumed) = match betas.get(symbol) {
                    Some(b) if b.is_finite() => (*b, false),
                    _ => {
                        assumed_betas.push(symbol.to_string());
                        (self.settings.default_beta, true)
                    }
                };
                let sigma = context
                    .volatilities
                    .get(symbol)
                    .copied()
                    .filter(|v| v.is_finite() && *v > 0.0)
                    .unwrap_or(self.settings.default_volatility);
                let expected_move_pct = beta * shock_pct;
                AssetImpact {
                    symbol: symbol.to_string(),
                    weight,
                    beta,
                    beta_assumed,
                    expected_move_pct,
                    pessimistic_move_pct: expected_move_pct - sigma * daily_scale,
                    contribution_pct: weight * expected_move_pct,
                    value_delta: context
                        .total_value
                        .map(|total| total * weight * expected_move_pct / 100.0),
                }
            })
            .collect();

        if !assumed_betas.is_empty() {
            debug!(
                "Assuming beta {} for {}",
                self.settings.default_beta,
                assumed_betas.join(", ")
            );
        }

        let portfolio_impact_pct: f64 = assets.iter().map(|a| a.contribution_pct).sum();
        let pessimistic_impact_pct: f64 = assets
            .iter()
            .map(|a| a.weight * a.pessimistic_move_pct)
            .sum();
        let portfolio_beta: f64 = assets.iter().map(|a| a.weight * a.beta).sum();

        assets.sort_by(|a, b| {
            (b.weight * b.beta)
                .partial_cmp(&(a.weight * a.beta))
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        Ok(ScenarioResult {
            shock_pct,
            portfolio_impact_pct,
            pessimistic_impact_pct,
            portfolio_beta,
            assets,
            assumed_betas,
            total_value: context.total_value,
            value_delta: context
                .total_value
                .map(|total| total * portfolio_impact_pct / 100.0),
            pessimistic_value_delta: context
                .total_value
                .map(|total| total * pessimistic_impact_pct / 100.0),
            mitigations: self.mitigations(allocation, betas),
        })
    }

    /// One scenario per shock.
    pub fn simulate_many(
        &self,
        allocation: &Allocation,
        betas: &BTreeMap<String, f64>,
        shocks_pct: &[f64],
        context: &ScenarioContext,
    ) -> Result<Vec<ScenarioResult>> {
        shocks_pct
            .iter()
            .map(|&shock| self.simulate_with(allocation, betas, shock, context))
            .collect()
    }

    /// The configured shock sweep.
    pub fn sweep(
        &self,
        allocation: &Allocation,
        betas: &BTreeMap<String, f64>,
        context: &ScenarioContext,
    ) -> Result<Vec<ScenarioResult>> {
        self.simulate_many(allocation, betas, &self.settings.shocks_pct, context)
    }

    /// High-beta and concentrated holdings, heaviest first, then generic
    /// defensive suggestions.
    pub fn mitigations(
        &self,
        allocation: &Allocation,
        betas: &BTreeMap<String, f64>,
    ) -> Vec<Mitigation> {
        let mut by_weight: Vec<(&str, f64)> = allocation.iter().collect();
        by_weight.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        let mut mitigations = Vec::new();
        for (symbol, weight) in &by_weight {
            if let Some(&beta) = betas.get(*symbol) {
                if beta > self.settings.high_beta_threshold {
                    mitigations.push(Mitigation::HighBeta {
                        symbol: symbol.to_string(),
                        beta,
                        weight: *weight,
                    });
                }
            }
        }
        for (symbol, weight) in &by_weight {
            if *weight > self.settings.concentration_threshold {
                mitigations.push(Mitigation::Concentrated {
                    symbol: symbol.to_string(),
                    weight: *weight,
                });
            }
        }
        mitigations.extend(DEFENSIVE_SUGGESTIONS.iter().map(|s| Mitigation::Defensive {
            suggestion: s.to_string(),
        }));
        mitigations
    }

    /// Stress a valuation in JPY: the equity shock hits every asset and the FX
    /// shock (a move in USD/JPY) hits every asset not priced in yen.
    pub fn fx_stress(
        &self,
        valuation: &Valuation,
        equity_shock_pct: f64,
        fx_shock_pct: f64,
    ) -> Result<FxStressResult> {
        if !equity_shock_pct.is_finite() || !fx_shock_pct.is_finite() {
            return Err(PortfolioError::InvalidInput(
                "Stress shocks must be finite".to_string(),
            ));
        }
        let equity = 1.0 + equity_shock_pct / 100.0;
        let fx = 1.0 + fx_shock_pct / 100.0;

        let assets: Vec<FxStressAsset> = valuation
            .assets
            .iter()
            .map(|a| {
                let mut stressed = a.value_jpy * equity;
                if a.currency != Currency::Jpy {
                    stressed *= fx;
                }
                FxStressAsset {
                    symbol: a.symbol.clone(),
                    currency: a.currency,
                    value_jpy: a.value_jpy,
                    stressed_value_jpy: stressed,
                }
            })
            .collect();

        let value_jpy: f64 = assets.iter().map(|a| a.value_jpy).sum();
        let stressed_value_jpy: f64 = assets.iter().map(|a| a.stressed_value_jpy).sum();
        let change_jpy = stressed_value_jpy - value_jpy;
        let change_pct = if value_jpy > 0.0 {
            change_jpy / value_jpy * 100.0
        } else {
            0.0
        };

        Ok(FxStressResult {
            equity_shock_pct,
            fx_shock_pct,
            usd_jpy: valuation.usd_jpy,
            stressed_usd_jpy: valuation.usd_jpy * fx,
            value_jpy,
            stressed_value_jpy,
            change_jpy,
            change_pct,
            assets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::Portfolio;
    use crate::valuation::ValuationEngine;

    fn two_assets() -> (Allocation, BTreeMap<String, f64>) {
        let mut w = BTreeMap::new();
        w.insert("A".to_string(), 0.6);
        w.insert("B".to_string(), 0.4);
        let mut betas = BTreeMap::new();
        betas.insert("A".to_string(), 1.2);
        betas.insert("B".to_string(), 0.8);
        (Allocation::new(w).unwrap(), betas)
    }

    #[test]
    fn test_linear_impact() {
        let (alloc, betas) = two_assets();
        let result = CrashSimulator::default().simulate(&alloc, &betas, -10.0).unwrap();
        assert!((result.portfolio_impact_pct + 10.4).abs() < 1e-9);
        assert_eq!(result.assets[0].symbol, "A");
        assert!((result.assets[0].expected_move_pct + 12.0).abs() < 1e-9);
        assert!(result.assumed_betas.is_empty());
        assert!((result.portfolio_beta - 1.04).abs() < 1e-12);
        assert!(result.pessimistic_impact_pct < result.portfolio_impact_pct);
    }

    #[test]
    fn test_assumed_beta_and_value_delta() {
        let (alloc, mut betas) = two_assets();
        betas.remove("B");
        let context = ScenarioContext {
            total_value: Some(100_000.0),
            volatilities: BTreeMap::new(),
        };
        let result = CrashSimulator::default()
            .simulate_with(&alloc, &betas, -20.0, &context)
            .unwrap();
        assert_eq!(result.assumed_betas, vec!["B".to_string()]);
        // -0.6*1.2*20 - 0.4*1.0*20 = -22.4%
        assert!((result.portfolio_impact_pct + 22.4).abs() < 1e-9);
        assert!((result.value_delta.unwrap() + 22_400.0).abs() < 1e-6);
        assert!((result.new_value().unwrap() - 77_600.0).abs() < 1e-6);
    }

    #[test]
    fn test_pessimistic_uses_daily_sigma() {
        let (alloc, betas) = two_assets();
        let mut vols = BTreeMap::new();
        vols.insert("A".to_string(), 0.252_f64.sqrt());
        let context = ScenarioContext {
            total_value: None,
            volatilities: vols,
        };
        let result = CrashSimulator::default()
            .simulate_with(&alloc, &betas, -10.0, &context)
            .unwrap();
        let a = result.assets.iter().find(|a| a.symbol == "A").unwrap();
        // sqrt(0.252) / sqrt(252) = 0.0316..; half of it in percent
        let expected = -12.0 - 0.5 * (0.252_f64.sqrt() / 252.0_f64.sqrt()) * 100.0;
        assert!((a.pessimistic_move_pct - expected).abs() < 1e-9);
    }

    #[test]
    fn test_sweep_and_mitigations() {
        let mut w = BTreeMap::new();
        w.insert("HOT".to_string(), 0.5);
        w.insert("SAFE".to_string(), 0.5);
        let alloc = Allocation::new(w).unwrap();
        let mut betas = BTreeMap::new();
        betas.insert("HOT".to_string(), 2.0);
        betas.insert("SAFE".to_string(), 0.5);

        let sim = CrashSimulator::default();
        let results = sim.sweep(&alloc, &betas, &ScenarioContext::default()).unwrap();
        assert_eq!(results.len(), 4);
        assert!(results
            .windows(2)
            .all(|w| w[1].portfolio_impact_pct < w[0].portfolio_impact_pct));

        let m = &results[0].mitigations;
        assert!(matches!(&m[0], Mitigation::HighBeta { symbol, .. } if symbol == "HOT"));
        let concentrated = m
            .iter()
            .filter(|x| matches!(x, Mitigation::Concentrated { .. }))
            .count();
        assert_eq!(concentrated, 2);
    }

    #[test]
    fn test_fx_stress_hits_foreign_assets_only() {
        let mut p = Portfolio::new("mixed");
        p.add_holding("AAPL", 10.0).unwrap();
        p.add_holding("7203.T", 100.0).unwrap();
        let mut prices = BTreeMap::new();
        prices.insert("AAPL".to_string(), 100.0);
        prices.insert("7203.T".to_string(), 1_000.0);
        let valuation = ValuationEngine::value_with_prices(&p, &prices, 100.0).unwrap();

        let stress = CrashSimulator::default()
            .fx_stress(&valuation, -10.0, -5.0)
            .unwrap();
        let aapl = stress.assets.iter().find(|a| a.symbol == "AAPL").unwrap();
        let toyota = stress.assets.iter().find(|a| a.symbol == "7203.T").unwrap();
        assert!((aapl.stressed_value_jpy - 100_000.0 * 0.9 * 0.95).abs() < 1e-6);
        assert!((toyota.stressed_value_jpy - 90_000.0).abs() < 1e-6);
        assert!((stress.stressed_usd_jpy - 95.0).abs() < 1e-12);
        assert!(stress.change_pct < -10.0);
    }
}
