//! Return-series statistics: annualized volatility, Sharpe ratio, beta and the
//! expected-return/covariance estimates fed to the optimizer.
//!
//! All functions are deterministic and stateless. Volatility is annualized with the
//! square-root-of-time rule over a configurable trading year (252 days by default).

use crate::config::RiskSettings;
use crate::error::{PortfolioError, Result};
use crate::types::PricePoint;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Standard deviations below this are treated as zero.
const ZERO_VARIANCE: f64 = 1e-12;

/// Summary statistics for one asset, cached as the risk-metrics field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Mean daily return × trading days.
    pub annual_return: f64,
    /// Daily standard deviation × √trading days.
    pub volatility: f64,
    /// `None` when volatility is zero.
    pub sharpe: Option<f64>,
    /// Deepest peak-to-trough decline, as a negative decimal.
    pub max_drawdown: f64,
    /// Number of daily returns used.
    pub observations: usize,
    /// Refresh time of the history these metrics were computed from.
    #[serde(default)]
    pub history_refreshed_at: Option<DateTime<Utc>>,
}

/// Annualized expected returns and covariance for a set of assets aligned on
/// common dates.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketInputs {
    pub symbols: Vec<String>,
    pub expected_returns: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
    /// Number of aligned daily returns behind the estimates.
    pub observations: usize,
}

impl MarketInputs {
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Standalone annualized volatility of asset `i`.
    pub fn volatility(&self, i: usize) -> f64 {
        self.covariance[i][i].max(0.0).sqrt()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RiskCalculator {
    trading_days: f64,
}

impl Default for RiskCalculator {
    fn default() -> Self {
        Self { trading_days: 252.0 }
    }
}

impl RiskCalculator {
    pub fn new(trading_days: f64) -> Self {
        Self { trading_days }
    }

    pub fn from_settings(settings: &RiskSettings) -> Self {
        Self::new(settings.trading_days)
    }

    pub fn trading_days(&self) -> f64 {
        self.trading_days
    }

    /// Simple returns `p[t] / p[t-1] - 1`. Steps from a non-positive price are skipped.
    pub fn returns(prices: &[f64]) -> Vec<f64> {
        prices
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| w[1] / w[0] - 1.0)
            .collect()
    }

    /// Simple returns of a dated price history.
    pub fn history_returns(history: &[PricePoint]) -> Vec<f64> {
        let closes: Vec<f64> = history.iter().map(|p| p.close).collect();
        Self::returns(&closes)
    }

    pub fn annualized_return(&self, returns: &[f64]) -> f64 {
        mean(returns) * self.trading_days
    }

    /// Sample standard deviation (n - 1) scaled by √trading days; 0 with fewer than
    /// two returns.
    pub fn annualized_volatility(&self, returns: &[f64]) -> f64 {
        sample_std(returns) * self.trading_days.sqrt()
    }

    /// `(mean × trading days − rf) / σ`. Zero volatility is an error, never NaN or ∞.
    pub fn sharpe(&self, symbol: &str, returns: &[f64], risk_free_rate: f64) -> Result<f64> {
        if returns.len() < 2 {
            return Err(PortfolioError::UndefinedRiskMetric {
                symbol: symbol.to_string(),
                reason: format!("need at least 2 returns, have {}", returns.len()),
            });
        }
        let vol = self.annualized_volatility(returns);
        if vol < ZERO_VARIANCE {
            return Err(PortfolioError::UndefinedRiskMetric {
                symbol: symbol.to_string(),
                reason: "return series has zero variance".to_string(),
            });
        }
        Ok((self.annualized_return(returns) - risk_free_rate) / vol)
    }

    /// Full metric set for a price history.
    pub fn metrics(&self, symbol: &str, history: &[PricePoint], risk_free_rate: f64) -> RiskMetrics {
        let returns = Self::history_returns(history);
        let closes: Vec<f64> = history.iter().map(|p| p.close).collect();
        RiskMetrics {
            annual_return: self.annualized_return(&returns),
            volatility: self.annualized_volatility(&returns),
            sharpe: self.sharpe(symbol, &returns, risk_free_rate).ok(),
            max_drawdown: Self::max_drawdown(&closes),
            observations: returns.len(),
            history_refreshed_at: None,
        }
    }

    /// Estimate μ and Σ from histories aligned on the dates they all share.
    ///
    /// Returns are simple daily returns between consecutive common dates; μ is the
    /// mean × trading days and Σ the sample covariance × trading days.
    pub fn estimate_inputs(&self, histories: &[(String, Vec<PricePoint>)]) -> Result<MarketInputs> {
        if histories.is_empty() {
            return Err(PortfolioError::InvalidInput(
                "Need at least one price history".to_string(),
            ));
        }

        let mut common: Option<BTreeSet<NaiveDate>> = None;
        for (_, history) in histories {
            let dates: BTreeSet<NaiveDate> = history.iter().map(|p| p.date).collect();
            common = Some(match common {
                None => dates,
                Some(c) => c.intersection(&dates).copied().collect(),
            });
        }
        let common = common.unwrap_or_default();
        if common.len() < 3 {
            return Err(PortfolioError::InvalidInput(format!(
                "Histories share only {} dates; need at least 3",
                common.len()
            )));
        }

        let returns_matrix: Vec<Vec<f64>> = histories
            .iter()
            .map(|(_, history)| {
                let closes: Vec<f64> = history
                    .iter()
                    .filter(|p| common.contains(&p.date))
                    .map(|p| p.close)
                    .collect();
                Self::returns(&closes)
            })
            .collect();

        let observations = returns_matrix.iter().map(Vec::len).min().unwrap_or(0);
        if observations < 2 || returns_matrix.iter().any(|r| r.len() != observations) {
            return Err(PortfolioError::InvalidInput(
                "Aligned histories contain non-positive prices".to_string(),
            ));
        }

        let n = histories.len();
        let means: Vec<f64> = returns_matrix.iter().map(|r| mean(r)).collect();
        let expected_returns = means.iter().map(|m| m * self.trading_days).collect();

        let mut covariance = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in i..n {
                let cov = returns_matrix[i]
                    .iter()
                    .zip(returns_matrix[j].iter())
                    .map(|(ri, rj)| (ri - means[i]) * (rj - means[j]))
                    .sum::<f64>()
                    / (observations - 1) as f64
                    * self.trading_days;
                covariance[i][j] = cov;
                covariance[j][i] = cov;
            }
        }

        Ok(MarketInputs {
            symbols: histories.iter().map(|(s, _)| s.clone()).collect(),
            expected_returns,
            covariance,
            observations,
        })
    }

    /// Cov(asset, benchmark) / Var(benchmark) over the overlapping tail of both
    /// series. `None` when the benchmark has no variance.
    pub fn beta(asset_returns: &[f64], benchmark_returns: &[f64]) -> Option<f64> {
        let n = asset_returns.len().min(benchmark_returns.len());
        if n < 2 {
            return None;
        }
        let a = &asset_returns[asset_returns.len() - n..];
        let b = &benchmark_returns[benchmark_returns.len() - n..];
        let (ma, mb) = (mean(a), mean(b));
        let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum::<f64>();
        let var: f64 = b.iter().map(|y| (y - mb).powi(2)).sum::<f64>();
        if var < ZERO_VARIANCE {
            return None;
        }
        Some(cov / var)
    }

    /// Minimum of `p / running_max − 1`; 0 for a monotone rising series.
    pub fn max_drawdown(prices: &[f64]) -> f64 {
        let mut peak = f64::MIN;
        let mut worst = 0.0_f64;
        for &p in prices {
            peak = peak.max(p);
            if peak > 0.0 {
                worst = worst.min(p / peak - 1.0);
            }
        }
        worst
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn dated(closes: &[f64], offset: i64) -> Vec<PricePoint> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PricePoint::new(start + Duration::days(i as i64 + offset), c))
            .collect()
    }

    #[test]
    fn test_returns() {
        let r = RiskCalculator::returns(&[100.0, 110.0, 99.0]);
        assert_eq!(r.len(), 2);
        assert!((r[0] - 0.10).abs() < 1e-12);
        assert!((r[1] + 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_volatility_annualization() {
        let calc = RiskCalculator::default();
        let returns = [0.01, -0.01, 0.01, -0.01];
        let daily = sample_std(&returns);
        let vol = calc.annualized_volatility(&returns);
        assert!((vol - daily * 252f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_sharpe_value() {
        let calc = RiskCalculator::default();
        let returns = [0.02, 0.0, 0.01, 0.03, -0.01];
        let expected = (mean(&returns) * 252.0 - 0.04) / (sample_std(&returns) * 252f64.sqrt());
        let sharpe = calc.sharpe("X", &returns, 0.04).unwrap();
        assert!((sharpe - expected).abs() < 1e-12);
    }

    #[test]
    fn test_zero_variance_sharpe_is_undefined() {
        let calc = RiskCalculator::default();
        let returns = RiskCalculator::returns(&[50.0; 30]);
        let err = calc.sharpe("FLAT", &returns, 0.04).unwrap_err();
        assert!(matches!(err, PortfolioError::UndefinedRiskMetric { .. }));

        let metrics = calc.metrics("FLAT", &dated(&[50.0; 30], 0), 0.04);
        assert_eq!(metrics.volatility, 0.0);
        assert!(metrics.sharpe.is_none());
    }

    #[test]
    fn test_estimate_inputs_aligns_on_common_dates() {
        let calc = RiskCalculator::default();
        let a = dated(&[100.0, 101.0, 102.0, 101.0, 103.0, 104.0], 0);
        // B starts one day later.
        let b = dated(&[50.0, 51.0, 50.5, 51.5, 52.0], 1);
        let inputs = calc
            .estimate_inputs(&[("A".to_string(), a), ("B".to_string(), b)])
            .unwrap();
        assert_eq!(inputs.symbols, vec!["A", "B"]);
        assert_eq!(inputs.observations, 4);
        assert_eq!(inputs.covariance[0][1], inputs.covariance[1][0]);
        assert!(inputs.covariance[0][0] > 0.0);
    }

    #[test]
    fn test_estimate_inputs_needs_overlap() {
        let calc = RiskCalculator::default();
        let a = dated(&[1.0, 2.0, 3.0], 0);
        let b = dated(&[1.0, 2.0, 3.0], 10);
        assert!(calc
            .estimate_inputs(&[("A".to_string(), a), ("B".to_string(), b)])
            .is_err());
    }

    #[test]
    fn test_beta() {
        let bench = [0.01, -0.02, 0.015, 0.0, -0.01];
        let asset: Vec<f64> = bench.iter().map(|r| r * 1.5).collect();
        let beta = RiskCalculator::beta(&asset, &bench).unwrap();
        assert!((beta - 1.5).abs() < 1e-9);
        assert!(RiskCalculator::beta(&asset, &[0.0; 5]).is_none());
    }

    #[test]
    fn test_max_drawdown() {
        let dd = RiskCalculator::max_drawdown(&[100.0, 120.0, 90.0, 130.0]);
        assert!((dd + 0.25).abs() < 1e-12);
        assert_eq!(RiskCalculator::max_drawdown(&[1.0, 2.0, 3.0]), 0.0);
    }
}
