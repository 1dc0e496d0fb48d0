//! Core data types shared across the cache, analytics and planning modules.

use crate::error::{PortfolioError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tolerance applied to allocation weight sums and bounds.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Pricing currency of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Currency {
    #[default]
    Usd,
    Jpy,
}

impl Currency {
    /// Infer the currency from symbol convention: Tokyo listings end in `.T`.
    pub fn for_symbol(symbol: &str) -> Self {
        if symbol.ends_with(".T") {
            Currency::Jpy
        } else {
            Currency::Usd
        }
    }

    /// Parse an ISO code as reported by a data vendor.
    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "USD" => Some(Currency::Usd),
            "JPY" => Some(Currency::Jpy),
            _ => None,
        }
    }

    /// ISO code.
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Jpy => "JPY",
        }
    }

    /// Currency symbol used in reports.
    pub fn sign(&self) -> &'static str {
        match self {
            Currency::Usd => "$",
            Currency::Jpy => "¥",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Descriptive attributes of an asset. Long-lived; cached under the metadata TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AssetMetadata {
    pub name: String,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub country: Option<String>,
    /// ISO currency code as reported by the vendor.
    pub currency: Option<String>,
}

impl AssetMetadata {
    /// Metadata with only a display name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A single daily closing price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: f64,
}

impl PricePoint {
    pub fn new(date: NaiveDate, close: f64) -> Self {
        Self { date, close }
    }
}

/// A position in a portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    /// Share count; fractional shares are allowed.
    pub shares: f64,
}

impl Holding {
    pub fn new(symbol: impl Into<String>, shares: f64) -> Self {
        Self {
            symbol: symbol.into(),
            shares,
        }
    }
}

/// Normalized weight distribution across assets.
///
/// Every weight lies in `[0, 1]` and the weights sum to 1 within
/// [`WEIGHT_TOLERANCE`]. Allocations are always derived (from an optimizer or from
/// market values) and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Allocation {
    weights: BTreeMap<String, f64>,
}

impl Allocation {
    /// Build an allocation from weights that already sum to one.
    pub fn new(weights: BTreeMap<String, f64>) -> Result<Self> {
        if weights.is_empty() {
            return Err(PortfolioError::InvalidInput(
                "Allocation needs at least one asset".to_string(),
            ));
        }

        let mut cleaned = BTreeMap::new();
        for (symbol, w) in weights {
            if !w.is_finite() || w < -WEIGHT_TOLERANCE || w > 1.0 + WEIGHT_TOLERANCE {
                return Err(PortfolioError::InvalidInput(format!(
                    "Weight for {} out of range: {}",
                    symbol, w
                )));
            }
            cleaned.insert(symbol, w.clamp(0.0, 1.0));
        }

        let total: f64 = cleaned.values().sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(PortfolioError::InvalidInput(format!(
                "Weights sum to {:.8}, expected 1.0",
                total
            )));
        }

        Ok(Self { weights: cleaned })
    }

    /// Normalize non-negative values (e.g. market values) into weights.
    pub fn from_values<I, S>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut raw = BTreeMap::new();
        for (symbol, v) in values {
            let symbol = symbol.into();
            if !v.is_finite() || v < 0.0 {
                return Err(PortfolioError::InvalidInput(format!(
                    "Value for {} must be non-negative, got {}",
                    symbol, v
                )));
            }
            *raw.entry(symbol).or_insert(0.0) += v;
        }

        let total: f64 = raw.values().sum();
        if total <= 0.0 {
            return Err(PortfolioError::InvalidInput(
                "Values must sum to a positive amount".to_string(),
            ));
        }

        Self::new(raw.into_iter().map(|(s, v)| (s, v / total)).collect())
    }

    /// Build from a weight vector aligned with `symbols`.
    ///
    /// Tiny negative solver noise is clipped; the vector is then renormalized.
    /// A vector whose sum deviates from one by more than `tolerance` is rejected.
    pub fn from_vector(symbols: &[String], weights: &[f64], tolerance: f64) -> Result<Self> {
        if symbols.len() != weights.len() {
            return Err(PortfolioError::InvalidInput(format!(
                "Got {} weights for {} symbols",
                weights.len(),
                symbols.len()
            )));
        }

        let clipped: Vec<f64> = weights.iter().map(|w| w.clamp(0.0, 1.0)).collect();
        let total: f64 = clipped.iter().sum();
        if !total.is_finite() || (total - 1.0).abs() > tolerance {
            return Err(PortfolioError::InvalidInput(format!(
                "Weight vector sums to {:.8}, tolerance {:e}",
                total, tolerance
            )));
        }

        Self::new(
            symbols
                .iter()
                .cloned()
                .zip(clipped.into_iter().map(|w| w / total))
                .collect(),
        )
    }

    /// Equal weight across the given symbols.
    pub fn equal_weight<S: AsRef<str>>(symbols: &[S]) -> Result<Self> {
        if symbols.is_empty() {
            return Err(PortfolioError::InvalidInput(
                "Equal weight needs at least one asset".to_string(),
            ));
        }
        let w = 1.0 / symbols.len() as f64;
        Self::new(
            symbols
                .iter()
                .map(|s| (s.as_ref().to_string(), w))
                .collect(),
        )
    }

    /// Entire allocation in one asset.
    pub fn single(symbol: impl Into<String>) -> Self {
        let mut weights = BTreeMap::new();
        weights.insert(symbol.into(), 1.0);
        Self { weights }
    }

    /// Weight for a symbol, zero when absent.
    pub fn weight(&self, symbol: &str) -> f64 {
        self.weights.get(symbol).copied().unwrap_or(0.0)
    }

    /// Iterate `(symbol, weight)` in symbol order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(s, w)| (s.as_str(), *w))
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(|s| s.as_str())
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.weights.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Sum of weights; 1.0 within tolerance for any non-empty allocation.
    pub fn total(&self) -> f64 {
        self.weights.values().sum()
    }

    /// Weights aligned with `symbols`, zero for missing entries.
    pub fn to_vector(&self, symbols: &[String]) -> Vec<f64> {
        symbols.iter().map(|s| self.weight(s)).collect()
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }
}
