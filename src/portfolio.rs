//! Portfolio holdings.

use crate::error::{PortfolioError, Result};
use crate::types::{Currency, Holding};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// A named set of holdings with unique symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    /// Database id once persisted.
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub base_currency: Currency,
    holdings: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct HoldingRow {
    #[serde(alias = "ticker", alias = "Ticker", alias = "Symbol")]
    symbol: String,
    #[serde(alias = "Shares", alias = "quantity")]
    shares: f64,
}

impl Portfolio {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            base_currency: Currency::Usd,
            holdings: BTreeMap::new(),
        }
    }

    pub fn with_base_currency(mut self, currency: Currency) -> Self {
        self.base_currency = currency;
        self
    }

    /// Build from a holding list. Duplicate symbols and negative share counts are
    /// rejected; zero-share rows are dropped.
    pub fn from_holdings(name: impl Into<String>, holdings: Vec<Holding>) -> Result<Self> {
        let mut portfolio = Self::new(name);
        for holding in holdings {
            portfolio.add_holding(holding.symbol, holding.shares)?;
        }
        Ok(portfolio)
    }

    /// Add a new position. Fails if the symbol is already held.
    pub fn add_holding(&mut self, symbol: impl Into<String>, shares: f64) -> Result<()> {
        let symbol = normalize_symbol(symbol.into())?;
        validate_shares(&symbol, shares)?;
        if self.holdings.contains_key(&symbol) {
            return Err(PortfolioError::InvalidInput(format!(
                "Duplicate holding for {}",
                symbol
            )));
        }
        if shares > 0.0 {
            self.holdings.insert(symbol, shares);
        } else {
            debug!("Dropping zero-share holding {}", symbol);
        }
        Ok(())
    }

    /// Insert or replace a position; zero shares removes it.
    pub fn set_holding(&mut self, symbol: impl Into<String>, shares: f64) -> Result<()> {
        let symbol = normalize_symbol(symbol.into())?;
        validate_shares(&symbol, shares)?;
        if shares > 0.0 {
            self.holdings.insert(symbol, shares);
        } else {
            self.holdings.remove(&symbol);
        }
        Ok(())
    }

    pub fn remove_holding(&mut self, symbol: &str) -> Option<f64> {
        self.holdings.remove(symbol)
    }

    pub fn shares(&self, symbol: &str) -> Option<f64> {
        self.holdings.get(symbol).copied()
    }

    pub fn holdings(&self) -> Vec<Holding> {
        self.holdings
            .iter()
            .map(|(s, &n)| Holding::new(s.clone(), n))
            .collect()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.holdings.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.holdings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holdings.is_empty()
    }

    /// Load holdings from a CSV with `ticker`/`symbol` and `shares` columns. The
    /// portfolio is named after the file stem.
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "portfolio".to_string());

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut holdings = Vec::new();
        for result in reader.deserialize::<HoldingRow>() {
            let row = result?;
            holdings.push(Holding::new(row.symbol, row.shares));
        }

        let mut portfolio = Self::from_holdings(name, holdings)?;
        portfolio.description = format!("Imported from {}", path.display());
        info!(
            "Loaded {} holdings from {}",
            portfolio.len(),
            path.display()
        );
        Ok(portfolio)
    }
}

fn normalize_symbol(symbol: String) -> Result<String> {
    let symbol = symbol.trim().to_string();
    if symbol.is_empty() {
        return Err(PortfolioError::InvalidInput("Empty symbol".to_string()));
    }
    Ok(symbol)
}

fn validate_shares(symbol: &str, shares: f64) -> Result<()> {
    if !shares.is_finite() || shares < 0.0 {
        return Err(PortfolioError::InvalidInput(format!(
            "Share count for {} must be non-negative, got {}",
            symbol, shares
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_unique_symbols() {
        let mut p = Portfolio::new("core");
        p.add_holding("AAPL", 10.0).unwrap();
        assert!(p.add_holding("AAPL", 5.0).is_err());
        p.set_holding("AAPL", 5.0).unwrap();
        assert_eq!(p.shares("AAPL"), Some(5.0));
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_rejects_negative_and_drops_zero() {
        let mut p = Portfolio::new("core");
        assert!(p.add_holding("AAPL", -1.0).is_err());
        p.add_holding("MSFT", 0.0).unwrap();
        assert!(p.is_empty());
        p.add_holding("7203.T", 0.5).unwrap();
        assert_eq!(p.symbols(), vec!["7203.T"]);
    }

    #[test]
    fn test_load_csv() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ticker,shares").unwrap();
        writeln!(file, "AAPL,10").unwrap();
        writeln!(file, "7203.T, 100.5").unwrap();
        file.flush().unwrap();

        let p = Portfolio::load_csv(file.path()).unwrap();
        assert_eq!(p.len(), 2);
        assert_eq!(p.shares("7203.T"), Some(100.5));
    }
}
