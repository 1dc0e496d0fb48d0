//! Portfolio valuation in USD and JPY.

use crate::cache::MarketSnapshot;
use crate::error::{PortfolioError, Result};
use crate::portfolio::Portfolio;
use crate::types::{Allocation, Currency};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// One holding valued in both currencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetValuation {
    pub symbol: String,
    pub name: String,
    pub sector: Option<String>,
    pub shares: f64,
    /// Price in the asset's own currency.
    pub price: f64,
    pub currency: Currency,
    pub value_usd: f64,
    pub value_jpy: f64,
    /// Share of the portfolio's total value.
    pub ratio: f64,
}

impl AssetValuation {
    pub fn value_in(&self, currency: Currency) -> f64 {
        match currency {
            Currency::Usd => self.value_usd,
            Currency::Jpy => self.value_jpy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Valuation {
    /// Yen per dollar used for conversion.
    pub usd_jpy: f64,
    pub assets: Vec<AssetValuation>,
    pub total_usd: f64,
    pub total_jpy: f64,
    /// Holdings left out because no price was available, with the reason.
    pub excluded: BTreeMap<String, String>,
}

impl Valuation {
    pub fn get(&self, symbol: &str) -> Option<&AssetValuation> {
        self.assets.iter().find(|a| a.symbol == symbol)
    }

    pub fn total_in(&self, currency: Currency) -> f64 {
        match currency {
            Currency::Usd => self.total_usd,
            Currency::Jpy => self.total_jpy,
        }
    }

    /// Current weights by market value.
    pub fn allocation(&self) -> Result<Allocation> {
        if self.assets.is_empty() {
            return Err(PortfolioError::InvalidInput(
                "Nothing to allocate: no valued holdings".to_string(),
            ));
        }
        Allocation::from_values(self.assets.iter().map(|a| (a.symbol.clone(), a.value_usd)))
    }

    /// Prices in each asset's own currency.
    pub fn prices(&self) -> BTreeMap<String, f64> {
        self.assets
            .iter()
            .map(|a| (a.symbol.clone(), a.price))
            .collect()
    }

    /// Prices converted to `currency`, for share quantities against trade amounts
    /// in that currency.
    pub fn prices_in(&self, currency: Currency) -> BTreeMap<String, f64> {
        self.assets
            .iter()
            .map(|a| {
                let price = match (a.currency, currency) {
                    (Currency::Usd, Currency::Jpy) => a.price * self.usd_jpy,
                    (Currency::Jpy, Currency::Usd) => a.price / self.usd_jpy,
                    _ => a.price,
                };
                (a.symbol.clone(), price)
            })
            .collect()
    }

    pub fn prices_usd(&self) -> BTreeMap<String, f64> {
        self.prices_in(Currency::Usd)
    }

    /// Value grouped by sector, unknown sectors under "Other".
    pub fn by_sector(&self) -> BTreeMap<String, f64> {
        let mut sectors = BTreeMap::new();
        for asset in &self.assets {
            let sector = asset.sector.clone().unwrap_or_else(|| "Other".to_string());
            *sectors.entry(sector).or_insert(0.0) += asset.value_usd;
        }
        sectors
    }
}

pub struct ValuationEngine;

impl ValuationEngine {
    /// Value a portfolio against a market snapshot.
    pub fn value(portfolio: &Portfolio, snapshot: &MarketSnapshot) -> Result<Valuation> {
        let mut priced = BTreeMap::new();
        let mut excluded = BTreeMap::new();
        for symbol in portfolio.symbols() {
            match snapshot.get(&symbol) {
                Some(asset) => {
                    priced.insert(
                        symbol,
                        PricedAsset {
                            price: asset.price,
                            currency: asset.currency,
                            name: asset.metadata.name.clone(),
                            sector: asset.metadata.sector.clone(),
                        },
                    );
                }
                None => {
                    let reason = snapshot
                        .failures
                        .get(&symbol)
                        .cloned()
                        .unwrap_or_else(|| "not in snapshot".to_string());
                    excluded.insert(symbol, reason);
                }
            }
        }
        Self::build(portfolio, priced, excluded, snapshot.usd_jpy.value)
    }

    /// Value a portfolio from bare prices; currency follows the symbol convention.
    pub fn value_with_prices(
        portfolio: &Portfolio,
        prices: &BTreeMap<String, f64>,
        usd_jpy: f64,
    ) -> Result<Valuation> {
        let mut priced = BTreeMap::new();
        let mut excluded = BTreeMap::new();
        for symbol in portfolio.symbols() {
            match prices.get(&symbol) {
                Some(&price) => {
                    priced.insert(
                        symbol.clone(),
                        PricedAsset {
                            price,
                            currency: Currency::for_symbol(&symbol),
                            name: symbol,
                            sector: None,
                        },
                    );
                }
                None => {
                    excluded.insert(symbol, "no price".to_string());
                }
            }
        }
        Self::build(portfolio, priced, excluded, usd_jpy)
    }

    fn build(
        portfolio: &Portfolio,
        priced: BTreeMap<String, PricedAsset>,
        excluded: BTreeMap<String, String>,
        usd_jpy: f64,
    ) -> Result<Valuation> {
        if !(usd_jpy.is_finite() && usd_jpy > 0.0) {
            return Err(PortfolioError::InvalidInput(format!(
                "USD/JPY rate must be positive, got {}",
                usd_jpy
            )));
        }
        for (symbol, reason) in &excluded {
            warn!("Excluding {} from valuation: {}", symbol, reason);
        }

        let mut assets: Vec<AssetValuation> = priced
            .into_iter()
            .filter_map(|(symbol, p)| {
                let shares = portfolio.shares(&symbol)?;
                let native = shares * p.price;
                let (value_usd, value_jpy) = match p.currency {
                    Currency::Usd => (native, native * usd_jpy),
                    Currency::Jpy => (native / usd_jpy, native),
                };
                Some(AssetValuation {
                    symbol,
                    name: p.name,
                    sector: p.sector,
                    shares,
                    price: p.price,
                    currency: p.currency,
                    value_usd,
                    value_jpy,
                    ratio: 0.0,
                })
            })
            .collect();

        let total_usd: f64 = assets.iter().map(|a| a.value_usd).sum();
        let total_jpy: f64 = assets.iter().map(|a| a.value_jpy).sum();
        if total_usd > 0.0 {
            for asset in &mut assets {
                asset.ratio = asset.value_usd / total_usd;
            }
        }

        Ok(Valuation {
            usd_jpy,
            assets,
            total_usd,
            total_jpy,
            excluded,
        })
    }
}

struct PricedAsset {
    price: f64,
    currency: Currency,
    name: String,
    sector: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Portfolio {
        let mut p = Portfolio::new("mixed");
        p.add_holding("AAPL", 10.0).unwrap();
        p.add_holding("7203.T", 100.0).unwrap();
        p.add_holding("GONE", 1.0).unwrap();
        p
    }

    #[test]
    fn test_mixed_currency_valuation() {
        let mut prices = BTreeMap::new();
        prices.insert("AAPL".to_string(), 150.0);
        prices.insert("7203.T".to_string(), 3000.0);

        let v = ValuationEngine::value_with_prices(&sample(), &prices, 150.0).unwrap();
        let aapl = v.get("AAPL").unwrap();
        assert_eq!(aapl.value_usd, 1500.0);
        assert_eq!(aapl.value_jpy, 225_000.0);

        let toyota = v.get("7203.T").unwrap();
        assert_eq!(toyota.currency, Currency::Jpy);
        assert_eq!(toyota.value_jpy, 300_000.0);
        assert!((toyota.value_usd - 2000.0).abs() < 1e-9);

        assert!((v.total_usd - 3500.0).abs() < 1e-9);
        assert!((v.total_jpy - 525_000.0).abs() < 1e-6);
        assert!(v.excluded.contains_key("GONE"));

        let alloc = v.allocation().unwrap();
        assert!((alloc.weight("AAPL") - 1500.0 / 3500.0).abs() < 1e-12);
        assert!((v.prices_usd()["7203.T"] - 20.0).abs() < 1e-12);

        let yen = v.prices_in(Currency::Jpy);
        assert!((yen["AAPL"] - 22_500.0).abs() < 1e-9);
        assert_eq!(yen["7203.T"], 3000.0);
    }

    #[test]
    fn test_invalid_rate() {
        let prices = BTreeMap::new();
        assert!(ValuationEngine::value_with_prices(&sample(), &prices, 0.0).is_err());
    }
}
