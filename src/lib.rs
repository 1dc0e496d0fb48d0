//! Sena - staleness-aware market data and portfolio analytics for USD/JPY portfolios.
//!
//! # Overview
//!
//! Sena values multi-asset portfolios priced in US dollars and Japanese yen and
//! turns cached market data into portfolio decisions:
//!
//! - **Field cache**: every market attribute has its own refresh time and TTL class,
//!   stale values are served (and flagged) when the data source is down
//! - **Risk metrics**: annualized return, volatility, Sharpe, beta and drawdown
//! - **Optimization**: long-only max-Sharpe, min-volatility and the efficient frontier
//! - **Rebalancing**: minimal trade lists toward an optimizer or heuristic target
//! - **Crash scenarios**: beta-driven market shocks and USD/JPY stress
//! - **Persistence**: SQLite-backed cache store and portfolio records
//!
//! # Quick Start
//!
//! ```no_run
//! use sena::{CacheManager, EngineConfig, Portfolio, PortfolioEngine, RunOptions};
//! use sena::gateway::CsvGateway;
//! use std::sync::Arc;
//!
//! let config = EngineConfig::default();
//! let gateway = Arc::new(CsvGateway::new("data"));
//! let cache = Arc::new(CacheManager::in_memory(gateway, &config));
//! let engine = PortfolioEngine::new(cache, config);
//!
//! let portfolio = Portfolio::load_csv("portfolio.csv").unwrap();
//! let report = engine.run(&portfolio, &RunOptions::default()).unwrap();
//!
//! if let Some(opt) = &report.optimization {
//!     println!("Max Sharpe: {:?}", opt.max_sharpe.sharpe);
//! }
//! for trade in &report.trades {
//!     println!("{} {} {:.2}", trade.action, trade.symbol, trade.amount);
//! }
//! ```
//!
//! # Modules
//!
//! - [`types`]: Core data types (Currency, Holding, PricePoint, Allocation)
//! - [`gateway`]: Market data source trait, CSV and timeout implementations
//! - [`cache`]: Per-field TTL cache, asset and market snapshots
//! - [`risk`]: Return, volatility, Sharpe and covariance estimation
//! - [`portfolio`]: Holdings
//! - [`valuation`]: Dual-currency valuation
//! - [`optimizer`]: Mean-variance optimization
//! - [`rebalance`]: Trade planning and heuristic targets
//! - [`scenario`]: Crash scenarios and FX stress
//! - [`store`]: SQLite persistence
//! - [`engine`]: One portfolio run end to end
//! - [`analytics`]: Terminal and JSON reports
//! - [`config`]: TOML configuration file support

pub mod analytics;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod optimizer;
pub mod portfolio;
pub mod rebalance;
pub mod risk;
pub mod scenario;
pub mod store;
pub mod types;
pub mod valuation;

// Re-exports for convenience
pub use analytics::ReportFormatter;
pub use cache::{AssetSnapshot, CacheManager, FieldCache, FieldClass, MarketSnapshot};
pub use config::EngineConfig;
pub use engine::{PortfolioEngine, PortfolioReport, RunOptions, TargetStrategy};
pub use error::{PortfolioError, Result};
pub use gateway::{GatewayError, MarketDataGateway};
pub use optimizer::{FrontierPoint, MeanVarianceProblem, OptimizationEngine, OptimizationResult};
pub use portfolio::Portfolio;
pub use rebalance::{RebalancingPlanner, RiskProfile, TradeInstruction};
pub use risk::{RiskCalculator, RiskMetrics};
pub use scenario::{CrashSimulator, ScenarioResult};
pub use store::{PortfolioManager, SqliteStore};
pub use types::{Allocation, Currency, Holding, PricePoint};
pub use valuation::{Valuation, ValuationEngine};
