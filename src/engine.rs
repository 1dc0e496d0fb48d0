//! One portfolio computation: snapshot, valuation, optimization, rebalancing plan
//! and crash scenarios.
//!
//! All market inputs are read once, up front, through [`CacheManager::snapshot`].
//! Later stages only see that snapshot, so risk metrics and optimizer inputs always
//! come from the same data. A failing stage is recorded in the report and the
//! stages that do not depend on it still run.

use crate::cache::{CacheManager, MarketSnapshot, RateQuote};
use crate::config::EngineConfig;
use crate::error::{PortfolioError, Result};
use crate::optimizer::{OptimizationEngine, OptimizationResult, SharpeSolver, Suggestion};
use crate::portfolio::Portfolio;
use crate::rebalance::{RebalancingPlanner, ScoreInput, TradeInstruction};
use crate::risk::RiskCalculator;
use crate::scenario::{CrashSimulator, FxStressResult, ScenarioContext, ScenarioResult};
use crate::store::HistorySnapshot;
use crate::types::{Allocation, Currency, PricePoint};
use crate::valuation::{Valuation, ValuationEngine};
use chrono::{DateTime, NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where rebalancing targets come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TargetStrategy {
    #[default]
    MaxSharpe,
    MinVolatility,
    /// `sharpe^a / σ^b` scores.
    SharpeScore,
    /// Inverse volatility with the configured risk profile.
    InverseVolatility,
}

impl TargetStrategy {
    fn needs_optimizer(&self) -> bool {
        matches!(self, TargetStrategy::MaxSharpe | TargetStrategy::MinVolatility)
    }
}

/// Equity and USD/JPY shocks, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FxShock {
    pub equity_pct: f64,
    pub fx_pct: f64,
}

/// Per-run options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// Refresh every field before the run, ignoring TTLs.
    pub force_refresh: bool,
    pub target: TargetStrategy,
    /// Overrides `optimizer.frontier_points`.
    pub frontier_points: Option<usize>,
    /// Overrides `rebalance.min_trade_value`.
    pub min_trade_value: Option<f64>,
    /// Overrides `scenario.shocks_pct`.
    pub shocks_pct: Option<Vec<f64>>,
    pub fx_stress: Option<FxShock>,
    pub show_progress: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            target: TargetStrategy::default(),
            frontier_points: None,
            min_trade_value: None,
            shocks_pct: None,
            fx_stress: None,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Valuation,
    Optimization,
    Rebalancing,
    Scenario,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Valuation => "valuation",
            Stage::Optimization => "optimization",
            Stage::Rebalancing => "rebalancing",
            Stage::Scenario => "scenario",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: String,
}

/// Everything one run produced, plus what it could not use.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioReport {
    pub run_id: Uuid,
    pub portfolio: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub risk_free_rate: RateQuote,
    pub usd_jpy: RateQuote,
    /// Currency of trade amounts and scenario value changes.
    pub base_currency: Currency,
    /// `SYMBOL.field` entries served from stale cache values.
    pub stale_fields: Vec<String>,
    /// Assets left out of some stage, with the reason.
    pub excluded: BTreeMap<String, String>,
    pub valuation: Option<Valuation>,
    pub current: Option<Allocation>,
    pub optimization: Option<OptimizationResult>,
    pub suggestions: Vec<Suggestion>,
    pub target_strategy: TargetStrategy,
    pub target: Option<Allocation>,
    pub trades: Vec<TradeInstruction>,
    pub betas: BTreeMap<String, f64>,
    pub scenarios: Vec<ScenarioResult>,
    pub fx_stress: Option<FxStressResult>,
    pub failures: Vec<StageFailure>,
}

impl PortfolioReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        self.failures.first().map(|f| f.stage)
    }

    /// Daily history row for [`PortfolioManager`](crate::store::PortfolioManager).
    pub fn to_history_snapshot(&self) -> Option<HistorySnapshot> {
        let valuation = self.valuation.as_ref()?;
        let holdings = serde_json::to_value(&valuation.assets).ok()?;
        Some(HistorySnapshot {
            snapshot_date: self.finished_at,
            total_value_usd: valuation.total_usd,
            total_value_jpy: valuation.total_jpy,
            usd_jpy_rate: valuation.usd_jpy,
            holdings,
        })
    }
}

pub struct PortfolioEngine {
    cache: Arc<CacheManager>,
    config: EngineConfig,
    optimizer: OptimizationEngine,
    planner: RebalancingPlanner,
    simulator: CrashSimulator,
}

impl PortfolioEngine {
    pub fn new(cache: Arc<CacheManager>, config: EngineConfig) -> Self {
        let calculator = RiskCalculator::from_settings(&config.risk);
        let optimizer =
            OptimizationEngine::new(config.optimizer.clone()).with_calculator(calculator);
        let planner = RebalancingPlanner::new(config.rebalance.clone());
        let simulator = CrashSimulator::new(config.scenario.clone())
            .with_trading_days(config.risk.trading_days);
        Self {
            cache,
            config,
            optimizer,
            planner,
            simulator,
        }
    }

    /// Use `solver` for the maximum-Sharpe stage.
    pub fn with_solver(mut self, solver: Box<dyn SharpeSolver>) -> Self {
        self.optimizer = OptimizationEngine::new(self.config.optimizer.clone())
            .with_calculator(RiskCalculator::from_settings(&self.config.risk))
            .with_solver(solver);
        self
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn optimizer(&self) -> &OptimizationEngine {
        &self.optimizer
    }

    /// Run every stage for one portfolio.
    pub fn run(&self, portfolio: &Portfolio, options: &RunOptions) -> Result<PortfolioReport> {
        if portfolio.is_empty() {
            return Err(PortfolioError::InvalidInput(format!(
                "Portfolio '{}' has no holdings",
                portfolio.name
            )));
        }
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!("Run {} for portfolio '{}'", run_id, portfolio.name);

        let snapshot = self.take_snapshot(&portfolio.symbols(), options);
        let benchmark = self.benchmark_history(options.force_refresh);

        let mut report = PortfolioReport {
            run_id,
            portfolio: portfolio.name.clone(),
            started_at,
            finished_at: started_at,
            risk_free_rate: snapshot.risk_free_rate.clone(),
            usd_jpy: snapshot.usd_jpy.clone(),
            base_currency: portfolio.base_currency,
            stale_fields: snapshot.stale_fields(),
            excluded: BTreeMap::new(),
            valuation: None,
            current: None,
            optimization: None,
            suggestions: Vec::new(),
            target_strategy: options.target,
            target: None,
            trades: Vec::new(),
            betas: BTreeMap::new(),
            scenarios: Vec::new(),
            fx_stress: None,
            failures: Vec::new(),
        };

        let valuation = match ValuationEngine::value(portfolio, &snapshot) {
            Ok(v) => v,
            Err(e) => {
                report.fail(Stage::Valuation, &e);
                report.finished_at = Utc::now();
                return Ok(report);
            }
        };
        report.excluded.extend(valuation.excluded.clone());
        let current = match valuation.allocation() {
            Ok(a) => a,
            Err(e) => {
                report.fail(Stage::Valuation, &e);
                report.valuation = Some(valuation);
                report.finished_at = Utc::now();
                return Ok(report);
            }
        };

        self.optimize(&snapshot, &valuation, &current, options, &mut report);
        let base = portfolio.base_currency;
        self.rebalance(&snapshot, &valuation, &current, base, options, &mut report);
        self.stress(
            &snapshot,
            &valuation,
            &current,
            base,
            benchmark.as_deref(),
            options,
            &mut report,
        );

        report.current = Some(current);
        report.valuation = Some(valuation);
        report.finished_at = Utc::now();
        info!(
            "Run {} finished: {} trades, {} scenarios, {} failures",
            run_id,
            report.trades.len(),
            report.scenarios.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Independent runs in parallel over the shared cache. Progress bars are off.
    pub fn run_many(
        &self,
        portfolios: &[Portfolio],
        options: &RunOptions,
    ) -> Vec<Result<PortfolioReport>> {
        let mut options = options.clone();
        options.show_progress = false;
        portfolios
            .par_iter()
            .map(|portfolio| self.run(portfolio, &options))
            .collect()
    }

    fn take_snapshot(&self, symbols: &[String], options: &RunOptions) -> MarketSnapshot {
        if !options.show_progress {
            return self.cache.snapshot(symbols, options.force_refresh);
        }
        let pb = ProgressBar::new(symbols.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        let snapshot = self
            .cache
            .snapshot_with(symbols, options.force_refresh, |symbol| {
                pb.set_message(symbol.to_string());
                pb.inc(1);
            });
        pb.finish_and_clear();
        snapshot
    }

    fn benchmark_history(&self, force: bool) -> Option<Vec<PricePoint>> {
        let symbol = self.config.scenario.benchmark.as_deref()?;
        match self.cache.history(symbol, force) {
            Ok(served) => served.value().as_series().map(|s| s.to_vec()),
            Err(e) => {
                warn!("Benchmark {} unavailable, betas will be assumed: {}", symbol, e);
                None
            }
        }
    }

    fn optimize(
        &self,
        snapshot: &MarketSnapshot,
        valuation: &Valuation,
        current: &Allocation,
        options: &RunOptions,
        report: &mut PortfolioReport,
    ) {
        let assets: Vec<_> = valuation
            .assets
            .iter()
            .filter_map(|a| snapshot.get(&a.symbol))
            .collect();
        let points = options
            .frontier_points
            .unwrap_or(self.config.optimizer.frontier_points);

        match self
            .optimizer
            .optimize(&assets, snapshot.risk_free_rate.value, points)
        {
            Ok(result) => {
                for dropped in &result.dropped {
                    report
                        .excluded
                        .insert(dropped.symbol.clone(), format!("optimization: {}", dropped.reason));
                }
                report.suggestions = self.optimizer.suggestions(&result, Some(current));
                report.optimization = Some(result);
            }
            Err(e) => report.fail(Stage::Optimization, &e),
        }
    }

    fn rebalance(
        &self,
        snapshot: &MarketSnapshot,
        valuation: &Valuation,
        current: &Allocation,
        base: Currency,
        options: &RunOptions,
        report: &mut PortfolioReport,
    ) {
        let target = if options.target.needs_optimizer() {
            let Some(result) = report.optimization.as_ref() else {
                debug!("No optimizer result; skipping rebalancing");
                return;
            };
            match options.target {
                TargetStrategy::MinVolatility => result.min_volatility.weights.clone(),
                _ => result.max_sharpe.weights.clone(),
            }
        } else {
            let inputs: Vec<ScoreInput> = valuation
                .assets
                .iter()
                .map(|a| {
                    let asset = snapshot.get(&a.symbol);
                    ScoreInput::new(
                        a.symbol.clone(),
                        asset.and_then(|s| s.sharpe),
                        asset.map(|s| s.volatility),
                    )
                })
                .collect();
            let targets = match options.target {
                TargetStrategy::SharpeScore => self.planner.sharpe_score_targets(&inputs),
                _ => self.planner.inverse_volatility_targets(&inputs),
            };
            match targets {
                Ok(t) => t,
                Err(e) => {
                    report.fail(Stage::Rebalancing, &e);
                    return;
                }
            }
        };

        let min_trade = options
            .min_trade_value
            .unwrap_or(self.config.rebalance.min_trade_value);
        match RebalancingPlanner::plan_with_prices(
            current,
            &target,
            valuation.total_in(base),
            min_trade,
            &valuation.prices_in(base),
        ) {
            Ok(trades) => report.trades = trades,
            Err(e) => report.fail(Stage::Rebalancing, &e),
        }
        report.target = Some(target);
    }

    fn stress(
        &self,
        snapshot: &MarketSnapshot,
        valuation: &Valuation,
        current: &Allocation,
        base: Currency,
        benchmark: Option<&[PricePoint]>,
        options: &RunOptions,
        report: &mut PortfolioReport,
    ) {
        if let Some(benchmark) = benchmark {
            for (symbol, _) in current.iter() {
                if let Some(asset) = snapshot.get(symbol) {
                    if let Some(beta) = aligned_beta(&asset.history, benchmark) {
                        report.betas.insert(symbol.to_string(), beta);
                    }
                }
            }
        }

        let context = ScenarioContext {
            total_value: Some(valuation.total_in(base)),
            volatilities: snapshot
                .assets
                .iter()
                .map(|(s, a)| (s.clone(), a.volatility))
                .collect(),
        };
        let shocks = options
            .shocks_pct
            .as_deref()
            .unwrap_or(self.config.scenario.shocks_pct.as_slice());
        match self
            .simulator
            .simulate_many(current, &report.betas, shocks, &context)
        {
            Ok(results) => report.scenarios = results,
            Err(e) => report.fail(Stage::Scenario, &e),
        }

        if let Some(shock) = options.fx_stress {
            match self
                .simulator
                .fx_stress(valuation, shock.equity_pct, shock.fx_pct)
            {
                Ok(result) => report.fx_stress = Some(result),
                Err(e) => report.fail(Stage::Scenario, &e),
            }
        }
    }
}

impl PortfolioReport {
    fn fail(&mut self, stage: Stage, error: &PortfolioError) {
        warn!("{} stage failed: {}", stage, error);
        self.failures.push(StageFailure {
            stage,
            error: error.to_string(),
        });
    }
}

/// Beta over the dates both series share.
fn aligned_beta(asset: &[PricePoint], benchmark: &[PricePoint]) -> Option<f64> {
    let bench: BTreeMap<NaiveDate, f64> = benchmark.iter().map(|p| (p.date, p.close)).collect();
    let (a, b): (Vec<f64>, Vec<f64>) = asset
        .iter()
        .filter_map(|p| bench.get(&p.date).map(|&c| (p.close, c)))
        .unzip();
    RiskCalculator::beta(&RiskCalculator::returns(&a), &RiskCalculator::returns(&b))
}
